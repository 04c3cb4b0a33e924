//! The coordinator's event queue: two FIFOs (critical and ordinary) with
//! rate-limit dedup at enqueue and a wakeup notifier.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::pin;

use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColodEvent {
    Failed,
    QemuQuit,
    PeerFailover,
    FailoverSync,
    PeerFailed,
    FailoverWin,
    Quit,
    AutoQuit,
    Yellow,
    StartMigration,
    DidFailover,
}

impl ColodEvent {
    /// Critical events are drained before ordinary ones.
    pub fn is_critical(self) -> bool {
        !matches!(
            self,
            ColodEvent::FailoverWin
                | ColodEvent::Yellow
                | ColodEvent::StartMigration
                | ColodEvent::DidFailover
        )
    }

    /// Whether an inner event-pump may return this event to its caller.
    pub fn escalates(self) -> bool {
        !matches!(
            self,
            ColodEvent::FailoverSync | ColodEvent::PeerFailed | ColodEvent::FailoverWin
        )
    }

    /// Events that send the coordinator to the failed sink.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ColodEvent::Failed | ColodEvent::QemuQuit | ColodEvent::PeerFailover
        )
    }

    /// Events that trigger a failover.
    pub fn is_failover(self) -> bool {
        matches!(self, ColodEvent::FailoverSync | ColodEvent::PeerFailed)
    }
}

#[derive(Default)]
pub struct EventQueue {
    critical: RefCell<VecDeque<ColodEvent>>,
    ordinary: RefCell<VecDeque<ColodEvent>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: ColodEvent, reason: &str) {
        trace!("queued {:?} ({})", event, reason);

        let queue = if event.is_critical() {
            &self.critical
        } else {
            &self.ordinary
        };
        let mut queue = queue.borrow_mut();

        // ratelimit: collapse back-to-back duplicates
        if queue.back() == Some(&event) {
            trace!("ratelimiting events");
            return;
        }

        let was_empty = queue.is_empty();
        queue.push_back(event);
        drop(queue);

        if was_empty {
            self.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> bool {
        !self.critical.borrow().is_empty() || !self.ordinary.borrow().is_empty()
    }

    pub fn critical_pending(&self) -> bool {
        !self.critical.borrow().is_empty()
    }

    pub(crate) fn try_dequeue(&self) -> Option<ColodEvent> {
        if let Some(event) = self.critical.borrow_mut().pop_front() {
            return Some(event);
        }
        self.ordinary.borrow_mut().pop_front()
    }

    /// Wait for the next event, critical queue first.
    pub async fn wait(&self) -> ColodEvent {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(event) = self.try_dequeue() {
                trace!("got {:?}", event);
                return event;
            }
            notified.await;
        }
    }

    /// Resolve once a critical event is pending. Used to interrupt QMP event
    /// waits so the coordinator can handle the critical queue.
    pub async fn critical_wait(&self) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.critical_pending() {
                return;
            }
            notified.await;
        }
    }
}
