//! Peer manager: derives the other node's state from cluster deliveries and
//! arbitrates who wins a failover race.
//!
//! Both daemons broadcast FAILOVER when they want to take over. Total-order
//! delivery picks the winner: the first message in the order makes its sender
//! win. The loser sees the winner's message first (queuing a critical
//! PeerFailover), so by the time its own echo arrives it is already headed
//! for the failed sink and the FailoverWin it queues is drained unused.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::error;

use crate::cluster::{Cluster, ClusterMessage};
use crate::events::{ColodEvent, EventQueue};

const FAILOVER_WIN_CLEAR_MS: u64 = 60 * 1000;

pub struct PeerManager {
    queue: Rc<EventQueue>,
    peer_name: RefCell<String>,
    failed: Cell<bool>,
    yellow: Cell<bool>,
    failed_over: Cell<bool>,
    failover_win: Cell<bool>,
}

impl PeerManager {
    pub fn new(queue: Rc<EventQueue>, cluster: &Cluster) -> Rc<Self> {
        let this = Rc::new(Self {
            queue,
            peer_name: RefCell::new(String::new()),
            failed: Cell::new(false),
            yellow: Cell::new(false),
            failed_over: Cell::new(false),
            failover_win: Cell::new(false),
        });

        let weak = Rc::downgrade(&this);
        cluster.add_notify(move |message, from_self, peer_left| {
            if let Some(this) = weak.upgrade() {
                this.on_cluster(message, from_self, peer_left);
            }
        });

        this
    }

    fn on_cluster(
        self: &Rc<Self>,
        message: Option<ClusterMessage>,
        from_self: bool,
        peer_left: bool,
    ) {
        if peer_left {
            error!("Peer failed");
            self.failed.set(true);
            self.queue
                .enqueue(ColodEvent::PeerFailed, "peer left the group");
            return;
        }

        let Some(message) = message else {
            return;
        };

        match message {
            ClusterMessage::Failover => {
                if from_self {
                    self.failover_win.set(true);
                    self.queue
                        .enqueue(ColodEvent::FailoverWin, "own failover message delivered");
                    self.start_clear_timer();
                } else if self.failover_win.get() {
                    // the peer's message is the echo of a lost race
                    self.failover_win.set(false);
                } else {
                    self.failed_over.set(true);
                    self.queue
                        .enqueue(ColodEvent::PeerFailover, "peer failed over");
                }
            }
            _ if from_self => {}
            ClusterMessage::Failed => {
                error!("Peer failed");
                self.failed.set(true);
                self.queue.enqueue(ColodEvent::PeerFailed, "got FAILED message");
            }
            ClusterMessage::Yellow => {
                self.yellow.set(true);
                self.queue.enqueue(ColodEvent::Yellow, "peer went yellow");
            }
            ClusterMessage::Unyellow => {
                self.yellow.set(false);
                self.queue.enqueue(ColodEvent::Yellow, "peer left yellow");
            }
            // reserved message kinds, ignored on receive
            _ => {}
        }
    }

    /// After a won race the flag lingers so a concurrent initiation by the
    /// peer is recognised as the echo of its loss. Clear it once the window
    /// has safely passed.
    fn start_clear_timer(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(FAILOVER_WIN_CLEAR_MS)).await;
            if let Some(this) = weak.upgrade() {
                this.failover_win.set(false);
            }
        });
    }

    pub fn set_peer(&self, peer: &str) {
        *self.peer_name.borrow_mut() = peer.to_string();
        self.failed.set(false);
        self.yellow.set(false);
        self.failed_over.set(false);
    }

    pub fn clear_peer(&self) {
        self.set_peer("");
    }

    /// Empty name means "no peer configured".
    pub fn peer(&self) -> String {
        self.peer_name.borrow().clone()
    }

    pub fn failed(&self) -> bool {
        self.failed.get()
    }

    pub fn set_failed(&self) {
        self.failed.set(true);
    }

    pub fn clear_failed(&self) {
        self.failed.set(false);
    }

    pub fn yellow(&self) -> bool {
        self.yellow.get()
    }

    pub fn failed_over(&self) -> bool {
        self.failed_over.get()
    }

    #[cfg(test)]
    fn failover_win(&self) -> bool {
        self.failover_win.get()
    }
}
