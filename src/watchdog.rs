//! QEMU liveness watchdog.
//!
//! Ordinary QMP traffic refreshes the deadline; the timer only pings QEMU
//! itself when the connection has been idle for a whole interval. A failed
//! ping queues a Failed event. An interval of 0 disables the watchdog.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::events::{ColodEvent, EventQueue};
use crate::qmp::QmpClient;

pub struct Watchdog {
    interval_ms: u64,
    inhibit: Cell<u32>,
    refreshed: Cell<Instant>,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(interval_ms: u64) -> Rc<Self> {
        Rc::new(Self {
            interval_ms,
            inhibit: Cell::new(0),
            refreshed: Cell::new(Instant::now()),
            task: RefCell::new(None),
        })
    }

    pub fn start(self: &Rc<Self>, qmp: Rc<QmpClient>, queue: Rc<EventQueue>) {
        if self.interval_ms == 0 {
            return;
        }

        let this = self.clone();
        let task = tokio::task::spawn_local(async move {
            let interval = Duration::from_millis(this.interval_ms);
            loop {
                tokio::time::sleep(interval).await;

                if this.inhibit.get() > 0 {
                    continue;
                }
                if this.refreshed.get().elapsed() < interval {
                    continue;
                }

                if let Err(err) = qmp.execute("{\"execute\": \"query-status\"}").await {
                    queue.enqueue(ColodEvent::Failed, &format!("watchdog: {}", err));
                    return;
                }
                this.refreshed.set(Instant::now());
            }
        });
        *self.task.borrow_mut() = Some(task);
    }

    /// Record QMP traffic so the watchdog does not ping a busy connection.
    pub fn refresh(&self) {
        self.refreshed.set(Instant::now());
    }

    pub fn inc_inhibit(&self) {
        self.inhibit.set(self.inhibit.get() + 1);
    }

    pub fn dec_inhibit(&self) {
        debug_assert!(self.inhibit.get() > 0);
        self.inhibit.set(self.inhibit.get().saturating_sub(1));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
        }
    }
}
