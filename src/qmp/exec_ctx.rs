//! Execution context: runs an ordered sequence of QMP commands under an
//! explicit error policy and collects what happened.
//!
//! Every outcome must be inspected before the context is dropped; dropping
//! an uninspected context is a programming error caught by a debug
//! assertion.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{error, warn};

use super::{QmpClient, QmpReply};

pub struct Ectx {
    qmp: Rc<QmpClient>,

    ignore_qmp_error: bool,
    ignore_yank: bool,
    interrupt_cb: Option<Box<dyn Fn() -> bool>>,

    did_yank: Cell<bool>,
    did_error: Cell<bool>,
    did_qmp_error: Cell<bool>,
    did_interrupt: Cell<bool>,
    first_error: RefCell<Option<String>>,
    first_qmp_error: RefCell<Option<String>>,
    unchecked: Cell<bool>,
}

impl Ectx {
    pub fn new(qmp: Rc<QmpClient>) -> Self {
        Self {
            qmp,
            ignore_qmp_error: false,
            ignore_yank: false,
            interrupt_cb: None,
            did_yank: Cell::new(false),
            did_error: Cell::new(false),
            did_qmp_error: Cell::new(false),
            did_interrupt: Cell::new(false),
            first_error: RefCell::new(None),
            first_qmp_error: RefCell::new(None),
            unchecked: Cell::new(false),
        }
    }

    /// QMP-level errors are recorded and logged but do not abort the
    /// sequence.
    pub fn set_ignore_qmp_error(&mut self) {
        self.ignore_qmp_error = true;
    }

    /// A recorded yank does not make `failed()` return true.
    pub fn set_ignore_yank(&mut self) {
        self.ignore_yank = true;
    }

    /// Called before each step; returning true halts the sequence.
    pub fn set_interrupt_cb(&mut self, callback: impl Fn() -> bool + 'static) {
        self.interrupt_cb = Some(Box::new(callback));
    }

    fn failed_raw(&self) -> bool {
        (!self.ignore_yank && self.did_yank.get())
            || self.did_error.get()
            || (!self.ignore_qmp_error && self.did_qmp_error.get())
            || self.did_interrupt.get()
    }

    /// True if something happened that the policy does not ignore.
    pub fn failed(&self) -> bool {
        self.unchecked.set(false);
        self.failed_raw()
    }

    /// True if any error, yank or interrupt happened, ignored or not.
    pub fn did_any(&self) -> bool {
        self.unchecked.set(false);
        self.did_yank.get()
            || self.did_error.get()
            || self.did_qmp_error.get()
            || self.did_interrupt.get()
    }

    pub fn did_yank(&self) -> bool {
        self.unchecked.set(false);
        self.did_yank.get()
    }

    pub fn did_error(&self) -> bool {
        self.unchecked.set(false);
        self.did_error.get()
    }

    pub fn did_qmp_error(&self) -> bool {
        self.unchecked.set(false);
        self.did_qmp_error.get()
    }

    pub fn did_interrupt(&self) -> bool {
        self.unchecked.set(false);
        self.did_interrupt.get()
    }

    /// The first recorded failure, transport errors first.
    pub fn error_message(&self) -> Option<String> {
        self.unchecked.set(false);
        if let Some(message) = self.first_error.borrow().as_ref() {
            return Some(message.clone());
        }
        if let Some(message) = self.first_qmp_error.borrow().as_ref() {
            return Some(message.clone());
        }
        if self.did_yank.get() {
            return Some("did yank".to_string());
        }
        if self.did_interrupt.get() {
            return Some("did interrupt".to_string());
        }
        None
    }

    pub fn log_error(&self) {
        if let Some(message) = self.error_message() {
            error!("{}", message);
        }
    }

    /// Run one command under the policy. Returns the reply unless the step
    /// was skipped or failed.
    pub async fn run(&self, command: &str) -> Option<QmpReply> {
        self.unchecked.set(true);

        if let Some(callback) = &self.interrupt_cb {
            if callback() {
                self.did_interrupt.set(true);
            }
        }

        if self.failed_raw() {
            return None;
        }

        match self.qmp.execute(command).await {
            Ok(reply) => {
                if reply.did_yank {
                    self.did_yank.set(true);
                }
                Some(reply)
            }
            Err(err) if err.is_qmp() => {
                if self.first_qmp_error.borrow().is_none() {
                    *self.first_qmp_error.borrow_mut() = Some(err.to_string());
                    self.did_qmp_error.set(true);
                }
                if !self.failed_raw() {
                    warn!("Ignoring qmp error: {}", err);
                }
                None
            }
            Err(err) => {
                if self.first_error.borrow().is_none() {
                    *self.first_error.borrow_mut() = Some(err.to_string());
                    self.did_error.set(true);
                }
                None
            }
        }
    }

    /// Run a whole sequence; aborts early once a non-ignored outcome fires.
    pub async fn run_sequence(&self, commands: &[String]) {
        for command in commands {
            let _ = self.run(command).await;
        }
    }

    /// Explicit yank through this context. Requires `ignore_yank`, because
    /// the yank is intentional here.
    pub async fn yank(&self) {
        debug_assert!(self.ignore_yank);
        self.unchecked.set(true);
        self.did_yank.set(true);

        if let Err(err) = self.qmp.yank().await {
            if self.first_error.borrow().is_none() {
                *self.first_error.borrow_mut() = Some(err.to_string());
                self.did_error.set(true);
            }
        }
    }
}

impl Drop for Ectx {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                !self.unchecked.get(),
                "execution context dropped with its outcome unchecked"
            );
        }
    }
}
