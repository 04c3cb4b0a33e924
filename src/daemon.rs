//! The main coordination state machine.
//!
//! One task drives QEMU through start-up, migration into COLO replication,
//! failover and shutdown, reacting to the event queue that everything else
//! (QMP events and errors, cluster deliveries, the watchdog, operator
//! commands) feeds.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cluster::{Cluster, ClusterMessage};
use crate::commands::QmpCommands;
use crate::events::{ColodEvent, EventQueue};
use crate::peer::PeerManager;
use crate::qmp::exec_ctx::Ectx;
use crate::qmp::{QmpClient, QmpReply};
use crate::watchdog::Watchdog;
use crate::{ColodError, Result};

const PRE_SWITCHOVER_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const COLO_ENTER_TIMEOUT_MS: u64 = 10 * 1000;

/// The daemon's externally visible node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColodState {
    pub running: bool,
    pub primary: bool,
    pub replication: bool,
    pub failed: bool,
    pub peer_failover: bool,
    pub peer_failed: bool,
}

/// How the coordinator finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainExit {
    Quit,
    AutoQuit,
}

pub struct ColodContext {
    pub node_name: String,
    pub instance_name: String,
    pub base_dir: PathBuf,
    /// Peer address bound into the migration command templates.
    pub address: String,
    pub qmp_timeout_low: u64,
    pub qmp_timeout_high: u64,

    pub qmp: Rc<QmpClient>,
    pub queue: Rc<EventQueue>,
    pub peer: Rc<PeerManager>,
    pub cluster: Cluster,
    pub commands: Rc<RefCell<QmpCommands>>,
    pub watchdog: Rc<Watchdog>,

    primary: Cell<bool>,
    replication: Cell<bool>,
    failed: Cell<bool>,
    peer_failover: Cell<bool>,
    qemu_quit: Cell<bool>,
    transitioning: Cell<bool>,
    pending_action: Cell<bool>,

    raise_timeout_active: Cell<bool>,
    raise_timeout_task: RefCell<Option<JoinHandle<()>>>,
}

impl ColodContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: &str,
        instance_name: &str,
        base_dir: PathBuf,
        address: &str,
        primary_startup: bool,
        qmp_timeout_low: u64,
        qmp_timeout_high: u64,
        qmp: Rc<QmpClient>,
        queue: Rc<EventQueue>,
        peer: Rc<PeerManager>,
        cluster: Cluster,
        commands: Rc<RefCell<QmpCommands>>,
        watchdog: Rc<Watchdog>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            node_name: node_name.to_string(),
            instance_name: instance_name.to_string(),
            base_dir,
            address: address.to_string(),
            qmp_timeout_low,
            qmp_timeout_high,
            qmp,
            queue,
            peer,
            cluster,
            commands,
            watchdog,
            primary: Cell::new(primary_startup),
            replication: Cell::new(false),
            failed: Cell::new(false),
            peer_failover: Cell::new(false),
            qemu_quit: Cell::new(false),
            transitioning: Cell::new(false),
            pending_action: Cell::new(false),
            raise_timeout_active: Cell::new(false),
            raise_timeout_task: RefCell::new(None),
        });

        // a main-channel hangup means qemu is gone
        let weak = Rc::downgrade(&this);
        this.qmp.add_notify_hup(move || {
            if let Some(this) = weak.upgrade() {
                this.qemu_quit.set(true);
                this.queue.enqueue(ColodEvent::QemuQuit, "qemu quit");
            }
        });

        this
    }

    pub fn query_status(&self) -> ColodState {
        ColodState {
            running: !self.qemu_quit.get(),
            primary: self.primary.get(),
            replication: self.replication.get(),
            failed: self.failed.get(),
            peer_failover: self.peer_failover.get(),
            peer_failed: self.peer.failed(),
        }
    }

    pub fn transitioning(&self) -> bool {
        self.transitioning.get()
    }

    /// Operator entry point; rejected while an action is pending or
    /// replication is established.
    pub fn start_migration(&self) -> Result<()> {
        if self.pending_action.get() || self.replication.get() {
            return Err(ColodError::PendingActions);
        }

        self.queue
            .enqueue(ColodEvent::StartMigration, "client request");
        Ok(())
    }

    pub fn autoquit(&self) {
        self.watchdog.inc_inhibit();
        self.queue.enqueue(ColodEvent::AutoQuit, "client request");
    }

    pub fn quit(&self) {
        self.queue.enqueue(ColodEvent::Quit, "client request");
    }

    pub fn client_cont_failed(&self) {
        self.queue
            .enqueue(ColodEvent::Failed, "failed to cont qemu for a gone client");
    }

    /// Execute one QMP command. Transport failures queue a Failed event;
    /// a performed yank queues FailoverSync.
    pub async fn execute_nocheck_co(&self, command: &str) -> Result<QmpReply> {
        self.watchdog.refresh();

        let reply = match self.qmp.execute_nocheck(command).await {
            Ok(reply) => reply,
            Err(err) => {
                self.queue.enqueue(ColodEvent::Failed, &err.to_string());
                return Err(err);
            }
        };

        if let Some(message) = self.qmp.take_error() {
            self.queue.enqueue(ColodEvent::Failed, &message);
            return Err(ColodError::Fatal(message));
        }

        if reply.did_yank {
            self.queue.enqueue(ColodEvent::FailoverSync, "did yank");
        }

        Ok(reply)
    }

    pub async fn execute_co(&self, command: &str) -> Result<QmpReply> {
        let reply = self.execute_nocheck_co(command).await?;
        if reply.is_error() {
            return Err(ColodError::Qmp(format!(
                "qmp command returned error: {} {}",
                command, reply.line
            )));
        }
        Ok(reply)
    }

    /// Operator-triggered yank. Success queues FailoverSync, failure Failed.
    pub async fn yank_co(&self) -> Result<()> {
        match self.qmp.yank().await {
            Ok(()) => {
                self.queue.enqueue(ColodEvent::FailoverSync, "did yank");
                Ok(())
            }
            Err(err) => {
                self.queue.enqueue(ColodEvent::Failed, &err.to_string());
                Err(err)
            }
        }
    }

    /// Wait for a QMP event, interrupted when a critical event is queued.
    async fn qmp_event_wait_co(&self, timeout_ms: u64, matcher: &Value) -> Result<Value> {
        tokio::select! {
            biased;
            _ = self.queue.critical_wait() => {
                Err(ColodError::Interrupt(matcher.to_string()))
            }
            result = self.qmp.wait_event(timeout_ms, matcher) => result,
        }
    }

    /// Run a command sequence through an execution context. The returned
    /// context has already recorded Failed/FailoverSync events for outcomes
    /// the coordinator always reacts to; the caller inspects the rest.
    async fn execute_array_co(
        &self,
        commands: &[String],
        ignore_qmp_errors: bool,
        interruptible: bool,
    ) -> Ectx {
        self.watchdog.refresh();

        let mut ectx = Ectx::new(self.qmp.clone());
        ectx.set_ignore_yank();
        if ignore_qmp_errors {
            ectx.set_ignore_qmp_error();
        }
        if interruptible {
            let queue = self.queue.clone();
            ectx.set_interrupt_cb(move || queue.critical_pending());
        }
        ectx.run_sequence(commands).await;

        if ectx.did_yank() {
            self.queue.enqueue(ColodEvent::FailoverSync, "did yank");
        }
        if ectx.did_error() {
            let message = ectx
                .error_message()
                .unwrap_or_else(|| "qmp execution failed".to_string());
            self.queue.enqueue(ColodEvent::Failed, &message);
        }

        ectx
    }

    fn qemu_running(status: &str) -> bool {
        matches!(
            status,
            "running" | "finish-migrate" | "colo" | "prelaunch" | "paused"
        )
    }

    /// Derive (primary, replication) from qemu's own view.
    async fn qemu_query_status_co(&self) -> Result<(bool, bool)> {
        let qemu_status = self.execute_co("{\"execute\": \"query-status\"}").await?;
        let colo_status = self
            .execute_co("{\"execute\": \"query-colo-status\"}")
            .await?;

        let status = crate::json::member_member_str(&qemu_status.json, "return", "status");
        let mode = crate::json::member_member_str(&colo_status.json, "return", "mode");
        let reason = crate::json::member_member_str(&colo_status.json, "return", "reason");
        let (Some(status), Some(mode), Some(reason)) = (status, mode, reason) else {
            return Err(ColodError::Fatal(
                "Failed to parse query-status and query-colo-status output".to_string(),
            ));
        };

        if status == "inmigrate" || status == "shutdown" {
            Ok((false, false))
        } else if Self::qemu_running(status) && mode == "none" && (reason == "none" || reason == "request") {
            Ok((true, false))
        } else if Self::qemu_running(status) && mode == "primary" {
            Ok((true, true))
        } else if Self::qemu_running(status) && mode == "secondary" {
            Ok((false, true))
        } else {
            Err(ColodError::Fatal(format!(
                "Unknown qemu status: {}, {}",
                qemu_status.line, colo_status.line
            )))
        }
    }

    /// Compare qemu's view with ours; a mismatch outside a transition is a
    /// failure.
    pub async fn check_health_co(&self) -> Result<()> {
        let (primary, replication) = match self.qemu_query_status_co().await {
            Ok(status) => status,
            Err(err) => {
                self.queue.enqueue(ColodEvent::Failed, &err.to_string());
                return Err(err);
            }
        };

        if !self.transitioning.get()
            && (self.primary.get() != primary || self.replication.get() != replication)
        {
            let message = format!(
                "qemu status mismatch: ({}, {}) Expected: ({}, {})",
                primary,
                replication,
                self.primary.get(),
                self.replication.get()
            );
            self.queue.enqueue(ColodEvent::Failed, &message);
            return Err(ColodError::Fatal(message));
        }

        Ok(())
    }

    /// Raise the QMP timeout across the STOP/RESUME bracket around a
    /// migration transition. At most one instance runs.
    pub fn raise_timeout_coroutine(self: &Rc<Self>) {
        if self.raise_timeout_active.get() {
            return;
        }
        self.raise_timeout_active.set(true);
        self.qmp.set_timeout(self.qmp_timeout_high);

        let ctx = self.clone();
        let task = tokio::task::spawn_local(async move {
            let bracket = async {
                ctx.qmp.wait_event(0, &json!({"event": "STOP"})).await?;
                ctx.qmp.wait_event(0, &json!({"event": "RESUME"})).await
            };
            let _ = bracket.await;
            ctx.qmp.set_timeout(ctx.qmp_timeout_low);
            ctx.raise_timeout_active.set(false);
        });
        *self.raise_timeout_task.borrow_mut() = Some(task);
    }

    pub fn raise_timeout_coroutine_free(&self) {
        if let Some(task) = self.raise_timeout_task.borrow_mut().take() {
            task.abort();
        }
        if self.raise_timeout_active.get() {
            self.qmp.set_timeout(self.qmp_timeout_low);
            self.raise_timeout_active.set(false);
        }
    }

    async fn stop_co(&self) -> Result<()> {
        self.execute_co("{\"execute\": \"stop\"}").await?;
        Ok(())
    }

    /// Execute the failover: yank the QMP connection free, then run the
    /// primary or secondary failover commands with QMP errors ignored.
    async fn failover_co(self: &Rc<Self>) -> ColodEvent {
        if let Err(err) = self.qmp.yank().await {
            error!("{}", err);
            return ColodEvent::Failed;
        }

        let commands = if self.primary.get() {
            self.commands.borrow().get_failover_primary()
        } else {
            self.commands.borrow().get_failover_secondary()
        };
        let commands = match commands {
            Ok(commands) => commands,
            Err(err) => {
                error!("{}", err);
                return ColodEvent::Failed;
            }
        };

        self.transitioning.set(true);
        let ectx = self.execute_array_co(&commands, true, false).await;
        self.transitioning.set(false);

        if ectx.failed() {
            ectx.log_error();
            return ColodEvent::Failed;
        }

        ColodEvent::DidFailover
    }

    /// Locally initiated failover: broadcast FAILOVER and wait for the
    /// cluster to arbitrate.
    async fn failover_sync_co(self: &Rc<Self>) -> ColodEvent {
        self.cluster.send(ClusterMessage::Failover);

        loop {
            let event = self.queue.wait().await;
            if event == ColodEvent::FailoverWin || event == ColodEvent::PeerFailed {
                break;
            }
            if event.is_critical() && event.escalates() {
                return event;
            }
        }

        self.failover_co().await
    }

    /// Migration step outcome handling shared by the error paths.
    async fn migration_tail(self: &Rc<Self>, trigger: ColodEvent) -> Option<ColodEvent> {
        // cancel the migration before failing over
        match self.execute_co("{\"execute\": \"migrate_cancel\"}").await {
            Ok(_) => {}
            Err(err) => {
                error!("{}", err);
                return Some(ColodEvent::Failed);
            }
        }

        debug_assert!(trigger.is_failover());
        let event = if trigger == ColodEvent::FailoverSync {
            self.failover_sync_co().await
        } else {
            self.failover_co().await
        };
        Some(event)
    }

    /// A QMP-level error during migration is a failover trigger, not fatal.
    async fn migration_qmp_error(self: &Rc<Self>, err: ColodError) -> Option<ColodEvent> {
        if err.is_interrupt() {
            debug_assert!(self.queue.critical_pending());
            let event = self.queue.wait().await;
            if event.is_failover() {
                return self.migration_tail(event).await;
            }
            return Some(event);
        }

        error!("{}", err);
        self.migration_tail(ColodEvent::PeerFailed).await
    }

    /// A critical event arrived between migration steps.
    async fn migration_handle_event(self: &Rc<Self>) -> Option<ColodEvent> {
        debug_assert!(self.queue.critical_pending());
        let event = self.queue.wait().await;
        if event.is_failover() {
            return self.migration_tail(event).await;
        }
        Some(event)
    }

    /// Drive the whole migration into COLO. Returns None once replication is
    /// established, otherwise the event to escalate.
    async fn start_migration_co(self: &Rc<Self>) -> Option<ColodEvent> {
        match self
            .execute_co(
                "{\"execute\": \"migrate-set-capabilities\", \"arguments\": {\"capabilities\": [{\"capability\": \"events\", \"state\": true}, {\"capability\": \"pause-before-switchover\", \"state\": true}]}}",
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_qmp() => return self.migration_qmp_error(err).await,
            Err(err) => {
                error!("{}", err);
                return Some(ColodEvent::Failed);
            }
        }
        if self.queue.critical_pending() {
            return self.migration_handle_event().await;
        }

        if let Err(err) = self
            .qmp_event_wait_co(
                PRE_SWITCHOVER_TIMEOUT_MS,
                &json!({"event": "MIGRATION", "data": {"status": "pre-switchover"}}),
            )
            .await
        {
            return self.migration_qmp_error(err).await;
        }

        let commands = match self.commands.borrow().get_migration_start(&self.address) {
            Ok(commands) => commands,
            Err(err) => {
                error!("{}", err);
                return Some(ColodEvent::Failed);
            }
        };
        let ectx = self.execute_array_co(&commands, false, true).await;
        if ectx.did_interrupt() {
            return self.migration_handle_event().await;
        }
        if ectx.did_error() {
            ectx.log_error();
            return Some(ColodEvent::Failed);
        }
        if ectx.failed() {
            let message = ectx.error_message().unwrap_or_default();
            return self.migration_qmp_error(ColodError::Qmp(message)).await;
        }
        if self.queue.critical_pending() {
            return self.migration_handle_event().await;
        }

        self.raise_timeout_coroutine();

        match self
            .execute_co(
                "{\"execute\": \"migrate-continue\", \"arguments\": {\"state\": \"pre-switchover\"}}",
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_qmp() => {
                self.qmp.set_timeout(self.qmp_timeout_low);
                return self.migration_qmp_error(err).await;
            }
            Err(err) => {
                self.qmp.set_timeout(self.qmp_timeout_low);
                error!("{}", err);
                return Some(ColodEvent::Failed);
            }
        }
        if self.queue.critical_pending() {
            self.qmp.set_timeout(self.qmp_timeout_low);
            return self.migration_handle_event().await;
        }

        self.transitioning.set(true);
        let result = self
            .qmp_event_wait_co(
                COLO_ENTER_TIMEOUT_MS,
                &json!({"event": "MIGRATION", "data": {"status": "colo"}}),
            )
            .await;
        self.transitioning.set(false);
        if let Err(err) = result {
            self.qmp.set_timeout(self.qmp_timeout_low);
            return self.migration_qmp_error(err).await;
        }

        None
    }

    /// Secondary start-up: wait for the incoming migration to finish.
    async fn replication_wait_co(self: &Rc<Self>) -> Option<ColodEvent> {
        match self
            .execute_co(
                "{\"execute\": \"migrate-set-capabilities\", \"arguments\": {\"capabilities\": [{\"capability\": \"events\", \"state\": true}]}}",
            )
            .await
        {
            Ok(_) => {}
            Err(err) => {
                error!("{}", err);
                return Some(ColodEvent::Failed);
            }
        }

        loop {
            self.transitioning.set(true);
            let result = self.qmp_event_wait_co(0, &json!({"event": "RESUME"})).await;
            self.transitioning.set(false);

            match result {
                Ok(_) => break,
                Err(_) => {
                    debug_assert!(self.queue.pending());
                    let event = self.queue.wait().await;
                    if event.is_critical() && event.escalates() {
                        return Some(event);
                    }
                    continue;
                }
            }
        }

        self.raise_timeout_coroutine();
        None
    }

    /// Steady-state replication: wait for whatever ends it.
    async fn replication_running_co(self: &Rc<Self>) -> ColodEvent {
        loop {
            let event = self.queue.wait().await;
            if event == ColodEvent::FailoverSync {
                return self.failover_sync_co().await;
            } else if event == ColodEvent::PeerFailed {
                return self.failover_co().await;
            } else if event.is_critical() && event.escalates() {
                return event;
            }
        }
    }

    /// Escalated failure sink: broadcast FAILED, stop qemu best-effort and
    /// drain events until told to quit.
    async fn failed_sink(self: &Rc<Self>, trigger: ColodEvent) -> MainExit {
        self.qmp.set_timeout(self.qmp_timeout_low);
        if let Some(message) = self.qmp.take_error() {
            error!("qemu failed: {}", message);
        }

        self.failed.set(true);
        self.cluster.send(ClusterMessage::Failed);

        if trigger == ColodEvent::PeerFailover {
            self.peer_failover.set(true);
        }
        if trigger != ColodEvent::QemuQuit {
            if let Err(err) = self.stop_co().await {
                if trigger == ColodEvent::PeerFailover {
                    error!(
                        "Failed to stop qemu in response to peer failover: {}",
                        err
                    );
                }
            }
        }

        loop {
            match self.queue.wait().await {
                ColodEvent::PeerFailover => self.peer_failover.set(true),
                ColodEvent::Quit => return MainExit::Quit,
                ColodEvent::AutoQuit => {
                    if self.qemu_quit.get() {
                        return MainExit::AutoQuit;
                    }
                    return self.autoquit_sink().await;
                }
                _ => {}
            }
        }
    }

    /// Auto-quit requested: hang on until qemu goes away, then exit.
    async fn autoquit_sink(self: &Rc<Self>) -> MainExit {
        self.failed.set(true);
        self.cluster.send(ClusterMessage::Failed);

        loop {
            match self.queue.wait().await {
                ColodEvent::PeerFailover => self.peer_failover.set(true),
                ColodEvent::Quit => return MainExit::Quit,
                ColodEvent::QemuQuit => return MainExit::AutoQuit,
                _ => {}
            }
        }
    }

    /// The coordinator main loop.
    pub async fn run(self: &Rc<Self>) -> MainExit {
        if !self.primary.get() {
            info!("starting in secondary mode");

            loop {
                if let Some(event) = self.replication_wait_co().await {
                    debug_assert!(event.escalates());
                    if event.is_failure() {
                        return self.failed_sink(event).await;
                    } else if event == ColodEvent::Quit {
                        return MainExit::Quit;
                    } else if event == ColodEvent::AutoQuit {
                        return self.autoquit_sink().await;
                    } else if event == ColodEvent::DidFailover {
                        break;
                    }
                    continue;
                }
                self.replication.set(true);

                let event = self.replication_running_co().await;
                debug_assert!(event.escalates());
                if event.is_failure() {
                    return self.failed_sink(event).await;
                } else if event == ColodEvent::Quit {
                    return MainExit::Quit;
                } else if event == ColodEvent::AutoQuit {
                    return self.autoquit_sink().await;
                } else if event == ColodEvent::DidFailover {
                    break;
                }
                unreachable!("unexpected event {:?} from replication", event);
            }
        } else {
            info!("starting in primary mode");
        }

        // now running primary standalone
        self.primary.set(true);
        self.replication.set(false);

        loop {
            let event = self.queue.wait().await;
            if event == ColodEvent::StartMigration {
                self.pending_action.set(true);
                let result = self.start_migration_co().await;
                self.pending_action.set(false);

                if let Some(event) = result {
                    debug_assert!(event.escalates());
                    if event.is_failure() {
                        return self.failed_sink(event).await;
                    } else if event == ColodEvent::Quit {
                        return MainExit::Quit;
                    } else if event == ColodEvent::AutoQuit {
                        return self.autoquit_sink().await;
                    } else if event == ColodEvent::DidFailover {
                        continue;
                    }
                    continue;
                }
                self.replication.set(true);

                let event = self.replication_running_co().await;
                debug_assert!(event.escalates());
                if event.is_failure() {
                    return self.failed_sink(event).await;
                } else if event == ColodEvent::Quit {
                    return MainExit::Quit;
                } else if event == ColodEvent::AutoQuit {
                    return self.autoquit_sink().await;
                } else if event == ColodEvent::DidFailover {
                    self.replication.set(false);
                    continue;
                }
                unreachable!("unexpected event {:?} from replication", event);
            } else if event.is_failure() {
                // a peer failover while standalone does not matter
                if event != ColodEvent::PeerFailover {
                    return self.failed_sink(event).await;
                }
            } else if event == ColodEvent::Quit {
                return MainExit::Quit;
            } else if event == ColodEvent::AutoQuit {
                return self.autoquit_sink().await;
            }
        }
    }
}
