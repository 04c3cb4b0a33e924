//! QMP client.
//!
//! QEMU exports two QMP sockets: the main channel for ordinary commands and
//! a second channel reserved for out-of-band yank, so a stuck main channel
//! can always be recovered. Each channel gets its own capability handshake
//! (with `oob` enabled), a serialisation lock covering one whole
//! request/response exchange, and a long-lived reader task that routes every
//! incoming line: events to registered listeners, anything else to the
//! in-flight requester.
//!
//! If a main-channel response does not arrive within the current timeout,
//! the client runs yank recovery over the yank channel and then retries the
//! read once; the eventual reply carries `did_yank` so callers can react.

pub mod exec_ctx;

use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use serde_json::{json, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::channel::{self, LineReader};
use crate::json::{has_member, member_member_str, object_matches, object_matches_match_array};
use crate::{ColodError, Result};

/// One reply line from QEMU, parsed. `did_yank` reports that an out-of-band
/// yank was performed while this reply was awaited.
#[derive(Debug, Clone)]
pub struct QmpReply {
    pub line: String,
    pub json: Value,
    pub did_yank: bool,
}

impl QmpReply {
    pub fn is_error(&self) -> bool {
        has_member(&self.json, "error")
    }

    pub fn error_class(&self) -> Option<&str> {
        member_member_str(&self.json, "error", "class")
    }

    pub fn return_member(&self) -> Option<&Value> {
        self.json.get("return")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Main,
    Yank,
}

struct QmpChannel {
    /// Serialisation lock: holds the write half for the duration of one
    /// request/response exchange.
    lock: Mutex<OwnedWriteHalf>,
    /// Response slot for the request currently in flight.
    resp: RefCell<Option<oneshot::Sender<(String, Value)>>>,
    /// The yank channel drops events instead of dispatching them.
    discard_events: bool,
    fd: RawFd,
}

struct EventWaiter {
    id: u64,
    matcher: Value,
    tx: Option<oneshot::Sender<Value>>,
}

pub struct QmpClient {
    timeout: Cell<u64>,
    main: QmpChannel,
    yank_channel: QmpChannel,
    yank_instances: RefCell<Value>,
    event_waiters: RefCell<Vec<EventWaiter>>,
    next_waiter_id: Cell<u64>,
    hup_callbacks: RefCell<Vec<Rc<dyn Fn()>>>,
    qemu_gone: Cell<bool>,
    last_error: RefCell<Option<String>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

async fn handshake(
    reader: &mut LineReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    timeout_ms: u64,
) -> Result<()> {
    let greeting = reader.read_line(timeout_ms).await?;
    let greeting: Value = serde_json::from_str(&greeting)?;
    if !has_member(&greeting, "QMP") {
        return Err(ColodError::Fatal(format!(
            "Unexpected qmp greeting: {}",
            greeting
        )));
    }

    let capabilities =
        "{\"execute\": \"qmp_capabilities\", \"arguments\": {\"enable\": [\"oob\"]}}\n";
    channel::write_all(writer, capabilities.as_bytes(), timeout_ms).await?;

    // events cannot arrive before capability negotiation completes
    let reply = reader.read_line(timeout_ms).await?;
    let reply: Value = serde_json::from_str(&reply)?;
    if has_member(&reply, "error") {
        return Err(ColodError::Fatal(format!("qmp_capabilities: {}", reply)));
    }

    Ok(())
}

impl QmpClient {
    /// Connect both channels, run their handshakes and start the reader
    /// tasks.
    pub async fn new(
        stream: UnixStream,
        yank_stream: UnixStream,
        timeout_ms: u64,
    ) -> Result<Rc<Self>> {
        let main_fd = stream.as_raw_fd();
        let yank_fd = yank_stream.as_raw_fd();

        let (read_half, mut main_writer) = stream.into_split();
        let mut main_reader = LineReader::new(read_half);
        let (read_half, mut yank_writer) = yank_stream.into_split();
        let mut yank_reader = LineReader::new(read_half);

        handshake(&mut main_reader, &mut main_writer, timeout_ms)
            .await
            .map_err(|e| ColodError::Fatal(format!("qmp: {}", e)))?;
        handshake(&mut yank_reader, &mut yank_writer, timeout_ms)
            .await
            .map_err(|e| ColodError::Fatal(format!("qmp yank: {}", e)))?;

        let client = Rc::new(Self {
            timeout: Cell::new(timeout_ms),
            main: QmpChannel {
                lock: Mutex::new(main_writer),
                resp: RefCell::new(None),
                discard_events: false,
                fd: main_fd,
            },
            yank_channel: QmpChannel {
                lock: Mutex::new(yank_writer),
                resp: RefCell::new(None),
                discard_events: true,
                fd: yank_fd,
            },
            yank_instances: RefCell::new(json!([])),
            event_waiters: RefCell::new(Vec::new()),
            next_waiter_id: Cell::new(0),
            hup_callbacks: RefCell::new(Vec::new()),
            qemu_gone: Cell::new(false),
            last_error: RefCell::new(None),
            tasks: RefCell::new(Vec::new()),
        });

        let main_task = tokio::task::spawn_local(Self::reader_task(
            Rc::downgrade(&client),
            main_reader,
            ChannelKind::Main,
        ));
        let yank_task = tokio::task::spawn_local(Self::reader_task(
            Rc::downgrade(&client),
            yank_reader,
            ChannelKind::Yank,
        ));
        client.tasks.borrow_mut().push(main_task);
        client.tasks.borrow_mut().push(yank_task);

        Ok(client)
    }

    fn channel(&self, kind: ChannelKind) -> &QmpChannel {
        match kind {
            ChannelKind::Main => &self.main,
            ChannelKind::Yank => &self.yank_channel,
        }
    }

    async fn reader_task(
        client: Weak<QmpClient>,
        mut reader: LineReader<OwnedReadHalf>,
        kind: ChannelKind,
    ) {
        loop {
            let line = match reader.read_line(0).await {
                Ok(line) => line,
                Err(err) => {
                    let Some(client) = client.upgrade() else {
                        return;
                    };
                    if kind == ChannelKind::Main {
                        if !err.is_eof() {
                            *client.last_error.borrow_mut() = Some(err.to_string());
                        }
                        client.notify_hup();
                    }
                    return;
                }
            };

            let Some(client) = client.upgrade() else {
                return;
            };
            client.handle_line(kind, line);
        }
    }

    fn handle_line(&self, kind: ChannelKind, line: String) {
        let channel = self.channel(kind);

        let json: Value = match serde_json::from_str::<Value>(&line) {
            Ok(json) if json.is_object() => json,
            _ => {
                error!("Not a json object: {}", line);
                *self.last_error.borrow_mut() = Some(format!("Not a json object: {}", line));
                return;
            }
        };

        if has_member(&json, "event") {
            if channel.discard_events {
                return;
            }
            if !object_matches(&json!({"event": "MIGRATION_PASS"}), &json) {
                trace!("{}", line);
            }
            self.dispatch_event(&json);
            return;
        }

        trace!("{}", line);
        match channel.resp.borrow_mut().take() {
            Some(tx) => {
                let _ = tx.send((line, json));
            }
            None => error!("Not an event: {}", line),
        }
    }

    fn dispatch_event(&self, event: &Value) {
        let mut waiters = self.event_waiters.borrow_mut();
        for waiter in waiters.iter_mut() {
            if object_matches(&waiter.matcher, event) {
                if let Some(tx) = waiter.tx.take() {
                    let _ = tx.send(event.clone());
                }
            }
        }
        waiters.retain(|waiter| waiter.tx.is_some());
    }

    fn notify_hup(&self) {
        if self.qemu_gone.replace(true) {
            return;
        }
        error!("qemu quit");
        // pending event waits resolve with an error
        self.event_waiters.borrow_mut().clear();
        let callbacks = self.hup_callbacks.borrow().clone();
        for callback in callbacks {
            callback();
        }
    }

    pub fn add_notify_hup(&self, callback: impl Fn() + 'static) {
        self.hup_callbacks.borrow_mut().push(Rc::new(callback));
    }

    pub fn qemu_gone(&self) -> bool {
        self.qemu_gone.get()
    }

    /// Asynchronously recorded failures (reader-side parse or IO errors).
    pub fn take_error(&self) -> Option<String> {
        self.last_error.borrow_mut().take()
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        debug_assert!(timeout_ms != 0);
        self.timeout.set(timeout_ms);
    }

    pub fn timeout(&self) -> u64 {
        self.timeout.get()
    }

    pub fn set_yank_instances(&self, instances: Value) {
        *self.yank_instances.borrow_mut() = instances;
    }

    async fn execute_on(
        &self,
        kind: ChannelKind,
        command: &str,
        allow_yank: bool,
    ) -> Result<QmpReply> {
        if self.qemu_gone.get() {
            return Err(ColodError::Eof);
        }

        let channel = self.channel(kind);
        let mut writer = channel.lock.lock().await;

        trace!("{}", command);
        let (tx, mut rx) = oneshot::channel();
        *channel.resp.borrow_mut() = Some(tx);

        let mut buf = Vec::with_capacity(command.len() + 1);
        buf.extend_from_slice(command.as_bytes());
        buf.push(b'\n');
        let timeout = self.timeout.get();
        if let Err(err) = channel::write_all(&mut *writer, &buf, timeout).await {
            error!("qmp: {}", err);
            channel.resp.borrow_mut().take();
            return Err(err);
        }

        let mut did_yank = false;
        loop {
            match channel::with_timeout(timeout, "Channel read timed out", &mut rx).await {
                Ok(Ok((line, json))) => {
                    return Ok(QmpReply {
                        line,
                        json,
                        did_yank,
                    });
                }
                Ok(Err(_)) => {
                    // reader task dropped the sender: channel is gone
                    channel.resp.borrow_mut().take();
                    return Err(ColodError::Eof);
                }
                Err(err) => {
                    error!("{}", err);
                    if allow_yank && !did_yank {
                        if let Err(yank_err) = Box::pin(self.yank()).await {
                            channel.resp.borrow_mut().take();
                            return Err(yank_err);
                        }
                        did_yank = true;
                        continue;
                    }
                    channel.resp.borrow_mut().take();
                    return Err(err);
                }
            }
        }
    }

    /// Execute a command on the main channel. The reply may itself be a QMP
    /// error object; use [`QmpClient::execute`] to have that turned into an
    /// error.
    pub async fn execute_nocheck(&self, command: &str) -> Result<QmpReply> {
        self.execute_on(ChannelKind::Main, command, true).await
    }

    pub async fn execute(&self, command: &str) -> Result<QmpReply> {
        let reply = self.execute_nocheck(command).await?;
        if reply.is_error() {
            return Err(ColodError::Qmp(format!(
                "qmp command returned error: {} {}",
                command, reply.line
            )));
        }
        Ok(reply)
    }

    fn pick_yank_instances(result: &Value, matches: &Value) -> String {
        let mut picked = Vec::new();
        if let Some(instances) = result.get("return").and_then(Value::as_array) {
            for instance in instances {
                if object_matches_match_array(instance, matches) {
                    picked.push(instance.clone());
                }
            }
        }
        Value::Array(picked).to_string()
    }

    /// Out-of-band yank recovery: query the yankable instances, intersect
    /// them with the configured filter and yank what is left. QEMU may have
    /// torn an instance down between the two steps; `DeviceNotFound` restarts
    /// from the query.
    pub async fn yank(&self) -> Result<()> {
        loop {
            let reply = self
                .execute_on(
                    ChannelKind::Yank,
                    "{\"exec-oob\": \"query-yank\", \"id\": \"yank0\"}",
                    false,
                )
                .await?;
            if reply.is_error() {
                return Err(ColodError::Fatal(format!(
                    "qmp query-yank: {}",
                    reply.line
                )));
            }

            let instances = Self::pick_yank_instances(&reply.json, &self.yank_instances.borrow());
            let command = format!(
                "{{\"exec-oob\": \"yank\", \"id\": \"yank0\", \"arguments\": {{\"instances\": {}}}}}",
                instances
            );

            let reply = self.execute_on(ChannelKind::Yank, &command, false).await?;
            if reply.is_error() {
                if reply.error_class() == Some("DeviceNotFound") {
                    continue;
                }
                return Err(ColodError::Fatal(format!(
                    "qmp yank: {}: {}",
                    command, reply.line
                )));
            }

            return Ok(());
        }
    }

    /// Wait for an event structurally matching `matcher`. Timeout 0 waits
    /// forever. The registration is dropped with the future, so callers may
    /// select against other wakeups.
    pub async fn wait_event(&self, timeout_ms: u64, matcher: &Value) -> Result<Value> {
        if self.qemu_gone.get() {
            return Err(ColodError::Eof);
        }

        let id = self.next_waiter_id.get();
        self.next_waiter_id.set(id + 1);
        let (tx, rx) = oneshot::channel();
        self.event_waiters.borrow_mut().push(EventWaiter {
            id,
            matcher: matcher.clone(),
            tx: Some(tx),
        });
        let _guard = WaiterGuard { client: self, id };

        let what = format!(
            "Timeout reached while waiting for qmp event: {}",
            matcher
        );
        match channel::with_timeout(timeout_ms, &what, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(ColodError::Eof),
            Err(err) => Err(err),
        }
    }

    /// Tear down both channels and stop the reader tasks.
    pub fn close(&self) {
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
        let _ = nix::sys::socket::shutdown(self.main.fd, nix::sys::socket::Shutdown::Both);
        let _ = nix::sys::socket::shutdown(self.yank_channel.fd, nix::sys::socket::Shutdown::Both);
    }
}

struct WaiterGuard<'a> {
    client: &'a QmpClient,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.client
            .event_waiters
            .borrow_mut()
            .retain(|waiter| waiter.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LineChannel;
    use std::future::Future;

    fn run_local(fut: impl Future<Output = ()>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, fut);
    }

    async fn serve_handshake(channel: &mut LineChannel) {
        channel
            .write_line(r#"{"QMP": {"version": {}, "capabilities": ["oob"]}}"#, 1000)
            .await
            .unwrap();
        let capabilities = channel.read_line(1000).await.unwrap();
        assert!(capabilities.contains("qmp_capabilities"));
        channel.write_line(r#"{"return": {}}"#, 1000).await.unwrap();
    }

    async fn connect(timeout_ms: u64) -> (Rc<QmpClient>, LineChannel, LineChannel) {
        let (main_daemon, main_server) = UnixStream::pair().unwrap();
        let (yank_daemon, yank_server) = UnixStream::pair().unwrap();
        let mut main_server = LineChannel::new(main_server);
        let mut yank_server = LineChannel::new(yank_server);

        let (client, _) = tokio::join!(
            QmpClient::new(main_daemon, yank_daemon, timeout_ms),
            async {
                serve_handshake(&mut main_server).await;
                serve_handshake(&mut yank_server).await;
            }
        );

        (client.unwrap(), main_server, yank_server)
    }

    #[test]
    fn test_execute_round_trip() {
        run_local(async {
            let (client, mut server, _yank) = connect(1000).await;

            let (reply, ()) = tokio::join!(client.execute("{\"execute\": \"query-status\"}"), async {
                let command = server.read_line(1000).await.unwrap();
                assert!(command.contains("query-status"));
                server
                    .write_line(r#"{"return": {"status": "running", "running": true}}"#, 1000)
                    .await
                    .unwrap();
            });

            let reply = reply.unwrap();
            assert!(!reply.did_yank);
            assert_eq!(reply.json["return"]["status"], "running");
        });
    }

    #[test]
    fn test_execute_skips_interleaved_events() {
        run_local(async {
            let (client, mut server, _yank) = connect(1000).await;

            let (reply, ()) = tokio::join!(client.execute("{\"execute\": \"query-status\"}"), async {
                let _ = server.read_line(1000).await.unwrap();
                server
                    .write_line(r#"{"event": "RESUME", "timestamp": {"seconds": 1}}"#, 1000)
                    .await
                    .unwrap();
                server.write_line(r#"{"return": {}}"#, 1000).await.unwrap();
            });

            assert!(reply.unwrap().return_member().is_some());
        });
    }

    #[test]
    fn test_qmp_error_reply_is_an_error() {
        run_local(async {
            let (client, mut server, _yank) = connect(1000).await;

            let (reply, ()) = tokio::join!(client.execute("{\"execute\": \"bogus\"}"), async {
                let _ = server.read_line(1000).await.unwrap();
                server
                    .write_line(
                        r#"{"error": {"class": "CommandNotFound", "desc": "bogus"}}"#,
                        1000,
                    )
                    .await
                    .unwrap();
            });

            let err = reply.unwrap_err();
            assert!(err.is_qmp());
        });
    }

    #[test]
    fn test_timeout_triggers_yank_then_retries_read() {
        run_local(async {
            let (client, mut server, mut yank) = connect(100).await;
            client.set_yank_instances(json!([{"type": "migration"}]));

            let (reply, ()) = tokio::join!(client.execute("{\"execute\": \"query-status\"}"), async {
                // swallow the command, let the main channel stall
                let _ = server.read_line(1000).await.unwrap();

                let query = yank.read_line(1000).await.unwrap();
                assert!(query.contains("query-yank"));
                yank.write_line(
                    r#"{"return": [{"type": "migration"}, {"type": "chardev", "id": "other0"}]}"#,
                    1000,
                )
                .await
                .unwrap();

                let yank_cmd = yank.read_line(1000).await.unwrap();
                let yank_cmd: Value = serde_json::from_str(&yank_cmd).unwrap();
                assert_eq!(yank_cmd["exec-oob"], "yank");
                assert_eq!(yank_cmd["arguments"]["instances"], json!([{"type": "migration"}]));
                yank.write_line(r#"{"return": {}}"#, 1000).await.unwrap();

                // main channel unblocks after the yank
                server.write_line(r#"{"return": {}}"#, 1000).await.unwrap();
            });

            let reply = reply.unwrap();
            assert!(reply.did_yank);
        });
    }

    #[test]
    fn test_yank_retries_on_device_not_found() {
        run_local(async {
            let (client, _server, mut yank) = connect(1000).await;
            client.set_yank_instances(json!([{"type": "migration"}]));

            let (result, ()) = tokio::join!(client.yank(), async {
                let _ = yank.read_line(1000).await.unwrap();
                yank.write_line(r#"{"return": [{"type": "migration"}]}"#, 1000)
                    .await
                    .unwrap();
                let _ = yank.read_line(1000).await.unwrap();
                yank.write_line(
                    r#"{"error": {"class": "DeviceNotFound", "desc": "gone"}}"#,
                    1000,
                )
                .await
                .unwrap();

                // second round: the instance set shifted
                let _ = yank.read_line(1000).await.unwrap();
                yank.write_line(r#"{"return": []}"#, 1000).await.unwrap();
                let _ = yank.read_line(1000).await.unwrap();
                yank.write_line(r#"{"return": {}}"#, 1000).await.unwrap();
            });

            result.unwrap();
        });
    }

    #[test]
    fn test_yank_idempotent_when_nothing_to_yank() {
        run_local(async {
            let (client, _server, mut yank) = connect(1000).await;

            for _ in 0..2 {
                let (result, ()) = tokio::join!(client.yank(), async {
                    let _ = yank.read_line(1000).await.unwrap();
                    yank.write_line(r#"{"return": []}"#, 1000).await.unwrap();
                    let _ = yank.read_line(1000).await.unwrap();
                    yank.write_line(r#"{"return": {}}"#, 1000).await.unwrap();
                });
                result.unwrap();
            }
        });
    }

    #[test]
    fn test_wait_event_matches_pattern() {
        run_local(async {
            let (client, mut server, _yank) = connect(1000).await;

            let pattern = json!({"event": "MIGRATION", "data": {"status": "colo"}});
            let (event, ()) = tokio::join!(
                client.wait_event(1000, &pattern),
                async {
                    server
                        .write_line(
                            r#"{"event": "MIGRATION", "data": {"status": "active"}}"#,
                            1000,
                        )
                        .await
                        .unwrap();
                    server
                        .write_line(r#"{"event": "MIGRATION", "data": {"status": "colo"}}"#, 1000)
                        .await
                        .unwrap();
                }
            );

            let event = event.unwrap();
            assert_eq!(event["data"]["status"], "colo");
        });
    }

    #[test]
    fn test_wait_event_times_out() {
        run_local(async {
            let (client, _server, _yank) = connect(1000).await;

            let err = client
                .wait_event(20, &json!({"event": "RESUME"}))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
            assert!(client.event_waiters.borrow().is_empty());
        });
    }

    #[test]
    fn test_channel_lock_serialises_requests() {
        run_local(async {
            let (client, mut server, _yank) = connect(1000).await;

            // two concurrent requests must reach qemu strictly one after the
            // other, each paired with its own reply
            let first = client.execute("{\"execute\": \"first\"}");
            let second = client.execute("{\"execute\": \"second\"}");
            let (first, second, ()) = tokio::join!(first, second, async {
                let command = server.read_line(1000).await.unwrap();
                assert!(command.contains("first"));
                server
                    .write_line(r#"{"return": {"id": 1}}"#, 1000)
                    .await
                    .unwrap();

                let command = server.read_line(1000).await.unwrap();
                assert!(command.contains("second"));
                server
                    .write_line(r#"{"return": {"id": 2}}"#, 1000)
                    .await
                    .unwrap();
            });

            assert_eq!(first.unwrap().json["return"]["id"], 1);
            assert_eq!(second.unwrap().json["return"]["id"], 2);
        });
    }

    #[test]
    fn test_main_channel_eof_reports_hup() {
        run_local(async {
            let (client, server, _yank) = connect(1000).await;

            let hup = Rc::new(Cell::new(false));
            {
                let hup = hup.clone();
                client.add_notify_hup(move || hup.set(true));
            }

            server.shutdown();
            drop(server);
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;

            assert!(hup.get());
            assert!(client.qemu_gone());
        });
    }
}
