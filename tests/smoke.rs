//! End-to-end smoke tests: a daemon wired to socketpair QMP channels and a
//! real control socket, with this test acting as QEMU on the far side.

use std::cell::RefCell;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use colod::channel::LineChannel;
use colod::client::{bind_control_socket, connect_control_socket, ClientListener};
use colod::cluster::ClusterGroup;
use colod::commands::QmpCommands;
use colod::daemon::{ColodContext, MainExit};
use colod::events::EventQueue;
use colod::peer::PeerManager;
use colod::qmp::QmpClient;
use colod::watchdog::Watchdog;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

fn run_local(fut: impl Future<Output = ()>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, fut);
}

/// Let the daemon's tasks run for a moment.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// The far (QEMU) side of the two QMP socketpairs.
struct TestQemu {
    main: LineChannel,
    yank: LineChannel,
}

impl TestQemu {
    async fn serve_handshake(channel: &mut LineChannel) {
        channel
            .write_line(r#"{"QMP": {"version": {}, "capabilities": ["oob"]}}"#, 1000)
            .await
            .unwrap();
        let capabilities = channel.read_line(1000).await.unwrap();
        assert!(capabilities.contains("qmp_capabilities"));
        channel
            .write_line(r#"{"return": {}}"#, 1000)
            .await
            .unwrap();
    }

    fn shutdown(&self) {
        self.main.shutdown();
        self.yank.shutdown();
    }
}

/// Auto-responding QEMU: acknowledges every command, keeps a log, and lets
/// the test inject asynchronous events.
struct AutoQemu {
    commands: Rc<RefCell<Vec<String>>>,
    inject: tokio::sync::mpsc::UnboundedSender<String>,
    colo_mode: Rc<RefCell<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AutoQemu {
    fn start(qemu: TestQemu) -> Self {
        let commands = Rc::new(RefCell::new(Vec::new()));
        let colo_mode = Rc::new(RefCell::new("none".to_string()));
        let (inject, mut inject_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let (mut main_reader, mut main_writer) = qemu.main.into_parts();
        let main_log = commands.clone();
        let main_mode = colo_mode.clone();
        let main_task = tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    line = main_reader.read_line(0) => {
                        let Ok(line) = line else { return };
                        main_log.borrow_mut().push(line.clone());
                        let reply = Self::respond(&line, &main_mode.borrow());
                        if colod::channel::write_all(&mut main_writer, reply.as_bytes(), 1000)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    event = inject_rx.recv() => {
                        let Some(event) = event else { return };
                        let mut buf = event.into_bytes();
                        buf.push(b'\n');
                        if colod::channel::write_all(&mut main_writer, &buf, 1000).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let (mut yank_reader, mut yank_writer) = qemu.yank.into_parts();
        let yank_task = tokio::task::spawn_local(async move {
            loop {
                let Ok(line) = yank_reader.read_line(0).await else {
                    return;
                };
                let reply = Self::respond(&line, "none");
                if colod::channel::write_all(&mut yank_writer, reply.as_bytes(), 1000)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Self {
            commands,
            inject,
            colo_mode,
            tasks: vec![main_task, yank_task],
        }
    }

    fn respond(line: &str, colo_mode: &str) -> String {
        let request: Value = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(_) => return "{\"error\": {\"class\": \"GenericError\", \"desc\": \"parse\"}}\n".to_string(),
        };

        let reply = if request.get("exec-oob").and_then(Value::as_str) == Some("query-yank") {
            json!({"return": []})
        } else {
            match request.get("execute").and_then(Value::as_str) {
                Some("query-status") => json!({"return": {"status": "running", "running": true}}),
                Some("query-colo-status") => {
                    json!({"return": {"mode": colo_mode, "reason": "none"}})
                }
                _ => json!({"return": {}}),
            }
        };

        format!("{}\n", reply)
    }

    fn set_colo_mode(&self, mode: &str) {
        *self.colo_mode.borrow_mut() = mode.to_string();
    }

    fn inject_event(&self, event: Value) {
        self.inject.send(event.to_string()).unwrap();
    }

    fn saw_command(&self, needle: &str) -> bool {
        self.commands
            .borrow()
            .iter()
            .any(|command| command.contains(needle))
    }

    async fn wait_for_command(&self, needle: &str) {
        let commands = self.commands.clone();
        let needle_owned = needle.to_string();
        wait_for(needle, move || {
            commands
                .borrow()
                .iter()
                .any(|command| command.contains(&needle_owned))
        })
        .await;
    }

    fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct TestDaemon {
    ctx: Rc<ColodContext>,
    listener: Rc<ClientListener>,
    socket_path: PathBuf,
    main_task: JoinHandle<MainExit>,
}

impl TestDaemon {
    async fn start(
        dir: &Path,
        name: &str,
        primary: bool,
        group: &Rc<ClusterGroup>,
        timeout_low_ms: u64,
    ) -> (TestDaemon, TestQemu) {
        let (main_daemon, main_qemu) = UnixStream::pair().unwrap();
        let (yank_daemon, yank_qemu) = UnixStream::pair().unwrap();
        let mut main_qemu = LineChannel::new(main_qemu);
        let mut yank_qemu = LineChannel::new(yank_qemu);

        let (qmp, ()) = tokio::join!(
            QmpClient::new(main_daemon, yank_daemon, timeout_low_ms),
            async {
                TestQemu::serve_handshake(&mut main_qemu).await;
                TestQemu::serve_handshake(&mut yank_qemu).await;
            }
        );
        let qmp = qmp.unwrap();

        let commands = QmpCommands::new(
            "colo_test",
            &dir.to_string_lossy(),
            &dir.to_string_lossy(),
            "127.0.0.1",
            "qemu-system-x86_64",
            "qemu-img",
            9000,
        );
        qmp.set_yank_instances(commands.yank_instances());
        let commands = Rc::new(RefCell::new(commands));

        let queue = Rc::new(EventQueue::new());
        let cluster = group.join();
        let peer = PeerManager::new(queue.clone(), &cluster);
        let watchdog = Watchdog::new(0);

        let ctx = ColodContext::new(
            name,
            "colo_test",
            dir.to_path_buf(),
            "127.0.0.1",
            primary,
            timeout_low_ms,
            10 * timeout_low_ms,
            qmp,
            queue,
            peer,
            cluster,
            commands,
            watchdog,
        );

        let socket_path = dir.join(format!("colod-{}.sock", name));
        let listener = bind_control_socket(&socket_path).unwrap();
        let listener = ClientListener::new(ctx.clone(), listener);

        let main_task = {
            let ctx = ctx.clone();
            tokio::task::spawn_local(async move { ctx.run().await })
        };

        (
            TestDaemon {
                ctx,
                listener,
                socket_path,
                main_task,
            },
            TestQemu {
                main: main_qemu,
                yank: yank_qemu,
            },
        )
    }

    async fn connect(&self) -> LineChannel {
        connect_control_socket(&self.socket_path).await.unwrap()
    }

    /// The daemon must exit within a second of being told to quit.
    async fn expect_exit(self) -> MainExit {
        let exit = tokio::time::timeout(Duration::from_secs(1), self.main_task)
            .await
            .expect("daemon did not exit in time")
            .unwrap();
        self.ctx.raise_timeout_coroutine_free();
        self.listener.close().await;
        self.ctx.qmp.close();
        exit
    }
}

async fn request(client: &mut LineChannel, request: Value) -> Value {
    client.write_line(&request.to_string(), 1000).await.unwrap();
    let reply = client.read_line(1000).await.unwrap();
    serde_json::from_str(&reply).unwrap()
}

#[test]
fn test_s1_quit_early_normal() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, _qemu) = TestDaemon::start(dir.path(), "a", true, &group, 50).await;

        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "start-migration"})).await;
        assert_eq!(reply, json!({"return": {}}));

        let reply = request(&mut client, json!({"exec-colod": "quit"})).await;
        assert_eq!(reply, json!({"return": {}}));

        assert_eq!(daemon.expect_exit().await, MainExit::Quit);
    });
}

#[test]
fn test_s2_quit_early_qemu_gone() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 50).await;

        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "start-migration"})).await;
        assert_eq!(reply, json!({"return": {}}));

        qemu.shutdown();
        settle().await;

        let reply = request(&mut client, json!({"exec-colod": "quit"})).await;
        assert_eq!(reply, json!({"return": {}}));

        assert_eq!(daemon.expect_exit().await, MainExit::Quit);
    });
}

#[test]
fn test_s3_client_disconnect_after_stop() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let qemu = AutoQemu::start(qemu);

        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "stop"})).await;
        assert_eq!(reply, json!({"return": {}}));
        assert!(qemu.saw_command("\"stop\""));

        // disconnect without a matching cont
        drop(client);

        // the daemon conts qemu on the client's behalf
        qemu.wait_for_command("\"cont\"").await;

        let mut client = daemon.connect().await;
        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}

#[test]
fn test_s4_client_crash_after_stop() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let qemu = AutoQemu::start(qemu);

        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "stop"})).await;
        assert_eq!(reply, json!({"return": {}}));

        // hard-close the socket in both directions
        client.shutdown();
        drop(client);

        qemu.wait_for_command("\"cont\"").await;

        let mut client = daemon.connect().await;
        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}

/// Drive a primary daemon through the full migration into replication.
async fn establish_replication_primary(daemon: &TestDaemon, qemu: &AutoQemu) {
    let mut client = daemon.connect().await;
    let reply = request(&mut client, json!({"exec-colod": "start-migration"})).await;
    assert_eq!(reply, json!({"return": {}}));

    qemu.wait_for_command("pause-before-switchover").await;
    settle().await;
    qemu.inject_event(json!({"event": "MIGRATION", "data": {"status": "pre-switchover"}}));

    qemu.wait_for_command("migrate-continue").await;
    settle().await;
    qemu.inject_event(json!({"event": "MIGRATION", "data": {"status": "colo"}}));

    let ctx = daemon.ctx.clone();
    wait_for("primary replication", move || {
        ctx.query_status().replication
    })
    .await;
}

/// Drive a secondary daemon into replication by completing the incoming
/// migration.
async fn establish_replication_secondary(daemon: &TestDaemon, qemu: &AutoQemu) {
    qemu.wait_for_command("migrate-set-capabilities").await;
    settle().await;
    qemu.inject_event(json!({"event": "RESUME"}));

    let ctx = daemon.ctx.clone();
    wait_for("secondary replication", move || {
        ctx.query_status().replication
    })
    .await;
}

#[test]
fn test_s5_simultaneous_failover() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();

        let (daemon_a, qemu_a) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let (daemon_b, qemu_b) = TestDaemon::start(dir.path(), "b", false, &group, 1000).await;
        let qemu_a = AutoQemu::start(qemu_a);
        let qemu_b = AutoQemu::start(qemu_b);

        establish_replication_secondary(&daemon_b, &qemu_b).await;
        establish_replication_primary(&daemon_a, &qemu_a).await;

        // both sides initiate a failover in the same loop iteration: a yank
        // queues FailoverSync, and both daemons broadcast FAILOVER
        let mut client_a = daemon_a.connect().await;
        let mut client_b = daemon_b.connect().await;
        let reply = request(&mut client_a, json!({"exec-colod": "yank"})).await;
        assert_eq!(reply, json!({"return": {}}));
        let reply = request(&mut client_b, json!({"exec-colod": "yank"})).await;
        assert_eq!(reply, json!({"return": {}}));

        let ctx_a = daemon_a.ctx.clone();
        let ctx_b = daemon_b.ctx.clone();
        wait_for("failover race to settle", move || {
            let a = ctx_a.query_status();
            let b = ctx_b.query_status();
            if a.failed == b.failed {
                return false;
            }
            let winner = if a.failed { b } else { a };
            winner.primary && !winner.replication
        })
        .await;
        settle().await;

        let state_a = daemon_a.ctx.query_status();
        let state_b = daemon_b.ctx.query_status();
        let (winner, loser) = if state_a.failed {
            (state_b, state_a)
        } else {
            (state_a, state_b)
        };

        // exactly one side took over
        assert!(winner.primary);
        assert!(!winner.replication);
        assert!(!winner.failed);
        assert!(winner.peer_failed);

        // the other went to the failed sink knowing the peer failed over
        assert!(loser.failed);
        assert!(loser.peer_failover);

        let _ = request(&mut client_a, json!({"exec-colod": "quit"})).await;
        let _ = request(&mut client_b, json!({"exec-colod": "quit"})).await;
        daemon_a.expect_exit().await;
        daemon_b.expect_exit().await;
        qemu_a.stop();
        qemu_b.stop();
    });
}

#[test]
fn test_s6_yank_recovery_on_stalled_qmp() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 100).await;
        let mut main = qemu.main;
        let mut yank = qemu.yank;

        let mut client = daemon.connect().await;

        // pass-through request; the main channel stalls until after the yank
        let ((), reply) = tokio::join!(
            async {
                let command = main.read_line(1000).await.unwrap();
                assert!(command.contains("query-foo"));

                let query = yank.read_line(1000).await.unwrap();
                assert!(query.contains("query-yank"));
                yank.write_line(r#"{"return": [{"type": "migration"}]}"#, 1000)
                    .await
                    .unwrap();

                let yank_command = yank.read_line(1000).await.unwrap();
                let yank_command: Value = serde_json::from_str(&yank_command).unwrap();
                assert_eq!(yank_command["exec-oob"], "yank");
                assert_eq!(
                    yank_command["arguments"]["instances"],
                    json!([{"type": "migration"}])
                );
                yank.write_line(r#"{"return": {}}"#, 1000).await.unwrap();

                // unstuck: answer the original command
                main.write_line(r#"{"return": {"foo": 1}}"#, 1000)
                    .await
                    .unwrap();
            },
            request(&mut client, json!({"execute": "query-foo"}))
        );

        assert_eq!(reply, json!({"return": {"foo": 1}}));

        // the yank queued a FailoverSync for the coordinator
        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
    });
}

#[test]
fn test_timeout_regime_brackets_stop_resume() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 100).await;
        let qemu = AutoQemu::start(qemu);

        assert_eq!(daemon.ctx.qmp.timeout(), 100);

        daemon.ctx.raise_timeout_coroutine();
        assert_eq!(daemon.ctx.qmp.timeout(), 1000);

        // a second request while active is a no-op
        daemon.ctx.raise_timeout_coroutine();
        assert_eq!(daemon.ctx.qmp.timeout(), 1000);

        settle().await;
        qemu.inject_event(json!({"event": "STOP"}));
        settle().await;
        assert_eq!(daemon.ctx.qmp.timeout(), 1000);

        qemu.inject_event(json!({"event": "RESUME"}));
        let ctx = daemon.ctx.clone();
        wait_for("timeout restored", move || ctx.qmp.timeout() == 100).await;

        let mut client = daemon.connect().await;
        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}

#[test]
fn test_query_status_and_peer_commands() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let qemu = AutoQemu::start(qemu);

        let mut client = daemon.connect().await;

        let reply = request(&mut client, json!({"exec-colod": "query-status"})).await;
        assert_eq!(
            reply,
            json!({"return": {
                "primary": true,
                "replication": false,
                "failed": false,
                "peer-failover": false,
                "peer-failed": false,
            }})
        );

        let reply = request(
            &mut client,
            json!({"exec-colod": "set-peer", "peer": "teleclu-02"}),
        )
        .await;
        assert_eq!(reply, json!({"return": {}}));

        let reply = request(&mut client, json!({"exec-colod": "query-peer"})).await;
        assert_eq!(reply, json!({"return": {"peer": "teleclu-02"}}));

        let reply = request(&mut client, json!({"exec-colod": "clear-peer"})).await;
        assert_eq!(reply, json!({"return": {}}));
        let reply = request(&mut client, json!({"exec-colod": "query-peer"})).await;
        assert_eq!(reply, json!({"return": {"peer": ""}}));

        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}

#[test]
fn test_store_and_template_commands() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let qemu = AutoQemu::start(qemu);

        let mut client = daemon.connect().await;

        let reply = request(&mut client, json!({"exec-colod": "query-store"})).await;
        assert_eq!(reply, json!({"return": {}}));

        let reply = request(
            &mut client,
            json!({"exec-colod": "set-store", "store": {"anything": [1, 2, 3]}}),
        )
        .await;
        assert_eq!(reply, json!({"return": {}}));

        // the store is shared between connections
        let mut other = daemon.connect().await;
        let reply = request(&mut other, json!({"exec-colod": "query-store"})).await;
        assert_eq!(reply, json!({"return": {"anything": [1, 2, 3]}}));

        let reply = request(
            &mut client,
            json!({"exec-colod": "set-migration-switchover",
                   "commands": ["{\"execute\": \"stop\"}"]}),
        )
        .await;
        assert_eq!(reply, json!({"return": {}}));

        let reply = request(
            &mut client,
            json!({"exec-colod": "set-migration-switchover",
                   "commands": ["{\"execute\": \"@@BOGUS@@\"}"]}),
        )
        .await;
        assert_eq!(reply, json!({"error": "Invalid format"}));

        let reply = request(
            &mut client,
            json!({"exec-colod": "set-yank",
                   "instances": [{"type": "migration"}]}),
        )
        .await;
        assert_eq!(reply, json!({"return": {}}));

        let reply = request(&mut client, json!({"exec-colod": "no-such-command"})).await;
        assert_eq!(reply, json!({"error": "Unknown command"}));

        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}

#[test]
fn test_autoquit_waits_for_qemu_to_go_away() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;

        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "autoquit"})).await;
        assert_eq!(reply, json!({"return": {}}));

        settle().await;
        // still draining: only qemu going away finishes an autoquit
        assert!(daemon.ctx.query_status().failed);
        assert!(!daemon.main_task.is_finished());

        qemu.shutdown();
        assert_eq!(daemon.expect_exit().await, MainExit::AutoQuit);
    });
}

#[test]
fn test_health_mismatch_fails_the_node() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let qemu = AutoQemu::start(qemu);

        // qemu claims secondary replication; the daemon believes standalone
        qemu.set_colo_mode("secondary");

        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "query-status"})).await;
        assert_eq!(reply["return"]["failed"], json!(true));

        // the mismatch escalated to the failed sink
        let ctx = daemon.ctx.clone();
        wait_for("failed sink", move || ctx.query_status().failed).await;

        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}

#[test]
fn test_start_migration_rejected_while_pending() {
    run_local(async {
        let dir = TempDir::new().unwrap();
        let group = ClusterGroup::new("colo_test").unwrap();
        let (daemon, qemu) = TestDaemon::start(dir.path(), "a", true, &group, 1000).await;
        let qemu = AutoQemu::start(qemu);

        establish_replication_primary(&daemon, &qemu).await;

        // in replication, another migration makes no sense
        let mut client = daemon.connect().await;
        let reply = request(&mut client, json!({"exec-colod": "start-migration"})).await;
        assert_eq!(reply, json!({"error": "Pending actions"}));

        let _ = request(&mut client, json!({"exec-colod": "quit"})).await;
        daemon.expect_exit().await;
        qemu.stop();
    });
}
