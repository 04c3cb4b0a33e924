//! The daemon's control surface: a local stream socket speaking
//! newline-delimited JSON. Requests carrying `exec-colod` are dispatched to
//! daemon commands; anything else is forwarded verbatim to QMP.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{json, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::channel::LineChannel;
use crate::daemon::ColodContext;
use crate::json::{has_member, member_str};

const CLIENT_WRITE_TIMEOUT_MS: u64 = 1000;

pub struct ClientListener {
    ctx: Rc<ColodContext>,
    /// Opaque blob a management client may park at the daemon.
    store: RefCell<Value>,
    clients: RefCell<Vec<ClientHandle>>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

struct ClientHandle {
    quit: Rc<Cell<bool>>,
    fd: std::os::unix::io::RawFd,
    task: JoinHandle<()>,
}

impl ClientListener {
    pub fn new(ctx: Rc<ColodContext>, listener: UnixListener) -> Rc<Self> {
        let this = Rc::new(Self {
            ctx,
            store: RefCell::new(json!({})),
            clients: RefCell::new(Vec::new()),
            accept_task: RefCell::new(None),
        });

        let accept_task = tokio::task::spawn_local(Self::accept_loop(this.clone(), listener));
        *this.accept_task.borrow_mut() = Some(accept_task);

        this
    }

    async fn accept_loop(this: Rc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let quit = Rc::new(Cell::new(false));
                    let channel = LineChannel::new(stream);
                    let fd = channel.raw_fd();
                    let client = Client {
                        ctx: this.ctx.clone(),
                        listener: this.clone(),
                        channel,
                        stopped_qemu: false,
                        quit: quit.clone(),
                    };
                    let task = tokio::task::spawn_local(client.run());
                    this.clients.borrow_mut().push(ClientHandle { quit, fd, task });
                }
                Err(err) => {
                    error!("Failed to accept() new client: {}", err);
                    return;
                }
            }
        }
    }

    /// Stop accepting and wind down every connection.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.borrow_mut().take() {
            task.abort();
        }

        let clients: Vec<ClientHandle> = self.clients.borrow_mut().drain(..).collect();
        for client in &clients {
            client.quit.set(true);
            let _ = nix::sys::socket::shutdown(client.fd, nix::sys::socket::Shutdown::Both);
        }
        for client in clients {
            let _ = client.task.await;
        }
    }
}

struct Client {
    ctx: Rc<ColodContext>,
    listener: Rc<ClientListener>,
    channel: LineChannel,
    stopped_qemu: bool,
    quit: Rc<Cell<bool>>,
}

fn reply_ok(member: Value) -> Value {
    json!({"return": member})
}

fn reply_error(message: &str) -> Value {
    json!({"error": message})
}

impl Client {
    async fn run(mut self) {
        let err = loop {
            if self.quit.get() {
                return;
            }

            let line = match self.channel.read_line(0).await {
                Ok(line) => line,
                Err(err) => {
                    if self.quit.get() {
                        return;
                    }
                    break err;
                }
            };
            if self.quit.get() {
                return;
            }

            let request: Value = match serde_json::from_str(&line) {
                Ok(request) if matches!(request, Value::Object(_)) => request,
                _ => break crate::ColodError::Fatal(format!("invalid request: {}", line)),
            };

            trace!("client: {}", line);
            let reply = self.dispatch(&request, &line).await;

            let reply = reply.to_string();
            trace!("client: {}", reply);
            if let Err(err) = self
                .channel
                .write_line(&reply, CLIENT_WRITE_TIMEOUT_MS)
                .await
            {
                break err;
            }
        };

        if !err.is_eof() {
            warn!("Client connection broke: {}", err);
        }

        // a client that stopped qemu and vanished gets its cont issued for it
        if self.stopped_qemu {
            if let Err(err) = self.ctx.execute_co("{\"execute\": \"cont\"}").await {
                error!("{}", err);
                self.ctx.client_cont_failed();
            }
        }
    }

    async fn dispatch(&mut self, request: &Value, raw: &str) -> Value {
        let Some(command) = request.get("exec-colod") else {
            // pass-through mode: hand the request to qemu verbatim
            return match self.ctx.execute_nocheck_co(raw).await {
                Ok(reply) => reply.json,
                Err(err) => reply_error(&err.to_string()),
            };
        };

        let Some(command) = command.as_str() else {
            return reply_error("Could not get exec-colod member");
        };

        match command {
            "query-status" => self.handle_query_status().await,
            "query-store" => reply_ok(self.listener.store.borrow().clone()),
            "set-store" => self.handle_set_store(request),
            "quit" => {
                self.ctx.quit();
                reply_ok(json!({}))
            }
            "autoquit" => {
                self.ctx.autoquit();
                reply_ok(json!({}))
            }
            "set-prepare-secondary" => {
                self.handle_set(request, |commands, value| commands.set_prepare_secondary(value))
            }
            "set-migration-start" => {
                self.handle_set(request, |commands, value| commands.set_migration_start(value))
            }
            "set-migration-switchover" => self.handle_set(request, |commands, value| {
                commands.set_migration_switchover(value)
            }),
            "set-primary-failover" => {
                self.handle_set(request, |commands, value| commands.set_failover_primary(value))
            }
            "set-secondary-failover" => self.handle_set(request, |commands, value| {
                commands.set_failover_secondary(value)
            }),
            "start-migration" => match self.ctx.start_migration() {
                Ok(()) => reply_ok(json!({})),
                Err(_) => reply_error("Pending actions"),
            },
            "set-yank" => self.handle_set_yank(request),
            "yank" => match self.ctx.yank_co().await {
                Ok(()) => reply_ok(json!({})),
                Err(err) => reply_error(&err.to_string()),
            },
            "stop" => self.handle_stop().await,
            "cont" => self.handle_cont().await,
            "set-peer" => self.handle_set_peer(request),
            "query-peer" => reply_ok(json!({"peer": self.ctx.peer.peer()})),
            "clear-peer" => {
                self.ctx.peer.clear_peer();
                reply_ok(json!({}))
            }
            _ => reply_error("Unknown command"),
        }
    }

    async fn handle_query_status(&self) -> Value {
        let mut health_failed = false;
        if let Err(err) = self.ctx.check_health_co().await {
            error!("{}", err);
            health_failed = true;
        }

        let state = self.ctx.query_status();
        json!({"return": {
            "primary": state.primary,
            "replication": state.replication,
            "failed": health_failed || state.failed,
            "peer-failover": state.peer_failover,
            "peer-failed": state.peer_failed,
        }})
    }

    fn handle_set_store(&self, request: &Value) -> Value {
        let Some(store) = request.get("store") else {
            return reply_error("Member 'store' missing");
        };

        *self.listener.store.borrow_mut() = store.clone();
        reply_ok(json!({}))
    }

    fn handle_set(
        &self,
        request: &Value,
        set: impl FnOnce(&mut crate::commands::QmpCommands, &Value) -> crate::Result<()>,
    ) -> Value {
        let Some(commands) = request.get("commands") else {
            return reply_error("Member 'commands' missing");
        };
        if !commands.is_array() {
            return reply_error("Member 'commands' must be an array");
        }

        match set(&mut self.ctx.commands.borrow_mut(), commands) {
            Ok(()) => reply_ok(json!({})),
            Err(err) => reply_error(&err.to_string()),
        }
    }

    fn handle_set_yank(&self, request: &Value) -> Value {
        let Some(instances) = request.get("instances") else {
            return reply_error("Member 'instances' missing");
        };
        if !instances.is_array() {
            return reply_error("Member 'instances' must be an array");
        }

        self.ctx.qmp.set_yank_instances(instances.clone());
        reply_ok(json!({}))
    }

    async fn handle_stop(&mut self) -> Value {
        match self.ctx.execute_co("{\"execute\": \"stop\"}").await {
            Ok(reply) => {
                self.stopped_qemu = true;
                reply.json
            }
            Err(err) => reply_error(&err.to_string()),
        }
    }

    async fn handle_cont(&mut self) -> Value {
        match self.ctx.execute_co("{\"execute\": \"cont\"}").await {
            Ok(reply) => {
                self.stopped_qemu = false;
                reply.json
            }
            Err(err) => reply_error(&err.to_string()),
        }
    }

    fn handle_set_peer(&self, request: &Value) -> Value {
        if !has_member(request, "peer") {
            return reply_error("Member 'peer' missing");
        }
        let Some(peer) = member_str(request, "peer") else {
            return reply_error("Member 'peer' must be a string");
        };

        self.ctx.peer.set_peer(peer);
        reply_ok(json!({}))
    }
}

/// Bind the control socket, replacing a stale one.
pub fn bind_control_socket(path: &std::path::Path) -> crate::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

/// Connect to a daemon's control socket (used by tests and tooling).
pub async fn connect_control_socket(path: &std::path::Path) -> crate::Result<LineChannel> {
    let stream = UnixStream::connect(path).await?;
    Ok(LineChannel::new(stream))
}
