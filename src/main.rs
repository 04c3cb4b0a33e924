use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use colod::client::{bind_control_socket, ClientListener};
use colod::cluster::ClusterGroup;
use colod::commands::QmpCommands;
use colod::daemon::{ColodContext, MainExit};
use colod::events::EventQueue;
use colod::peer::PeerManager;
use colod::qmp::QmpClient;
use colod::watchdog::Watchdog;
use tokio::net::UnixStream;
use tracing::info;

#[derive(Parser)]
#[command(name = "colod")]
#[command(about = "Control-plane daemon for a qemu COLO high-availability pair", long_about = None)]
struct Cli {
    /// Cluster node name of this host
    node_name: String,

    /// Instance name; also the cluster group to join
    instance_name: String,

    /// Directory for sockets, pidfile and logs
    base_directory: PathBuf,

    /// Path to the qemu QMP unix socket
    qmp_unix_socket: PathBuf,

    /// Path to the qemu out-of-band QMP socket (default: qmp-yank.sock in
    /// the base directory)
    #[arg(long)]
    qmp_yank_unix_socket: Option<PathBuf>,

    /// Enable tracing
    #[arg(long)]
    trace: bool,

    /// Start in primary mode (no incoming migration expected)
    #[arg(long)]
    primary: bool,

    /// Peer address bound into the migration command templates
    #[arg(long, default_value = "")]
    address: String,

    /// Listen address for incoming replication connections
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: String,

    /// Directory holding the active/hidden replication images
    #[arg(long, default_value = "")]
    active_hidden_dir: String,

    /// qemu binary used in formatted command lines
    #[arg(long, default_value = "qemu-system-x86_64")]
    qemu_binary: String,

    /// qemu-img binary used in formatted command lines
    #[arg(long, default_value = "qemu-img")]
    qemu_img_binary: String,

    /// Extra qemu options, split on whitespace
    #[arg(long, default_value = "")]
    qemu_options: String,

    /// Advanced configuration file (JSON, supports "include")
    #[arg(long)]
    config: Option<PathBuf>,

    /// First of the four consecutive replication ports
    #[arg(long, default_value = "9000")]
    base_port: u16,

    /// QMP timeout in steady state, milliseconds
    #[arg(long, default_value = "600")]
    qmp_timeout_low: u64,

    /// QMP timeout around migration transitions, milliseconds
    #[arg(long, default_value = "10000")]
    qmp_timeout_high: u64,

    /// Watchdog ping interval in milliseconds, 0 disables
    #[arg(long, default_value = "0")]
    watchdog_interval: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    // A dying client connection must not take the daemon down
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
    }
    .context("Failed to ignore SIGPIPE")?;

    let base_dir = cli.base_directory.clone();

    let pidfile = base_dir.join("colod.pid");
    std::fs::write(&pidfile, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write pidfile {}", pidfile.display()))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let local = tokio::task::LocalSet::new();

    let exit = local.block_on(&runtime, run_daemon(&cli, &base_dir));

    let _ = std::fs::remove_file(&pidfile);

    match exit {
        Ok(exit) => {
            info!("exiting: {:?}", exit);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn run_daemon(cli: &Cli, base_dir: &std::path::Path) -> Result<MainExit> {
    let qmp_stream = UnixStream::connect(&cli.qmp_unix_socket)
        .await
        .with_context(|| {
            format!(
                "Failed to connect qmp socket {}",
                cli.qmp_unix_socket.display()
            )
        })?;
    let yank_path = cli
        .qmp_yank_unix_socket
        .clone()
        .unwrap_or_else(|| colod::format::qmp_yank_sock_path(base_dir));
    let yank_stream = UnixStream::connect(&yank_path)
        .await
        .with_context(|| format!("Failed to connect qmp yank socket {}", yank_path.display()))?;

    let qmp = QmpClient::new(qmp_stream, yank_stream, cli.qmp_timeout_low)
        .await
        .context("Failed to initialize qmp")?;

    let mut commands = QmpCommands::new(
        &cli.instance_name,
        &base_dir.to_string_lossy(),
        &cli.active_hidden_dir,
        &cli.listen_address,
        &cli.qemu_binary,
        &cli.qemu_img_binary,
        cli.base_port,
    );
    if let Some(config_path) = &cli.config {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        commands
            .read_config(&config_str, &cli.qemu_options)
            .context("Failed to parse config")?;
    } else if !cli.qemu_options.is_empty() {
        commands.set_qemu_options_str(&cli.qemu_options);
    }
    qmp.set_yank_instances(commands.yank_instances());
    let commands = Rc::new(RefCell::new(commands));

    let queue = Rc::new(EventQueue::new());
    let group = ClusterGroup::new(&cli.instance_name).context("Failed to join cluster group")?;
    let cluster = group.join();
    let peer = PeerManager::new(queue.clone(), &cluster);
    let watchdog = Watchdog::new(cli.watchdog_interval);
    watchdog.start(qmp.clone(), queue.clone());

    let ctx = ColodContext::new(
        &cli.node_name,
        &cli.instance_name,
        base_dir.to_path_buf(),
        &cli.address,
        cli.primary,
        cli.qmp_timeout_low,
        cli.qmp_timeout_high,
        qmp.clone(),
        queue,
        peer,
        cluster.clone(),
        commands,
        watchdog.clone(),
    );

    let socket_path = base_dir.join("colod.sock");
    let listener = bind_control_socket(&socket_path)
        .with_context(|| format!("Failed to bind control socket {}", socket_path.display()))?;
    info!("listening on {}", socket_path.display());
    let listener = ClientListener::new(ctx.clone(), listener);

    let exit = ctx.run().await;

    ctx.raise_timeout_coroutine_free();
    watchdog.stop();
    listener.close().await;
    qmp.close();
    cluster.leave();
    let _ = std::fs::remove_file(&socket_path);

    Ok(exit)
}
