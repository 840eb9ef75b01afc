// CLI entry point for the Abstrax control relay.
//
// Starts a standalone relay that browser control panels connect to. The
// relay merges their updates into one shared state, rebroadcasts them, and
// forwards them to the laser over OSC. See `server.rs` for the threading
// architecture and `hub.rs` for message handling.
//
// Usage:
//   relay [OPTIONS] [SINK_IP]
//
// `SINK_IP` replaces the default broadcast destination (255.255.255.255),
// matching the classic `relay <ip>` invocation. Options override values
// from `--config`, which override the built-in defaults.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;

use abstrax_relay::config::RelayConfig;
use abstrax_relay::server::start_relay;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Laser control state relay")]
struct Cli {
    /// Primary OSC destination IP (default: 255.255.255.255)
    sink_ip: Option<IpAddr>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address for both servers
    #[arg(long)]
    bind: Option<IpAddr>,

    /// WebSocket port for control clients
    #[arg(long)]
    ws_port: Option<u16>,

    /// HTTP port for /state.txt and snapshot files
    #[arg(long)]
    http_port: Option<u16>,

    /// Directory for snapshot (.preset) files
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// OSC destination host:port; repeat for several (replaces defaults)
    #[arg(long = "sink")]
    sinks: Vec<String>,

    /// Snapshot to load before accepting clients
    #[arg(long)]
    restore: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match build_config(cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let (handle, addrs) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            log::error!("failed to start relay: {e}");
            std::process::exit(1);
        }
    };
    log::info!(
        "relay running (ws {}, http {}); press Ctrl+C to stop",
        addrs.ws,
        addrs.http
    );

    let stop = StopSignal::new();
    let notify = stop.notifier();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = notify.send(());
    }) {
        log::warn!("cannot install Ctrl+C handler ({e}); running until killed");
    }
    stop.wait();

    log::info!("shutting down");
    handle.stop();
}

/// Blocks `main` until a stop is requested. The signal keeps a sender of its
/// own, so losing every notifier (a failed handler install) never ends the
/// wait early.
struct StopSignal {
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

impl StopSignal {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    fn notifier(&self) -> mpsc::Sender<()> {
        self.tx.clone()
    }

    fn wait(&self) {
        let _ = self.rx.recv();
    }
}

fn build_config(cli: Cli) -> Result<RelayConfig, abstrax_relay::error::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load_file(path)?,
        None => RelayConfig::default(),
    };
    if !cli.sinks.is_empty() {
        config.sinks = cli.sinks;
    }
    if let Some(ip) = cli.sink_ip {
        config.set_primary_sink_ip(ip);
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.ws_port {
        config.ws_port = port;
    }
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }
    if let Some(dir) = cli.snapshot_dir {
        config.snapshot_dir = dir;
    }
    if cli.restore.is_some() {
        config.restore = cli.restore;
    }
    // Surface unresolvable sinks before binding anything.
    config.sink_addrs()?;
    Ok(config)
}
