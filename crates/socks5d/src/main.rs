//! A SOCKS5 proxy daemon.
//!
//! `socks5d` listens for SOCKS5 clients on one or more local addresses, and
//! connects them to the destinations they ask for.  See
//! `socks5d_defaults.toml` for the options it understands.
//!
//! While running, it stops accepting new connections on SIGUSR1 and starts
//! again on SIGUSR2; connections that are already open are unaffected.
//! It exits on ctrl-c.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod cmdline;
mod exit;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use socks5_server::{AllowAll, DefaultRuler, Server, ServerConfig, SystemResolver};

use crate::cmdline::CmdLine;

#[derive(FromArgs, Debug, Clone)]
/// Run a SOCKS5 proxy.
struct Args {
    /// override the default location(s) for the configuration file
    #[argh(option, short = 'f')]
    rc: Vec<String>,
    /// override a configuration option (uses toml syntax)
    #[argh(option, short = 'c')]
    cfg: Vec<String>,
}

/// Default options to use for our configuration.
const SOCKS5D_DEFAULTS: &str = include_str!("./socks5d_defaults.toml");

/// Which access policy to apply to clients.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum Policy {
    /// Only globally routable destinations outside our own networks.
    Default,
    /// Any destination at all.
    AllowAll,
}

/// Structure to hold our configuration options, whether from a
/// configuration file or the command line.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct Socks5dConfig {
    /// Local addresses to listen on for SOCKS connections.
    listen_addrs: Vec<IpAddr>,
    /// Port to listen on.  If there is none, we have nothing to do.
    socks_port: Option<u16>,
    /// Whether to log at trace level.
    trace: bool,
    /// Whether to try the addresses for a hostname in random order.
    shuffle_dns: bool,
    /// Which destinations clients may reach.
    policy: Policy,
    /// Local address for outbound connections.
    outbound_addr: Option<IpAddr>,
    /// Seconds a connection may be idle.
    idle_timeout: u64,
    /// Length of each listener's queue of accepted connections.
    intake_queue: usize,
}

impl Socks5dConfig {
    /// Build a server as described by this configuration.
    fn build_server(&self) -> Result<Server> {
        let mut cfg = ServerConfig::default();
        cfg.idle_timeout = Duration::from_secs(self.idle_timeout);
        cfg.intake_queue = self.intake_queue;
        cfg.outbound_addr = self.outbound_addr;

        let server = Server::with_config(cfg);
        if self.shuffle_dns {
            server.set_resolver(SystemResolver)?;
        } else {
            server.set_resolver_unshuffled(SystemResolver)?;
        }
        match self.policy {
            Policy::Default => server.set_ruler(DefaultRuler)?,
            Policy::AllowAll => {
                warn!("Access policy is allow-all: clients can reach any address, including ours.");
                server.set_ruler(AllowAll)?;
            }
        }
        Ok(server)
    }
}

/// Return a filename for the default user configuration file.
fn default_config_file() -> Option<PathBuf> {
    let pd = directories::ProjectDirs::from("org", "socks5d", "socks5d")?;

    Some(pd.config_dir().join("socks5d.toml"))
}

/// Load our configuration: built-in defaults first, then the files in
/// `files` (or `default_path`, if it exists and no files were given),
/// then the command-line options in `opts`.
fn load_config(
    default_path: Option<PathBuf>,
    files: &[String],
    opts: &[String],
) -> Result<Socks5dConfig> {
    let mut cfg = config::Config::new();
    cfg.merge(config::File::from_str(
        SOCKS5D_DEFAULTS,
        config::FileFormat::Toml,
    ))?;

    if files.is_empty() {
        if let Some(p) = default_path {
            let f: config::File<_> = p.as_path().into();
            cfg.merge(f.format(config::FileFormat::Toml).required(false))?;
        }
    } else {
        for p in files {
            let f: config::File<_> = Path::new(p).into();
            cfg.merge(f.format(config::FileFormat::Toml).required(true))?;
        }
    }

    let mut cmdline = CmdLine::new();
    for opt in opts {
        cmdline.push_toml_line(opt.clone());
    }
    cfg.merge(cmdline)?;

    Ok(cfg.try_into()?)
}

/// Install a `tracing` subscriber that logs to stderr.
///
/// `RUST_LOG` wins if it is set.
fn setup_logging(config: &Socks5dConfig) {
    let level = if config.trace { "trace" } else { "debug" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Serve on every configured address until we're told to exit, or a
/// listener fails.
async fn run(config: Socks5dConfig, socks_port: u16) -> Result<()> {
    let server = config.build_server()?;

    let mut listeners = FuturesUnordered::new();
    for &ip in &config.listen_addrs {
        let server = server.clone();
        listeners.push(async move {
            server
                .listen_and_serve(ip, socks_port)
                .await
                .with_context(|| format!("SOCKS listener on {} failed", ip))
        });
    }
    if listeners.is_empty() {
        info!("Nothing to do: no listen_addrs configured.");
        return Ok(());
    }

    tokio::select! {
        r = exit::wait_for_ctrl_c() => {
            r?;
            info!("Received a ctrl-c; exiting.");
            Ok(())
        }
        r = exit::pause_on_signal(server.clone()) => r,
        Some(r) = listeners.next() => r,
    }
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = load_config(default_config_file(), &args.rc, &args.cfg)?;

    setup_logging(&config);

    let socks_port = match config.socks_port {
        Some(s) => s,
        None => {
            info!("Nothing to do: no socks_port configured.");
            return Ok(());
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, socks_port))
}
