use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use kvgate::config::{GatewayConfig, RawArgs};
use kvgate::keyring::Keyring;
use kvgate::registry::Registry;
use kvgate::server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kvgate", about = "Scoped, revocable KV gateway over encrypted Nostr DMs", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Redis-compatible backend connection string
    #[arg(long, env = "KVGATE_BACKEND_URL")]
    backend_url: Option<String>,

    /// Server's default namespace (must match `[A-Za-z0-9_-]+:`)
    #[arg(long, env = "KVGATE_NAMESPACE")]
    namespace: Option<String>,

    /// Comma-separated relay URLs
    #[arg(long, env = "KVGATE_RELAYS")]
    relays: Option<String>,

    /// Server private scalar (bech32 nsec1... or 64-char hex); required
    #[arg(long, env = "KVGATE_SERVER_SECRET")]
    server_secret: Option<String>,

    /// Preferred encryption scheme: v2 or v1
    #[arg(long, env = "KVGATE_ENCRYPTION_PREF")]
    encryption_pref: Option<String>,

    /// Max requests per connection per 60s window
    #[arg(long, env = "KVGATE_LIMIT_MPS")]
    limit_mps: Option<u32>,

    /// Max request+response bytes per connection per 60s window
    #[arg(long, env = "KVGATE_LIMIT_BPS")]
    limit_bps: Option<u64>,

    /// Max raw key length
    #[arg(long, env = "KVGATE_LIMIT_MAX_KEY")]
    limit_max_key: Option<usize>,

    /// Max decoded value length
    #[arg(long, env = "KVGATE_LIMIT_MAX_VAL")]
    limit_max_val: Option<usize>,

    /// Max keys per mget call
    #[arg(long, env = "KVGATE_LIMIT_MGET_MAX")]
    limit_mget_max: Option<usize>,

    /// Path to the on-disk connection registry JSON document
    #[arg(long, env = "KVGATE_REGISTRY_PATH")]
    registry_path: Option<PathBuf>,

    /// Data directory for the registry and other process-local state
    #[arg(long, env = "KVGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KVGATE_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server (default when no subcommand given).
    ///
    /// Runs kvgate in the foreground: connects the backend store, loads the
    /// connection registry, connects relays, and serves requests until
    /// SIGTERM/Ctrl-C.
    ///
    /// Examples:
    ///   kvgate serve
    ///   kvgate
    Serve,
    /// Inspect the connection registry.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Generate a fresh server keypair and print it.
    ///
    /// Examples:
    ///   kvgate keygen
    Keygen,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Print every pubkey → policy entry currently loaded.
    Show,
}

impl Args {
    fn raw(&self) -> RawArgs {
        RawArgs {
            backend_url: self.backend_url.clone(),
            namespace: self.namespace.clone(),
            relays: self.relays.clone(),
            server_secret: self.server_secret.clone(),
            encryption_pref: self.encryption_pref.clone(),
            limit_mps: self.limit_mps,
            limit_bps: self.limit_bps,
            limit_max_key: self.limit_max_key,
            limit_max_val: self.limit_max_val,
            limit_mget_max: self.limit_mget_max,
            registry_path: self.registry_path.clone(),
            data_dir: self.data_dir.clone(),
            log: self.log.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    setup_logging(&log_level);

    let raw = args.raw();
    match args.command {
        Some(Command::Keygen) => {
            let kr = Keyring::generate();
            println!("npub: {}", kr.npub()?);
            println!("nsec: {}", kr.nsec()?);
        }
        Some(Command::Registry { action }) => match action {
            RegistryAction::Show => {
                let config = GatewayConfig::new(raw).context("invalid configuration")?;
                let registry = Registry::load(&config).await;
                for (pubkey, policy) in registry.snapshot().await {
                    println!(
                        "{}  ns={}  methods={}  mps={} bps={} app={}",
                        pubkey.to_hex(),
                        policy.namespace,
                        policy.allowed_methods.len(),
                        policy.limits.mps,
                        policy.limits.bps,
                        policy.app_name.as_deref().unwrap_or("-"),
                    );
                }
            }
        },
        None | Some(Command::Serve) => {
            let config = GatewayConfig::new(raw).context("invalid configuration")?;
            run_server(config).await?;
        }
    }

    Ok(())
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
}

async fn run_server(config: GatewayConfig) -> Result<()> {
    let server = Server::start(config).await.context("failed to start gateway")?;

    let shutdown = Arc::new(Notify::new());
    let reload = Arc::new(Notify::new());
    spawn_signal_handlers(shutdown.clone(), reload.clone());

    info!("kvgate running");
    server.run(shutdown, reload).await?;
    info!("kvgate stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handlers(shutdown: Arc<Notify>, reload: Arc<Notify>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = interrupt.recv() => info!("received SIGINT"),
        }
        shutdown.notify_one();
    });

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        loop {
            hup.recv().await;
            reload.notify_one();
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handlers(shutdown: Arc<Notify>, _reload: Arc<Notify>) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.notify_one();
    });
}
