//! socket-link server.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                     socket-link                       │
//!   Client        │  ┌──────────┐   schedule   ┌──────────────┐           │
//!   ──────────────┼─▶│ listener │─────────────▶│ worker pool  │           │
//!                 │  │ (accept) │              │ (ReadTask /  │           │
//!                 │  └──────────┘              │ DuplexRead)  │           │
//!                 │                            └──────┬───────┘           │
//!                 │             Suspend               │   ▲  wake-up      │
//!                 │                  ┌────────────────▼───┴──┐            │
//!                 │                  │   keepalive poller    │            │
//!                 │                  └───────────────────────┘            │
//!                 │                                                       │
//!                 │  tokio runtime: admin HTTP, signals, metrics          │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use notify::RecommendedWatcher;

use socket_link::admin;
use socket_link::config::validation::validate_config;
use socket_link::config::watcher::ConfigWatcher;
use socket_link::config::{load_config, ConfigError, LinkConfig};
use socket_link::lifecycle::{signals, Shutdown};
use socket_link::net::{LinkContext, Listener};
use socket_link::observability::{logging, metrics};
use socket_link::protocol::echo::LineProtocol;

#[derive(Debug, Clone, Parser)]
#[command(name = "socket-link", version, about = "Threaded connection acceptor")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address
    #[arg(long)]
    bind: Option<String>,

    /// Override threads.min
    #[arg(long)]
    min_threads: Option<usize>,

    /// Override threads.max
    #[arg(long)]
    max_threads: Option<usize>,

    /// Reload the configuration file when it changes
    #[arg(long)]
    watch: bool,

    /// Seconds to wait for workers on shutdown
    #[arg(long, default_value_t = 10)]
    drain_secs: u64,
}

impl Args {
    fn apply(&self, config: &mut LinkConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(min) = self.min_threads {
            config.threads.min = min;
        }
        if let Some(max) = self.max_threads {
            config.threads.max = max;
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => LinkConfig::default(),
    };
    args.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "socket-link starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("link-admin")
        .enable_all()
        .build()?;

    if config.observability.metrics_enabled {
        let _enter = runtime.enter();
        metrics::init_metrics(&config.observability.metrics_address)?;
    }

    let shutdown = Shutdown::new();
    let listener = Listener::bind(&config, Arc::new(LineProtocol), shutdown.clone())?;
    let ctx = Arc::clone(listener.context());

    runtime.spawn(signals::stop_on_signal(listener.handle()));

    if config.admin.enabled {
        let addr: SocketAddr = config.admin.bind_address.parse()?;
        let admin_ctx = Arc::clone(&ctx);
        let admin_shutdown = shutdown.clone();
        runtime.spawn(async move {
            if let Err(e) = admin::serve(addr, admin_ctx, admin_shutdown).await {
                tracing::error!(error = %e, "Admin endpoint failed");
            }
        });
    }

    let _watcher = match (&args.config, args.watch) {
        (Some(path), true) => Some(spawn_reloader(path, &args, Arc::clone(&ctx))?),
        (None, true) => {
            tracing::warn!("--watch needs --config; hot reload disabled");
            None
        }
        _ => None,
    };

    tracing::info!(address = %listener.local_addr(), "Listening for connections");
    listener.run();

    let drained = listener.shutdown(Duration::from_secs(args.drain_secs));
    runtime.shutdown_timeout(Duration::from_secs(1));

    tracing::info!(drained, "Shutdown complete");
    Ok(())
}

/// Watch the config file and apply valid changes to the running context.
fn spawn_reloader(
    path: &Path,
    args: &Args,
    ctx: Arc<LinkContext>,
) -> Result<RecommendedWatcher, Box<dyn Error>> {
    let (watcher, mut updates) = ConfigWatcher::new(path);
    let watcher = watcher.run()?;
    let args = args.clone();

    thread::Builder::new()
        .name("link-reload".into())
        .spawn(move || {
            while let Some(mut config) = updates.blocking_recv() {
                args.apply(&mut config);
                if let Err(errors) = validate_config(&config) {
                    tracing::error!(
                        error = %ConfigError::Validation(errors),
                        "Reloaded config rejected after overrides"
                    );
                    continue;
                }
                ctx.apply_config(&config);
            }
        })?;

    Ok(watcher)
}
