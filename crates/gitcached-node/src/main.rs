//! The gitcached daemon: argument parsing, logging, mirror bootstrap,
//! signal handling, and the accept loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gitcached_proc::ProcessQueue;
use gitcached_proxy::{EngineConfig, GitToolchain, ProxyServer, ServerConfig, TcpDial};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gitcached", version, about = "Caching proxy for the git daemon protocol")]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 9418)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Mirror repository directory.
    #[arg(short, long, default_value = "./cache")]
    cache_dir: PathBuf,

    /// Maximum concurrent toolchain subprocesses.
    #[arg(long, default_value_t = 2)]
    process_limit: usize,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,

    /// Let connection-task panics crash the daemon instead of being
    /// contained. For test runs.
    #[arg(long)]
    test_mode: bool,

    /// Seconds a finished connection stays visible in the SIGHUP dump.
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // One cooperative scheduling domain for all connections.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        cache = %args.cache_dir.display(),
        "gitcached starting"
    );

    let queue = ProcessQueue::new(args.process_limit);
    let toolchain = GitToolchain::new(&args.cache_dir, queue);
    toolchain
        .ensure_mirror()
        .await
        .context("preparing mirror repository")?;

    let config = ServerConfig {
        engine: EngineConfig {
            default_port: 9418,
            ..EngineConfig::default()
        },
        grace: Duration::from_secs(args.grace_secs),
        test_mode: args.test_mode,
        version: String::from(env!("CARGO_PKG_VERSION")),
    };
    let server = Arc::new(ProxyServer::new(
        toolchain.into_shared(),
        Arc::new(TcpDial),
        config,
    ));

    let listener = TcpListener::bind((args.bind.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.bind, args.port))?;

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let accept = Arc::clone(&server).serve(listener);
    tokio::pin!(accept);
    loop {
        tokio::select! {
            result = &mut accept => {
                result.context("accept loop failed")?;
                break;
            }
            _ = hangup.recv() => {
                for line in server.render_stats().lines() {
                    tracing::info!("{line}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            _ = terminate.recv() => {
                tracing::info!("terminated, shutting down");
                break;
            }
        }
    }
    Ok(())
}
