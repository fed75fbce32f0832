//! Accept loop, per-connection tasks and aggregate statistics.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use gitcached_wire::PktStream;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::engine::{ConnectionEngine, Dial, EngineConfig, Phase, PhaseCell};
use crate::error::ProxyError;
use crate::git::Toolchain;
use crate::refs;
use crate::types::CacheState;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub engine: EngineConfig,
    /// How long a finished connection's record stays visible in the
    /// diagnostics dump.
    pub grace: Duration,
    /// Lets connection-task panics propagate instead of being
    /// contained, so test runs fail loudly.
    pub test_mode: bool,
    /// Version string shown in the statistics dump.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            grace: Duration::from_secs(10),
            test_mode: false,
            version: String::from(env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Lifetime counters across all connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub in_progress: u64,
    pub completed: u64,
    pub successful: u64,
    pub errors: u64,
    pub hot: u64,
    pub warm: u64,
    pub cold: u64,
    pub no_objects: u64,
}

impl Stats {
    fn record(&mut self, result: &Result<CacheState, ProxyError>) {
        self.in_progress -= 1;
        self.completed += 1;
        match result {
            Ok(state) => {
                self.successful += 1;
                match state {
                    CacheState::Hot => self.hot += 1,
                    CacheState::Warm => self.warm += 1,
                    CacheState::Cold => self.cold += 1,
                    CacheState::NoObjects => self.no_objects += 1,
                }
            }
            Err(_) => self.errors += 1,
        }
    }
}

pub struct ProxyServer {
    toolchain: Arc<dyn Toolchain>,
    dial: Arc<dyn Dial>,
    config: ServerConfig,
    stats: Mutex<Stats>,
    connections: Mutex<HashMap<String, PhaseCell>>,
}

impl ProxyServer {
    pub fn new(toolchain: Arc<dyn Toolchain>, dial: Arc<dyn Dial>, config: ServerConfig) -> Self {
        Self {
            toolchain,
            dial,
            config,
            stats: Mutex::new(Stats::default()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    /// Human-readable statistics and per-connection phases, dumped on
    /// SIGHUP.
    pub fn render_stats(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "gitcached {}\n\
             connections: {} in progress, {} completed ({} ok, {} failed)\n\
             cache: {} hot, {} warm, {} cold, {} no-objects\n",
            self.config.version,
            stats.in_progress,
            stats.completed,
            stats.successful,
            stats.errors,
            stats.hot,
            stats.warm,
            stats.cold,
            stats.no_objects,
        );
        let connections = self.connections.lock();
        let mut entries: Vec<_> = connections
            .iter()
            .map(|(id, phase)| (id.clone(), phase.lock().label()))
            .collect();
        drop(connections);
        entries.sort();
        for (id, phase) in entries {
            out.push_str(&format!("  {id}: {phase}\n"));
        }
        out
    }

    /// Accepts connections forever. Returns only on listener failure.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            if let Err(error) = socket.set_nodelay(true) {
                tracing::debug!(%peer, %error, "nodelay not set");
            }
            let (read, write) = socket.into_split();
            let client = PktStream::boxed(read, write).with_label(format!("client {peer}"));
            Arc::clone(&self).spawn_connection(refs::connection_id(peer), client);
        }
    }

    /// Runs one connection to completion on its own task, with crash
    /// containment unless configured for tests.
    pub fn spawn_connection(self: Arc<Self>, id: String, client: gitcached_wire::DynPktStream) {
        let phase: PhaseCell = Arc::new(Mutex::new(Phase::AwaitingRequestLine));
        self.connections.lock().insert(id.clone(), Arc::clone(&phase));
        self.stats.lock().in_progress += 1;

        let engine = ConnectionEngine::new(
            id.clone(),
            Arc::clone(&self.toolchain),
            Arc::clone(&self.dial),
            self.config.engine.clone(),
            phase,
        );
        let server = Arc::clone(&self);
        let task = async move {
            let result = engine.run(client).await;
            match &result {
                Ok(state) => {
                    tracing::info!(connection = %id, cache = state.as_str(), "connection finished");
                }
                Err(error) => {
                    tracing::warn!(connection = %id, %error, "connection failed");
                }
            }
            server.stats.lock().record(&result);
            // The record lingers for diagnostics before it disappears.
            tokio::time::sleep(server.config.grace).await;
            server.connections.lock().remove(&id);
        };
        if self.config.test_mode {
            tokio::spawn(task);
        } else {
            tokio::spawn(async move {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| String::from("non-string panic payload"));
                    tracing::error!(panic = %message, "connection task panicked, daemon continues");
                }
            });
        }
    }
}
