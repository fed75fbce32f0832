//! Caching proxy for the git daemon protocol.
//!
//! Sits between `git fetch` clients and an upstream git daemon,
//! mirrors everything it fetches into a local repository via the `git`
//! toolchain, and serves each client from that mirror — dropping wants
//! the mirror already has from the upstream request and offering
//! cached commits as haves so repeat fetches transfer only deltas.

pub mod engine;
pub mod error;
pub mod git;
pub mod lines;
pub mod refs;
pub mod request;
pub mod server;
pub mod types;

pub use engine::{ConnectionEngine, Dial, EngineConfig, Phase, PhaseCell, TcpDial};
pub use error::{ProxyError, Result};
pub use git::{GitToolchain, PackIngest, PackSession, Toolchain};
pub use server::{ProxyServer, ServerConfig, Stats};
pub use types::{CacheState, ObjectId, RefRecord, ServerLink};
