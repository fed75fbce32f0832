//! Fixed-shape records for the negotiation lifecycle.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ProxyError, Result};

/// A 40-character hexadecimal object id, held lowercase.
///
/// The wire allows mixed case in ACK lines, so parsing normalises;
/// anything that is not exactly 40 hex digits is a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() != 40 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProxyError::Protocol(format!("bad object id {raw:?}")));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How much of the request the local mirror covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// The client asked for nothing.
    NoObjects,
    /// Every requested id was already local; nothing went upstream.
    Hot,
    /// Some ids were fetched, but upstream acknowledged a shared
    /// ancestor, so the transfer was incremental.
    Warm,
    /// Everything came from upstream.
    Cold,
}

impl CacheState {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::NoObjects => "no_objects",
            CacheState::Hot => "hot",
            CacheState::Warm => "warm",
            CacheState::Cold => "cold",
        }
    }
}

/// One advertised ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub id: ObjectId,
    pub name: String,
}

/// The upstream side of a connection: where it points and what it
/// advertised.
///
/// `refs_by_name` and `refs_by_id` are kept consistent by routing all
/// inserts through [`ServerLink::record_ref`]. `refs_in_order`
/// preserves advertisement order, which matters because the first
/// advertised line is the one that carried the capability list.
#[derive(Debug)]
pub struct ServerLink {
    pub host: String,
    pub port: u16,
    pub repo: String,
    pub capabilities: Vec<String>,
    refs_by_name: HashMap<String, ObjectId>,
    refs_by_id: HashMap<ObjectId, String>,
    refs_in_order: Vec<RefRecord>,
}

impl ServerLink {
    pub fn new(host: String, port: u16, repo: String) -> Self {
        Self {
            host,
            port,
            repo,
            capabilities: Vec::new(),
            refs_by_name: HashMap::new(),
            refs_by_id: HashMap::new(),
            refs_in_order: Vec::new(),
        }
    }

    /// Records one advertised ref in both maps and the ordered list.
    /// When several refs share an id, the last advertised name wins in
    /// the id map, mirroring the upstream advertisement semantics.
    pub fn record_ref(&mut self, id: ObjectId, name: String) {
        self.refs_by_name.insert(name.clone(), id.clone());
        self.refs_by_id.insert(id.clone(), name.clone());
        self.refs_in_order.push(RefRecord { id, name });
    }

    pub fn ref_name_for(&self, id: &ObjectId) -> Option<&str> {
        self.refs_by_id.get(id).map(String::as_str)
    }

    pub fn id_for_ref(&self, name: &str) -> Option<&ObjectId> {
        self.refs_by_name.get(name)
    }

    pub fn advertised(&self) -> &[RefRecord] {
        &self.refs_in_order
    }

    /// Diagnostic label, `host:port/repo`.
    pub fn label(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.repo)
    }
}
