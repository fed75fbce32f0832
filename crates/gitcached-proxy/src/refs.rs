//! Ref-name construction for the mirror's two namespaces.
//!
//! Each connection writes the refs it fetched twice: once under
//! `refs/in-progress/<connection-id>/`, a namespace nobody else
//! touches, and once under `refs/persistent/<host>/<repo>/`, the
//! shared cache namespace later connections draw haves from.
//! Persistent names are derived deterministically so concurrent
//! writers land on the same ref; last write wins.

use std::net::SocketAddr;

pub const IN_PROGRESS_ROOT: &str = "refs/in-progress";
pub const PERSISTENT_ROOT: &str = "refs/persistent";

/// Replaces every character outside `[A-Za-z0-9/_.-]` with `-` and
/// collapses runs of slashes, yielding a valid ref path segment chain.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_slash = false;
    for c in raw.chars() {
        let c = match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '/' | '_' | '.' | '-' => c,
            _ => '-',
        };
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    out
}

/// The shared cache name for an upstream ref.
pub fn persistent_ref(host: &str, repo: &str, ref_name: &str) -> String {
    sanitize(&format!("{PERSISTENT_ROOT}/{host}/{repo}/{ref_name}"))
}

/// The connection-private name for an upstream ref.
pub fn in_progress_ref(connection_id: &str, ref_name: &str) -> String {
    sanitize(&format!("{IN_PROGRESS_ROOT}/{connection_id}/{ref_name}"))
}

/// Prefix of one connection's private subtree, for enumeration.
pub fn in_progress_prefix(connection_id: &str) -> String {
    sanitize(&format!("{IN_PROGRESS_ROOT}/{connection_id}/"))
}

/// A connection id derived from the peer address, safe to embed in
/// ref names and keep-marker files. IPv6 colons become dots.
pub fn connection_id(peer: SocketAddr) -> String {
    format!("{}-{}", peer.ip(), peer.port())
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '.',
        })
        .collect()
}
