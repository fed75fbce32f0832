//! First-frame request parsing.
//!
//! A git daemon request line looks like
//! `git-upload-pack /project.git\0host=example.com\0` with optional
//! extra `key=value` entries. The proxy additionally understands a
//! `remote=<host>/<path>` query parameter embedded in the path, which
//! lets a client aim an explicitly configured proxy at any upstream.

use crate::error::{ProxyError, Result};

pub const UPLOAD_PACK_SERVICE: &str = "git-upload-pack";

/// Where the client wants to fetch from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub host: String,
    pub port: u16,
    pub repo: String,
}

impl Request {
    /// The request line to replay upstream.
    pub fn upstream_line(&self) -> String {
        format!("{UPLOAD_PACK_SERVICE} {}\0host={}\0", self.repo, self.host)
    }
}

/// Parses the client's first frame.
pub fn parse(payload: &[u8], default_port: u16) -> Result<Request> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ProxyError::Protocol(String::from("request line is not utf-8")))?;
    let text = text.trim_end_matches(['\n', '\0']);

    let (service, rest) = text
        .split_once(' ')
        .ok_or_else(|| ProxyError::Protocol(String::from("request line has no path")))?;
    if service != UPLOAD_PACK_SERVICE {
        return Err(ProxyError::Protocol(format!(
            "unsupported service {service:?}, only {UPLOAD_PACK_SERVICE} is proxied"
        )));
    }

    let mut parts = rest.split('\0');
    let path = parts.next().unwrap_or_default();
    let mut host_param = None;
    for entry in parts {
        if let Some(value) = entry.strip_prefix("host=") {
            host_param = Some(value);
        }
    }

    // remote=<host>/<path> in the path's query wins over host=.
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let remote = query.and_then(|q| {
        q.split('&')
            .find_map(|entry| entry.strip_prefix("remote="))
    });

    let (host, repo) = match remote {
        Some(remote) => {
            let (host, repo_tail) = remote
                .split_once('/')
                .ok_or_else(|| ProxyError::Protocol(format!("remote {remote:?} has no path")))?;
            (host, format!("/{repo_tail}"))
        }
        None => {
            let host = host_param.ok_or_else(|| {
                ProxyError::Protocol(String::from("no host= entry and no remote= parameter"))
            })?;
            (host, path.to_owned())
        }
    };
    if host.is_empty() {
        return Err(ProxyError::Protocol(String::from("empty upstream host")));
    }
    if repo.is_empty() {
        return Err(ProxyError::Protocol(String::from("empty repository path")));
    }

    let (host, port) = match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::Protocol(format!("bad port {port:?}")))?;
            (name, port)
        }
        _ => (host, default_port),
    };

    Ok(Request {
        host: host.to_owned(),
        port,
        repo,
    })
}
