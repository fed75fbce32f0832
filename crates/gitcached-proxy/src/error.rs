//! Connection-scoped error taxonomy.

use thiserror::Error;

/// Everything that can end a proxied connection.
///
/// All variants except [`ProxyError::LocalState`] are fatal to the
/// connection: the client gets a best-effort `ERR` frame, then both
/// links are torn down. `LocalState` failures are logged and the
/// lifecycle continues.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request line, object id, or negotiation reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket failure on the client or server link.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream server signalled an error or replied out of turn.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A toolchain subprocess failed to spawn, exited nonzero, or
    /// rejected its input.
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Ref or marker-file housekeeping failed. Recoverable.
    #[error("local state error: {0}")]
    LocalState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Short text for the inline `ERR` frame sent to the client.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::Protocol(msg) => format!("bad request: {msg}"),
            ProxyError::Transport(msg) => format!("connection failed: {msg}"),
            ProxyError::Upstream(msg) => format!("upstream failed: {msg}"),
            ProxyError::Subprocess(_) | ProxyError::LocalState(_) | ProxyError::Io(_) => {
                String::from("internal proxy error")
            }
        }
    }
}

impl From<gitcached_wire::WireError> for ProxyError {
    fn from(error: gitcached_wire::WireError) -> Self {
        match error {
            gitcached_wire::WireError::InvalidLength { prefix } => {
                ProxyError::Protocol(format!("bad frame length prefix {prefix:?}"))
            }
            gitcached_wire::WireError::Io(error) => ProxyError::Transport(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
