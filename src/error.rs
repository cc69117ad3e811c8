use thiserror::Error;

use crate::memory::{Address, ValueKind};

/// Errors surfaced by the virtual memory map. These are per-request: adapters
/// report them to the offending client in that protocol's own error shape and
/// the map itself is never disturbed.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address {0} is not defined on this device")]
    NotFound(Address),
    #[error("type mismatch at {addr}: expected {expected:?}, got {got:?}")]
    TypeMismatch {
        addr: Address,
        expected: ValueKind,
        got: ValueKind,
    },
}

/// Configuration rejections. All of these are fatal before any socket is
/// bound; a device never starts half-configured.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown device model '{0}'")]
    UnknownModel(String),
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("device {guid} references itself in its topology")]
    SelfReference { guid: crate::simproto::Guid },
    #[error("guid {guid} appears in both upstream and downstream sets")]
    UpstreamDownstreamOverlap { guid: crate::simproto::Guid },
    #[error("duplicate neighbor guid {guid}")]
    DuplicateNeighbor { guid: crate::simproto::Guid },
    #[error("duplicate adapter bind address {0}")]
    DuplicateBind(std::net::SocketAddr),
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal startup failures. Listener bind failure is the only startup error
/// that is not a configuration rejection; neither is retried.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}
