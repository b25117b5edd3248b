//! Crate-wide error type.
//!
//! Configuration problems are fatal at load time and abort startup with a
//! descriptive message. Per-request failures (upstream errors, RMI faults)
//! are recovered locally and never surface through this type to the caller
//! of the request pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A malformed or incomplete configuration block.
    #[error("config error: {0}")]
    Config(String),

    /// Two component classes registered under the same namespace.
    #[error("duplicate component namespace: {0}")]
    DuplicateNamespace(String),

    /// A configuration block referenced a namespace nothing registered.
    #[error("unknown component namespace: {0}")]
    UnknownNamespace(String),

    /// Two configuration blocks carried the same `id`.
    #[error("duplicate component id: {0}")]
    DuplicateId(String),

    /// An id reference (logger, rate limiter, balancer, store, stream)
    /// pointing at no component of the expected kind.
    #[error("unresolved {kind} reference: {id}")]
    UnresolvedReference { kind: &'static str, id: String },

    /// A `//`-prefixed match value that failed to compile.
    #[error("invalid match pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// An RMI request named a method the component does not expose.
    #[error("component {component} has no method {method:?}")]
    UnknownMethod { component: String, method: String },

    /// The cross-process channel is gone or was never established.
    #[error("rmi channel unavailable: {0}")]
    Rmi(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
