//! Log-line sinks.
//!
//! A stream accepts whole lines and must be callable from the request
//! pipeline without blocking the response path; the logger spawns writes.
//! Streams expose `write` over RMI so a primary-owned file can collect the
//! access logs of every worker.

pub mod file;
pub mod shared;

use async_trait::async_trait;

pub use file::FileStream;
pub use file::StdoutStream;
pub use shared::SharedStream;

#[async_trait]
pub trait LogStream: Send + Sync {
    /// Append one line. Failures are reported through tracing, never to
    /// the caller.
    async fn write(&self, line: &str);
}
