//! HTTP(S) listeners and the per-request dispatch pipeline.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     -> http.rs (axum listener, TLS, cert watch)
//!     -> pipeline.rs (parse URL -> match -> rate-limit -> execute -> log)
//!     -> route execute (serve | redirect | proxy)
//! ```

pub mod http;
pub mod pipeline;

pub use http::HttpServer;
pub use pipeline::Dispatcher;
