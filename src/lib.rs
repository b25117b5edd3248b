//! Configurable reverse proxy / gateway.
//!
//! A declarative configuration tree is turned into a live component graph
//! (servers, routes, balancers, rate limiters, loggers, stores) with
//! deterministic load order and cross-references by identifier. Requests are
//! matched against an ordered route list and either served, redirected or
//! proxied to an upstream, including transparent WebSocket tunneling. A
//! primary process can supervise worker processes and expose primary-owned
//! components to them over a JSON-line RMI channel.

// Component plug-in core
pub mod component;
pub mod config;

// Request handling
pub mod balancer;
pub mod limiter;
pub mod routes;
pub mod server;

// Shared state & logging
pub mod logger;
pub mod store;
pub mod stream;

// Multi-process fan-out
pub mod cluster;

pub mod error;

pub use component::{Component, Registry};
pub use error::{Error, Result};
