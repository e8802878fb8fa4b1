//! # StreamGate Node
//!
//! The runtime platform behind every StreamGate process. One source tree
//! deploys two ways: the monolith registers every plugin into a single
//! microkernel, a microservice process registers exactly one; the plugin
//! code is identical and cannot observe which wiring it received.
//!
//! The crate is organized around the shared platform pieces:
//!
//! - [`metrics`]: typed metric registry with text-exposition scrape
//! - [`rate_limit`]: per-identifier token buckets
//! - [`cache`]: LRU+TTL response cache with prefix invalidation
//! - [`audit`]: append-only audit log with bounded buffering
//! - [`alerts`]: threshold rules over the metric registry
//! - [`health`]: probe aggregation behind the health endpoints
//! - [`pipeline`]: the admit/validate/cache/handle/observe composition
//!   wrapped around every endpoint
//! - [`kernel`]: the plugin contract, resource bundle, and microkernel
//! - [`plugins`]: the built-in service set (gateway, auth, upload,
//!   streaming, metadata, cache, worker, monitor, transcoder)
//! - [`server`]: axum router assembly and the serving loop
//!
//! Coordination between processes (event bus, service registry, RPC pool)
//! lives in the `streamgate-fabric` crate.

pub mod alerts;
pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod kernel;
pub mod metrics;
pub mod pipeline;
pub mod plugins;
pub mod rate_limit;
pub mod server;

pub use error::{Result, ServiceError};
