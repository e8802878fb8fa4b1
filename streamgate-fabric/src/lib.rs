//! # StreamGate Service Fabric
//!
//! The coordination layer shared by every StreamGate deployment mode. The
//! same plugin code runs inside one monolithic process or as standalone
//! services, and this crate supplies the pieces that make the two wirings
//! interchangeable:
//!
//! - **Event bus** ([`bus`]): pub/sub over dot-separated subjects, with an
//!   in-process variant for the monolith and a NATS-backed variant for
//!   microservices, both satisfying the same [`bus::EventBus`] contract.
//! - **Service registry** ([`registry`]): register/deregister with health
//!   heartbeats, staleness-filtered discovery, and watch streams that deliver
//!   an initial snapshot followed by membership deltas.
//! - **RPC client pool** ([`rpc`]): cached connections to discovered
//!   instances, round-robin or least-outstanding picking, per-instance
//!   circuit breakers, and failure-aware eviction.
//!
//! Components in this crate own their reconnect and retry machinery; request
//! handlers built on top of them never carry sleep-and-retry loops.

pub mod bus;
pub mod duration_serde;
pub mod error;
pub mod queue;
pub mod registry;
pub mod rpc;

pub use error::FabricError;
