//! # workq
//!
//! Persistent work queue core: time-scheduled work items, exclusive claims
//! through an atomic store operation, and cooperative processors that report
//! progress and exactly one outcome through a [`Proxy`](processor::Proxy).
//!
//! Failed attempts are retried with exponential backoff until a per-type
//! budget runs out. Stores are pluggable: [`store::MemoryStore`] for tests
//! and single-process use, [`db::Db`] for Postgres.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod policy;
pub mod processor;
pub mod store;
pub mod telemetry;
