//! fleet-collect: inventory collection for a fleet of managed systems.
//!
//! Systems authenticate with Basic credentials and post inventory snapshots.
//! Snapshots travel through three Redis-backed queues (inventory, processing,
//! notification) drained by worker pools; each stored snapshot is diffed
//! against its predecessor and significant changes become notifications.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod differ;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod store;

pub use error::{DiffError, HandlerError};
