//! Core modules for projguard's transactional mutation layer.
//!
//! Everything that touches the filesystem on behalf of a transaction lives
//! here: the state store layout, the append-only transaction log, resource
//! locks, the backup store and the transaction manager tying them together.

pub mod backup;
pub mod config;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod output;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod transaction;
pub mod txlog;
