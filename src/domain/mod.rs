//! Domain layer - Core archival types and port definitions
//!
//! This module defines the storage system model, archive entries, and the
//! backend port that storage adapters implement.

pub mod entry;
pub mod ports;
pub mod system;

pub use entry::*;
pub use ports::*;
pub use system::*;
