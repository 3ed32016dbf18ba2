//! `vitrine-core` — configuration and shared error types for the vitrine
//! publication engine.

pub mod config;
pub mod error;

pub use config::{PublisherConfig, StoreConfig, VitrineConfig};
pub use error::{CoreError, Result};
