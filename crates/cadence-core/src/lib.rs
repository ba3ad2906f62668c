//! `cadence-core`: configuration, shared error type and identifier newtypes
//! used by every Cadence crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CoreError, Result};
pub use types::{ItemId, OwnerId, Platform};
