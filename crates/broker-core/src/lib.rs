//! broker-core: types shared by every broker crate.
//!
//! Holds the catalog and instance model persisted by `broker-state`, the
//! rules that derive a spec's name and ID, and the daemon config file.

pub mod config;
pub mod identity;
pub mod types;

pub use config::{BrokerConfig, BrokerdConfig};
pub use identity::{SpecError, derive_fq_name, validate_spec};
pub use types::*;
