//! broker-state: persistence for the service broker.
//!
//! [`StateStore`] is a flat key-value store backed by
//! [redb](https://docs.rs/redb) with get/set/delete, recursive prefix
//! listing, and a distinguishable not-found error. [`Dao`] layers typed
//! access to specs, instances, bindings, job states and credentials on top
//! of it and owns the key layout.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod dao;
pub mod error;
pub mod store;
pub mod tables;

pub use dao::Dao;
pub use error::{StateError, StateResult};
pub use store::StateStore;
