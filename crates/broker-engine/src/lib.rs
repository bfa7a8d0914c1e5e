//! broker-engine: the service broker's lifecycle engine.
//!
//! [`Broker`] implements provision, deprovision, bind, unbind, last
//! operation and catalog bootstrap on top of the state store
//! (`broker-state`) and the cluster runner (`broker-runner`). Long runs go
//! through the [`WorkEngine`], whose subscribers persist job outcomes, and
//! [`Broker::recover`] picks up jobs an earlier process left behind.

pub mod broker;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod recovery;
pub mod registry;
pub mod requests;
pub mod subscribers;

pub use broker::{Broker, PUSH_REGISTRY};
pub use catalog::{Service, ServicePlan};
pub use engine::{DEPROVISION_TOPIC, Job, PROVISION_TOPIC, WorkEngine, WorkMsg, WorkSubscriber};
pub use error::{BrokerError, BrokerResult, EngineError, EngineResult, RegistryError};
pub use jobs::{DeprovisionJob, ProvisionJob};
pub use recovery::RecoveryReport;
pub use registry::{DirectoryRegistry, Registry};
pub use requests::*;
pub use subscribers::{
    DeprovisionWorkSubscriber, ProvisionWorkSubscriber, cleanup_deprovision, start_engine,
};
