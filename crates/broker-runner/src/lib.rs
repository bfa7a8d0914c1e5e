//! broker-runner: cluster automation collaborators.
//!
//! The broker drives every provision, bind, unbind and deprovision through
//! the [`Runner`] trait and tears down per-run identities through
//! [`SandboxManager`]. Two implementations ship here:
//!
//! - [`CommandRunner`] / [`DirSandbox`]: runs a local program per action
//!   inside a scratch directory.
//! - [`MockRunner`] / [`MockSandbox`]: in-memory doubles for tests.

pub mod command;
pub mod error;
pub mod mock;
pub mod traits;

pub use command::{CommandRunner, DirSandbox};
pub use error::{RunnerError, RunnerResult};
pub use mock::{MockCall, MockRunner, MockSandbox};
pub use traits::{Cluster, RunOutput, Runner, SandboxManager};
