//! Runtime hosting one instance of a user function.
//!
//! Wire a [`FunctionInstance`] from an [`InstanceConfig`] and its
//! collaborators, call `run()` on a dedicated task, and observe or stop it
//! through the [`InstanceHandle`].

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod instance;
pub mod loader;
pub mod log_forwarder;
pub mod memory_store;
pub mod messaging;
pub mod secrets;
pub mod sink;
pub mod source;
pub mod state;
pub mod stats;
pub(crate) mod sync;

pub use config::InstanceConfig;
pub use error::{InstanceError, StorageError};
pub use instance::{ExecutionResult, FunctionInstance, FunctionStatus, InstanceDeps, InstanceHandle, InstanceState};
pub use stats::MetricsData;
