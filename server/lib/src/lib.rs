//! The Arbored server core library. This implements the backend and base-DN
//! registries, the backend lifecycle state machine driven by configuration
//! changes, workflow routing, and the password-policy state machine. The wire
//! protocol, storage engines and access controls live in the surrounding
//! layers and collaborate with this core through the traits in [`be`],
//! [`lock`] and [`monitor`].

#![deny(warnings)]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

// This has to be before the other modules so the macro import order works.
#[macro_use]
pub mod macros;

pub mod be;
pub mod condition;
pub mod config;
pub mod credential;
pub mod dn;
pub mod entry;
pub mod idm;
pub mod lifecycle;
pub mod lock;
pub mod modify;
pub mod monitor;
pub mod registry;
pub(crate) mod utils;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testkit;

pub mod prelude {
    pub use std::time::Duration;

    pub use arbored_proto::{ConfigChangeResult, OperationError, ResultCode};

    pub use crate::be::{Backend, BackendFactoryRegistry, WritabilityMode};
    pub use crate::condition::Condition;
    pub use crate::config::{BackendEntryConfig, NetworkGroupConfig, WorkflowConfig};
    pub use crate::credential::{PasswordStorageScheme, StorageSchemeRegistry};
    pub use crate::dn::Dn;
    pub use crate::entry::{Attribute, Entry};
    pub use crate::idm::policy::{PasswordPolicy, PolicyStore};
    pub use crate::idm::policystate::PasswordPolicyState;
    pub use crate::lifecycle::{BackendInitListener, BackendLifecycleManager, LifecycleState};
    pub use crate::lock::LockManager;
    pub use crate::macros::EventTag;
    pub use crate::modify::{Modify, ModifyList};
    pub use crate::monitor::MonitorRegistry;
    pub use crate::registry::backends::ServerContext;
    pub use crate::registry::basedn::{BaseDnRegistry, RegistryWarning};
    pub use crate::utils::duration_from_epoch_now;
    pub use crate::workflow::{RoutingConfig, RoutingMode, Workflow, WorkflowRouter};
}
