//! Shared types for the Arbored directory server core. These are the error and
//! result values that cross the boundary between the server core and its
//! collaborators (configuration framework, monitoring, administrative tools).

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

pub mod error;
pub mod result;

pub use crate::error::OperationError;
pub use crate::result::{ConfigChangeResult, ResultCode};
