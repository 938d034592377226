//! Identity management: password policy resolution and the per-operation
//! password policy state machine.

pub mod policy;
pub mod policystate;
