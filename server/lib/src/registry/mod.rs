//! The shared registries at the core of request routing: base DN to backend,
//! and backend ID to backend instance. Both are read by every inbound request
//! and mutated only under the server context's single mutation lock.

pub mod backends;
pub mod basedn;
