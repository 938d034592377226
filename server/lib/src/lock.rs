//! The advisory lock collaborator. Backend activation takes a shared lock
//! keyed by backend ID before initialisation; a real deployment backs this
//! with lock files so that two server processes cannot open the same backend.
//! Semantics are non-blocking: acquisition succeeds or fails immediately.

use std::sync::Mutex;

use arbored_proto::OperationError;
use hashbrown::HashMap;

pub trait LockManager: Send + Sync {
    fn acquire_shared(&self, key: &str) -> Result<(), OperationError>;

    fn release(&self, key: &str) -> Result<(), OperationError>;
}

/// Process-local lock table. Shared holders are counted; release without a
/// matching acquire is an error so that unbalanced acquire/release pairs in
/// the lifecycle paths surface instead of silently leaking.
#[derive(Default)]
pub struct ProcessLockManager {
    held: Mutex<HashMap<String, usize>>,
}

impl ProcessLockManager {
    pub fn new() -> Self {
        ProcessLockManager::default()
    }

    #[cfg(test)]
    pub(crate) fn holder_count(&self, key: &str) -> usize {
        let held = match self.held.lock() {
            Ok(h) => h,
            Err(p) => p.into_inner(),
        };
        held.get(key).copied().unwrap_or(0)
    }
}

impl LockManager for ProcessLockManager {
    fn acquire_shared(&self, key: &str) -> Result<(), OperationError> {
        let mut held = self.held.lock().map_err(|_| OperationError::LockError {
            key: key.to_string(),
            reason: "lock table poisoned".to_string(),
        })?;
        *held.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), OperationError> {
        let mut held = self.held.lock().map_err(|_| OperationError::LockError {
            key: key.to_string(),
            reason: "lock table poisoned".to_string(),
        })?;
        match held.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                held.remove(key);
                Ok(())
            }
            None => Err(OperationError::LockError {
                key: key.to_string(),
                reason: "release without a matching acquire".to_string(),
            }),
        }
    }
}
