//! The monitor registry collaborator. The core registers a monitor per
//! backend; a failure to register is logged by the caller and is never fatal
//! to the operation that triggered it.

use std::sync::Mutex;

use arbored_proto::OperationError;
use hashbrown::HashSet;

pub trait MonitorRegistry: Send + Sync {
    fn register_monitor(&self, name: &str) -> Result<(), OperationError>;

    fn deregister_monitor(&self, name: &str);
}

#[derive(Default)]
pub struct InProcessMonitorRegistry {
    monitors: Mutex<HashSet<String>>,
}

impl InProcessMonitorRegistry {
    pub fn new() -> Self {
        InProcessMonitorRegistry::default()
    }
}

impl MonitorRegistry for InProcessMonitorRegistry {
    fn register_monitor(&self, name: &str) -> Result<(), OperationError> {
        let mut monitors = self
            .monitors
            .lock()
            .map_err(|_| OperationError::InvalidState("monitor registry poisoned".to_string()))?;
        if !monitors.insert(name.to_string()) {
            return Err(OperationError::InvalidState(format!(
                "monitor {name} is already registered"
            )));
        }
        Ok(())
    }

    fn deregister_monitor(&self, name: &str) {
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.remove(name);
        }
    }
}
