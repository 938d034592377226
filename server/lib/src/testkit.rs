//! Test support: logging bootstrap, an in-memory backend implementation and
//! context builders. Test only, never part of the production surface.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arbored_proto::OperationError;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::be::{Backend, BackendFactory, BackendFactoryRegistry, WritabilityMode};
use crate::config::BackendEntryConfig;
use crate::credential::StorageSchemeRegistry;
use crate::dn::Dn;
use crate::lock::{LockManager, ProcessLockManager};
use crate::monitor::InProcessMonitorRegistry;
use crate::registry::backends::ServerContext;

/// Start up the logging for test mode.
pub(crate) fn test_init() {
    let filter = EnvFilter::from_default_env();
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer().with_filter(filter))
        .try_init();
}

#[derive(Default)]
struct MemBackendInner {
    backend_id: String,
    base_dns: Vec<Dn>,
    writability: WritabilityMode,
    configured: bool,
}

/// An in-memory backend. Stores nothing; tracks lifecycle state so tests can
/// assert on configure/initialize/finalize ordering.
pub(crate) struct MemBackend {
    inner: Mutex<MemBackendInner>,
    initialized: AtomicBool,
    finalized: AtomicBool,
    fail_init: bool,
    config_backend: bool,
}

impl MemBackend {
    pub(crate) fn new() -> Self {
        MemBackend {
            inner: Mutex::new(MemBackendInner::default()),
            initialized: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            fail_init: false,
            config_backend: false,
        }
    }

    fn new_failing_init() -> Self {
        MemBackend {
            fail_init: true,
            ..MemBackend::new()
        }
    }

    fn new_config_backend() -> Self {
        MemBackend {
            config_backend: true,
            ..MemBackend::new()
        }
    }

    /// A backend already configured with the given ID and base DNs, for tests
    /// that drive the registries directly rather than via the lifecycle
    /// manager.
    pub(crate) fn ready(backend_id: &str, base_dns: &[&str]) -> Self {
        let be = MemBackend::new();
        {
            let mut inner = be.inner.lock().expect("mem backend poisoned");
            inner.backend_id = backend_id.to_string();
            inner.base_dns = base_dns
                .iter()
                .map(|s| Dn::from_str(s).expect("invalid test dn"))
                .collect();
            inner.configured = true;
        }
        be
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

impl Backend for MemBackend {
    fn backend_id(&self) -> String {
        self.inner.lock().expect("mem backend poisoned").backend_id.clone()
    }

    fn base_dns(&self) -> Vec<Dn> {
        self.inner.lock().expect("mem backend poisoned").base_dns.clone()
    }

    fn configure(&self, cfg: &BackendEntryConfig) -> Result<(), OperationError> {
        let base_dns = cfg
            .base_dns
            .iter()
            .map(|s| Dn::from_str(s))
            .collect::<Result<Vec<_>, _>>()?;
        let mut inner = self.inner.lock().expect("mem backend poisoned");
        inner.backend_id = cfg.backend_id.clone();
        inner.base_dns = base_dns;
        inner.writability = cfg.writability;
        inner.configured = true;
        Ok(())
    }

    fn initialize(&self) -> Result<(), OperationError> {
        if self.fail_init {
            return Err(OperationError::InvalidState(
                "simulated initialization failure".to_string(),
            ));
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    fn set_writability(&self, mode: WritabilityMode) {
        self.inner.lock().expect("mem backend poisoned").writability = mode;
    }

    fn writability(&self) -> WritabilityMode {
        self.inner.lock().expect("mem backend poisoned").writability
    }

    fn is_config_backend(&self) -> bool {
        self.config_backend
    }
}

pub(crate) fn mem_backend_factory() -> BackendFactory {
    // A factory hands back a backend already carrying its configuration, the
    // same contract a production factory honours.
    Box::new(|cfg| {
        let be = MemBackend::new();
        be.configure(cfg)?;
        Ok(Arc::new(be) as Arc<dyn Backend>)
    })
}

/// Factory registry with the classes the lifecycle tests exercise:
/// "memory" (works), "failinit" (initialize errors), "confighandler"
/// (bootstrap-only config backend).
pub(crate) fn test_factories() -> BackendFactoryRegistry {
    let mut reg = BackendFactoryRegistry::new();
    reg.register_factory("memory", mem_backend_factory());
    reg.register_factory(
        "failinit",
        Box::new(|cfg| {
            let be = MemBackend::new_failing_init();
            be.configure(cfg)?;
            Ok(Arc::new(be) as Arc<dyn Backend>)
        }),
    );
    reg.register_factory(
        "confighandler",
        Box::new(|cfg| {
            let be = MemBackend::new_config_backend();
            be.configure(cfg)?;
            Ok(Arc::new(be) as Arc<dyn Backend>)
        }),
    );
    reg
}

pub(crate) fn test_backend_config(backend_id: &str, base_dns: &[&str]) -> BackendEntryConfig {
    BackendEntryConfig {
        config_dn: format!("ds-cfg-backend-id={backend_id},cn=backends,cn=config"),
        backend_id: backend_id.to_string(),
        implementation_class: "memory".to_string(),
        enabled: true,
        base_dns: base_dns.iter().map(|s| s.to_string()).collect(),
        writability: WritabilityMode::Enabled,
        private: false,
    }
}

pub(crate) fn test_context() -> Arc<ServerContext> {
    test_init();
    Arc::new(ServerContext::new(
        Arc::new(ProcessLockManager::new()),
        Arc::new(InProcessMonitorRegistry::new()),
        Arc::new(StorageSchemeRegistry::with_default_schemes()),
    ))
}

pub(crate) fn test_context_with_locks(lock_mgr: Arc<dyn LockManager>) -> Arc<ServerContext> {
    test_init();
    Arc::new(ServerContext::new(
        lock_mgr,
        Arc::new(InProcessMonitorRegistry::new()),
        Arc::new(StorageSchemeRegistry::with_default_schemes()),
    ))
}

/// A lock manager that refuses everything, to drive the lock-failure paths.
pub(crate) struct DenyLockManager;

impl LockManager for DenyLockManager {
    fn acquire_shared(&self, key: &str) -> Result<(), OperationError> {
        Err(OperationError::LockError {
            key: key.to_string(),
            reason: "lock held by another process".to_string(),
        })
    }

    fn release(&self, key: &str) -> Result<(), OperationError> {
        Err(OperationError::LockError {
            key: key.to_string(),
            reason: "lock held by another process".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{test_backend_config, MemBackend};
    use crate::be::Backend;

    #[test]
    fn test_mem_backend_lifecycle_flags() {
        let be = MemBackend::new();
        let cfg = test_backend_config("userRoot", &["dc=example,dc=com"]);
        be.configure(&cfg).expect("configure");
        be.initialize().expect("initialize");
        assert_eq!(be.backend_id(), "userRoot");
        assert!(!be.is_finalized());
        be.finalize();
        assert!(be.is_finalized());
    }
}
