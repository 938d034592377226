//! The backend registry and the server context that owns it. The context is
//! explicitly constructed and explicitly passed - there is no static server
//! instance - which also means tests can run any number of independent
//! contexts side by side.
//!
//! Concurrency model: the backend map and the base-DN registry are read by
//! every inbound request and mutated rarely. Both live in `CowCell`s; writers
//! build a replacement value and commit it atomically so readers always see a
//! fully-old or fully-new mapping. All mutation is serialised by one
//! process-wide mutex.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use arbored_proto::OperationError;
use concread::cowcell::CowCell;
use hashbrown::HashMap;

use crate::be::Backend;
use crate::credential::StorageSchemeRegistry;
use crate::dn::Dn;
use crate::lock::LockManager;
use crate::monitor::MonitorRegistry;
use crate::registry::basedn::{BaseDnRegistry, RegistryWarning};

pub struct ServerContext {
    backends: CowCell<HashMap<String, Arc<dyn Backend>>>,
    base_dns: CowCell<BaseDnRegistry>,
    lock_mgr: Arc<dyn LockManager>,
    monitors: Arc<dyn MonitorRegistry>,
    schemes: Arc<StorageSchemeRegistry>,
    // Serialises all registry mutation. Never held across a read path.
    write_lock: Mutex<()>,
}

impl ServerContext {
    pub fn new(
        lock_mgr: Arc<dyn LockManager>,
        monitors: Arc<dyn MonitorRegistry>,
        schemes: Arc<StorageSchemeRegistry>,
    ) -> Self {
        ServerContext {
            backends: CowCell::new(HashMap::new()),
            base_dns: CowCell::new(BaseDnRegistry::new()),
            lock_mgr,
            monitors,
            schemes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.lock_mgr
    }

    pub fn monitors(&self) -> &Arc<dyn MonitorRegistry> {
        &self.monitors
    }

    pub fn schemes(&self) -> &Arc<StorageSchemeRegistry> {
        &self.schemes
    }

    /// Register a backend and every base DN it reports. ID uniqueness and all
    /// base-DN registrations are validated against a copy of the registry
    /// first, so a conflict on the third DN of three leaves no trace of the
    /// first two. The monitor registration that follows is non-fatal.
    pub fn register_backend(
        &self,
        backend: Arc<dyn Backend>,
        private: bool,
    ) -> Result<Vec<RegistryWarning>, OperationError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| OperationError::InvalidState("registry mutation lock poisoned".into()))?;

        let backend_id = backend.backend_id();
        {
            let cur = self.backends.read();
            if cur.contains_key(&backend_id) {
                return Err(OperationError::DuplicateBackendId(backend_id));
            }
        }

        let mut new_reg = self.base_dns.read().copy();
        let mut warnings = Vec::new();
        for dn in backend.base_dns() {
            warnings.extend(new_reg.register_base_dn(dn, &backend_id, private)?);
        }

        // Commit the backend map first: the new routes in the base-DN
        // registry must resolve the moment they become visible.
        let mut bw = self.backends.write();
        bw.insert(backend_id.clone(), backend);
        bw.commit();
        let mut rw = self.base_dns.write();
        *rw = new_reg;
        rw.commit();

        let monitor_name = format!("backend-{backend_id}");
        if let Err(e) = self.monitors.register_monitor(&monitor_name) {
            admin_warn!(backend_id = %backend_id, err = %e, "Unable to register backend monitor");
        }
        Ok(warnings)
    }

    /// Remove a backend and all of its base DNs. The base-DN registry commits
    /// first so requests stop routing to the backend before its handle
    /// disappears. Returns the removed handle so the caller can finalize it.
    #[allow(clippy::type_complexity)]
    pub fn deregister_backend(
        &self,
        backend_id: &str,
    ) -> Result<(Vec<RegistryWarning>, Arc<dyn Backend>), OperationError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| OperationError::InvalidState("registry mutation lock poisoned".into()))?;

        let backend = self
            .backends
            .read()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| OperationError::NoSuchBackend(backend_id.to_string()))?;

        let mut new_reg = self.base_dns.read().copy();
        let mut warnings = Vec::new();
        for dn in new_reg.base_dns_for_backend(backend_id) {
            warnings.extend(new_reg.deregister_base_dn(&dn)?);
        }

        let mut rw = self.base_dns.write();
        *rw = new_reg;
        rw.commit();
        let mut bw = self.backends.write();
        bw.remove(backend_id);
        bw.commit();

        self.monitors
            .deregister_monitor(&format!("backend-{backend_id}"));
        Ok((warnings, backend))
    }

    pub fn backend(&self, backend_id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().get(backend_id).cloned()
    }

    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.backends.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route a request DN to the backend authoritative for it.
    pub fn backend_for_dn(&self, target: &Dn) -> Option<(Dn, Arc<dyn Backend>)> {
        let reg = self.base_dns.read();
        let (base_dn, backend_id) = reg.backend_id_for_dn(target)?;
        request_trace!(target = %target, backend_id, "routing request");
        let backend = self.backends.read().get(backend_id).cloned()?;
        Some((base_dn.clone(), backend))
    }

    /// A snapshot copy of the base-DN registry, for dry-run validation of
    /// pending configuration changes.
    pub fn base_dn_registry_copy(&self) -> BaseDnRegistry {
        self.base_dns.read().copy()
    }

    pub fn public_naming_contexts(&self) -> Vec<Dn> {
        self.base_dns.read().public_naming_contexts().iter().cloned().collect()
    }

    pub fn private_naming_contexts(&self) -> Vec<Dn> {
        self.base_dns.read().private_naming_contexts().iter().cloned().collect()
    }

    pub fn subordinate_backends(&self, backend_id: &str) -> BTreeSet<String> {
        self.base_dns.read().subordinate_backends(backend_id)
    }
}
