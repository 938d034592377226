//! The backend lifecycle manager. Reacts to configuration add/change/delete
//! events for backend entries and drives each backend through
//! `Unconfigured -> Disabled -> Initializing -> Active -> FinalizingOut`.
//!
//! Error policy: startup is scan-and-skip - one broken backend never stops
//! the others from activating. Live reconfiguration is all-or-nothing per
//! backend, reported back to the configuration framework as a structured
//! [`ConfigChangeResult`] so it can refuse to commit.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use arbored_proto::{ConfigChangeResult, OperationError};
use hashbrown::{HashMap, HashSet};

use crate::be::{Backend, BackendFactoryRegistry};
use crate::config::BackendEntryConfig;
use crate::dn::Dn;
use crate::registry::backends::ServerContext;
use crate::workflow::WorkflowRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disabled,
    Active,
}

/// Notified after a backend completes initialization and before one is
/// finalized out.
pub trait BackendInitListener: Send + Sync {
    fn backend_initialized(&self, backend: &Arc<dyn Backend>);

    fn backend_finalizing(&self, backend: &Arc<dyn Backend>);
}

struct ManagedBackend {
    cfg: BackendEntryConfig,
    state: LifecycleState,
    backend: Option<Arc<dyn Backend>>,
}

pub struct BackendLifecycleManager {
    ctx: Arc<ServerContext>,
    factories: Arc<BackendFactoryRegistry>,
    listeners: Mutex<Vec<Arc<dyn BackendInitListener>>>,
    // When attached, the router re-derives its auto-mode table after every
    // activation and deactivation so routing never serves stale pairs.
    router: Mutex<Option<Arc<WorkflowRouter>>>,
    // Keyed by the *configuration entry DN*, which is distinct from the
    // backend ID: change and delete events arrive keyed this way.
    managed: Mutex<HashMap<String, ManagedBackend>>,
}

fn lock_key(backend_id: &str) -> String {
    format!("backend-{backend_id}")
}

// Change events key on the configuration entry DN; normalise it so case and
// spacing differences cannot split one entry into two.
fn config_key(config_dn: &str) -> String {
    Dn::from_str(config_dn)
        .map(|dn| dn.to_string())
        .unwrap_or_else(|_| config_dn.trim().to_ascii_lowercase())
}

impl BackendLifecycleManager {
    pub fn new(ctx: Arc<ServerContext>, factories: Arc<BackendFactoryRegistry>) -> Self {
        BackendLifecycleManager {
            ctx,
            factories,
            listeners: Mutex::new(Vec::new()),
            router: Mutex::new(None),
            managed: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_init_listener(&self, listener: Arc<dyn BackendInitListener>) {
        self.guard(&self.listeners).push(listener);
    }

    pub fn attach_router(&self, router: Arc<WorkflowRouter>) {
        *self.guard(&self.router) = Some(router);
    }

    fn refresh_routing(&self) {
        let router = self.guard(&self.router).clone();
        if let Some(router) = router {
            if let Err(e) = router.refresh() {
                admin_warn!(err = %e, "Unable to refresh workflow routing");
            }
        }
    }

    fn guard<'a, T>(&self, m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        match m.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Process every configured backend entry at startup. Scan-and-skip: a
    /// failure activating one backend is logged and the loop continues.
    pub fn on_startup(&self, cfgs: &[BackendEntryConfig]) {
        for cfg in cfgs {
            if !cfg.enabled {
                admin_debug!(backend_id = %cfg.backend_id, "Backend is disabled, skipping");
                self.guard(&self.managed).insert(
                    config_key(&cfg.config_dn),
                    ManagedBackend {
                        cfg: cfg.clone(),
                        state: LifecycleState::Disabled,
                        backend: None,
                    },
                );
                continue;
            }
            if let Err(e) = self.activate(cfg) {
                admin_error!(
                    backend_id = %cfg.backend_id,
                    config_dn = %cfg.config_dn,
                    err = %e,
                    "Unable to activate backend, continuing startup without it"
                );
            }
        }
    }

    // The shared activation sequence: instantiate, lock, configure,
    // initialize, notify, register, record. Every exit path after the lock is
    // acquired releases it.
    fn activate(&self, cfg: &BackendEntryConfig) -> Result<Option<Arc<dyn Backend>>, OperationError> {
        if self.ctx.backend(&cfg.backend_id).is_some() {
            return Err(OperationError::DuplicateBackendId(cfg.backend_id.clone()));
        }

        let backend = self.factories.instantiate(cfg)?;

        if backend.is_config_backend() {
            // The configuration handler backend bootstraps before this
            // manager runs; never re-activate it from here.
            admin_debug!(backend_id = %cfg.backend_id, "Skipping configuration handler backend");
            return Ok(None);
        }

        let key = lock_key(&cfg.backend_id);
        self.ctx.lock_manager().acquire_shared(&key)?;

        let init_result = backend
            .configure(cfg)
            .and_then(|_| backend.initialize());
        if let Err(e) = init_result {
            self.release_backend_lock(&cfg.backend_id);
            return Err(OperationError::InitializationError {
                backend_id: cfg.backend_id.clone(),
                cause: e.to_string(),
            });
        }

        for listener in self.guard(&self.listeners).iter() {
            listener.backend_initialized(&backend);
        }

        match self.ctx.register_backend(backend.clone(), cfg.private) {
            Ok(warnings) => {
                for w in warnings {
                    admin_warn!(backend_id = %cfg.backend_id, "{w}");
                }
            }
            Err(e) => {
                admin_error!(backend_id = %cfg.backend_id, err = %e, "Unable to register backend");
                for listener in self.guard(&self.listeners).iter() {
                    listener.backend_finalizing(&backend);
                }
                backend.finalize();
                self.release_backend_lock(&cfg.backend_id);
                return Err(e);
            }
        }

        self.guard(&self.managed).insert(
            config_key(&cfg.config_dn),
            ManagedBackend {
                cfg: cfg.clone(),
                state: LifecycleState::Active,
                backend: Some(backend.clone()),
            },
        );
        admin_info!(backend_id = %cfg.backend_id, "Backend is active");
        self.refresh_routing();
        Ok(Some(backend))
    }

    fn release_backend_lock(&self, backend_id: &str) {
        let key = lock_key(backend_id);
        if let Err(e) = self.ctx.lock_manager().release(&key) {
            // An orphaned lock would block a future restart; a failed release
            // is logged but never escalates.
            admin_warn!(backend_id, err = %e, "Unable to release backend lock");
        }
    }

    // Deregister, notify, finalize, unlock. The inverse of activate.
    fn deactivate(&self, backend_id: &str) -> Result<(), OperationError> {
        let (warnings, backend) = self.ctx.deregister_backend(backend_id)?;
        for w in warnings {
            admin_warn!(backend_id, "{w}");
        }
        for listener in self.guard(&self.listeners).iter() {
            listener.backend_finalizing(&backend);
        }
        backend.finalize();
        self.release_backend_lock(backend_id);
        self.refresh_routing();
        Ok(())
    }

    /// The acceptance phase of a configuration change. Nothing is mutated:
    /// base-DN additions and removals are dry-run against a registry copy,
    /// and the implementation class must resolve to a known backend type.
    pub fn on_acceptable_check(&self, new_cfg: &BackendEntryConfig) -> Result<(), OperationError> {
        let proposed: HashSet<Dn> = new_cfg
            .base_dns
            .iter()
            .map(|s| Dn::from_str(s))
            .collect::<Result<_, _>>()?;

        if !self.factories.contains(&new_cfg.implementation_class) {
            return Err(OperationError::ConfigurationError(format!(
                "backend {} names unknown implementation class {}",
                new_cfg.backend_id, new_cfg.implementation_class
            )));
        }

        let managed = self.guard(&self.managed);
        let Some(m) = managed.get(&config_key(&new_cfg.config_dn)) else {
            return Ok(());
        };
        let Some(backend) = m.backend.as_ref() else {
            return Ok(());
        };

        let current: HashSet<Dn> = backend.base_dns().into_iter().collect();
        let mut dry_run = self.ctx.base_dn_registry_copy();
        for added in proposed.difference(&current) {
            dry_run.register_base_dn(added.clone(), &new_cfg.backend_id, new_cfg.private)?;
        }
        for removed in current.difference(&proposed) {
            dry_run.deregister_base_dn(removed)?;
        }
        Ok(())
    }

    /// Apply a configuration change (or an add, for an entry not seen
    /// before). Three exclusive branches: disable, enable, and live change of
    /// an active backend.
    pub fn on_apply(&self, new_cfg: &BackendEntryConfig) -> ConfigChangeResult {
        let key = config_key(&new_cfg.config_dn);
        let currently_active = {
            let managed = self.guard(&self.managed);
            managed
                .get(&key)
                .map(|m| m.state == LifecycleState::Active)
                .unwrap_or(false)
        };

        match (currently_active, new_cfg.enabled) {
            (true, false) => {
                if let Err(e) = self.deactivate(&new_cfg.backend_id) {
                    return e.into();
                }
                self.guard(&self.managed).insert(
                    key,
                    ManagedBackend {
                        cfg: new_cfg.clone(),
                        state: LifecycleState::Disabled,
                        backend: None,
                    },
                );
                admin_info!(backend_id = %new_cfg.backend_id, "Backend is now disabled");
                ConfigChangeResult::success()
            }
            (false, true) => match self.activate(new_cfg) {
                Ok(Some(_)) => ConfigChangeResult::success(),
                Ok(None) => {
                    let mut ccr = ConfigChangeResult::success();
                    ccr.push_message(
                        "the configuration handler backend is managed by the bootstrap process"
                            .to_string(),
                    );
                    ccr
                }
                Err(e) => e.into(),
            },
            (true, true) => {
                let mut managed = self.guard(&self.managed);
                let Some(m) = managed.get_mut(&key) else {
                    return OperationError::InvalidState(format!(
                        "no managed state for {}",
                        new_cfg.config_dn
                    ))
                    .into();
                };
                if new_cfg.implementation_class != m.cfg.implementation_class {
                    return ConfigChangeResult::admin_action(format!(
                        "the implementation class of backend {} cannot change while it is \
                         active; disable and re-enable the backend, or restart the server",
                        new_cfg.backend_id
                    ));
                }
                if let Some(backend) = m.backend.as_ref() {
                    let proposed: HashSet<Dn> = match new_cfg
                        .base_dns
                        .iter()
                        .map(|s| Dn::from_str(s))
                        .collect::<Result<_, _>>()
                    {
                        Ok(p) => p,
                        Err(e) => return e.into(),
                    };
                    let current: HashSet<Dn> = backend.base_dns().into_iter().collect();
                    if proposed != current {
                        // The live registry keeps serving the current set;
                        // accepting this silently would leave the two views
                        // divergent.
                        return ConfigChangeResult::admin_action(format!(
                            "the base DN set of backend {} cannot change while it is \
                             active; disable and re-enable the backend, or restart the server",
                            new_cfg.backend_id
                        ));
                    }
                    backend.set_writability(new_cfg.writability);
                }
                m.cfg = new_cfg.clone();
                ConfigChangeResult::success()
            }
            (false, false) => {
                self.guard(&self.managed).insert(
                    key,
                    ManagedBackend {
                        cfg: new_cfg.clone(),
                        state: LifecycleState::Disabled,
                        backend: None,
                    },
                );
                ConfigChangeResult::success()
            }
        }
    }

    /// A backend with subordinate backends is never removable.
    pub fn on_delete_acceptable(&self, config_dn: &str) -> bool {
        let managed = self.guard(&self.managed);
        match managed.get(&config_key(config_dn)) {
            Some(m) if m.state == LifecycleState::Active => self
                .ctx
                .subordinate_backends(&m.cfg.backend_id)
                .is_empty(),
            _ => true,
        }
    }

    pub fn on_apply_delete(&self, config_dn: &str) -> ConfigChangeResult {
        let key = config_key(config_dn);
        let (backend_id, active) = {
            let managed = self.guard(&self.managed);
            let Some(m) = managed.get(&key) else {
                return ConfigChangeResult::success();
            };
            (m.cfg.backend_id.clone(), m.state == LifecycleState::Active)
        };

        if active {
            if !self.ctx.subordinate_backends(&backend_id).is_empty() {
                return OperationError::BackendHasSubordinates(backend_id).into();
            }
            if let Err(e) = self.deactivate(&backend_id) {
                return e.into();
            }
        }
        self.guard(&self.managed).remove(&key);
        admin_info!(backend_id = %backend_id, "Backend configuration removed");
        ConfigChangeResult::success()
    }

    /// The lifecycle state of a configuration entry, if it is managed.
    pub fn state_of(&self, config_dn: &str) -> Option<LifecycleState> {
        self.guard(&self.managed)
            .get(&config_key(config_dn))
            .map(|m| m.state)
    }
}
