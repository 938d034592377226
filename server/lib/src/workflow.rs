//! Workflow routing. A workflow binds one base DN to the backend that serves
//! it and is attached to a network group. In auto mode workflows are derived,
//! one per (backend, base DN) pair in the base-DN registry; in manual mode
//! they are declared configuration objects. The two modes are mutually
//! exclusive strategies over the same registry data, selected once.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use arbored_proto::OperationError;
use concread::cowcell::CowCell;
use hashbrown::HashMap;

use crate::config::{NetworkGroupConfig, WorkflowConfig};
use crate::dn::Dn;
use crate::registry::backends::ServerContext;

pub const DEFAULT_NETWORK_GROUP: &str = "default";

// The two bootstrap-only backends always get a workflow, in either mode.
const CONFIG_BACKEND_ID: &str = "config";
const CONFIG_BASE_DN: &str = "cn=config";
const ROOT_DSE_BACKEND_ID: &str = "root-dse";

pub fn workflow_id(backend_id: &str, base_dn: &Dn) -> String {
    format!("{backend_id}#{base_dn}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub id: String,
    pub base_dn: Dn,
    pub backend_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkGroup {
    pub id: String,
    pub workflow_ids: BTreeSet<String>,
}

/// The desired routing configuration, handed over by the configuration
/// source. Carries the manual definitions when manual mode is selected.
pub enum RoutingConfig<'a> {
    Auto,
    Manual {
        workflows: &'a [WorkflowConfig],
        groups: &'a [NetworkGroupConfig],
    },
}

impl RoutingConfig<'_> {
    pub fn mode(&self) -> RoutingMode {
        match self {
            RoutingConfig::Auto => RoutingMode::Auto,
            RoutingConfig::Manual { .. } => RoutingMode::Manual,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RoutingTable {
    workflows: HashMap<String, Workflow>,
    groups: HashMap<String, NetworkGroup>,
}

impl RoutingTable {
    fn with_default_group() -> Self {
        let mut table = RoutingTable::default();
        table.groups.insert(
            DEFAULT_NETWORK_GROUP.to_string(),
            NetworkGroup {
                id: DEFAULT_NETWORK_GROUP.to_string(),
                workflow_ids: BTreeSet::new(),
            },
        );
        table
    }

    fn insert_workflow(
        &mut self,
        id: String,
        base_dn: Dn,
        backend_id: String,
        group: &str,
    ) -> Result<(), OperationError> {
        if self.workflows.contains_key(&id) {
            return Err(OperationError::DuplicateWorkflowId(id));
        }
        self.workflows.insert(
            id.clone(),
            Workflow {
                id: id.clone(),
                base_dn,
                backend_id,
            },
        );
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| NetworkGroup {
                id: group.to_string(),
                workflow_ids: BTreeSet::new(),
            })
            .workflow_ids
            .insert(id);
        Ok(())
    }

    // The bootstrap workflows may already exist (the config backend can be a
    // registered backend in its own right), so this is idempotent.
    fn append_bootstrap_workflows(&mut self) -> Result<(), OperationError> {
        let config_dn = Dn::from_str(CONFIG_BASE_DN)?;
        let config_id = workflow_id(CONFIG_BACKEND_ID, &config_dn);
        if !self.workflows.contains_key(&config_id) {
            self.insert_workflow(
                config_id,
                config_dn,
                CONFIG_BACKEND_ID.to_string(),
                DEFAULT_NETWORK_GROUP,
            )?;
        }

        let root_dse = Dn::root_dse();
        let root_id = workflow_id(ROOT_DSE_BACKEND_ID, &root_dse);
        if !self.workflows.contains_key(&root_id) {
            self.insert_workflow(
                root_id,
                root_dse,
                ROOT_DSE_BACKEND_ID.to_string(),
                DEFAULT_NETWORK_GROUP,
            )?;
        }
        Ok(())
    }
}

pub struct WorkflowRouter {
    ctx: Arc<ServerContext>,
    table: CowCell<RoutingTable>,
    mode: Mutex<RoutingMode>,
}

impl WorkflowRouter {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        WorkflowRouter {
            ctx,
            table: CowCell::new(RoutingTable::with_default_group()),
            mode: Mutex::new(RoutingMode::Auto),
        }
    }

    /// Build and commit the routing table for the requested mode. The table
    /// is built aside and swapped in atomically; on failure the live table is
    /// untouched.
    pub fn configure(&self, cfg: &RoutingConfig) -> Result<(), OperationError> {
        let new_table = match cfg {
            RoutingConfig::Auto => self.build_auto()?,
            RoutingConfig::Manual { workflows, groups } => self.build_manual(workflows, groups)?,
        };

        let mut w = self.table.write();
        *w = new_table;
        w.commit();
        if let Ok(mut mode) = self.mode.lock() {
            *mode = cfg.mode();
        }
        admin_info!(mode = ?cfg.mode(), "Workflow routing configured");
        Ok(())
    }

    /// Attempt the target routing configuration, rolling back to the prior
    /// one on failure. A double failure is logged as requiring a restart with
    /// a known-good configuration; it never panics.
    pub fn switch_mode(
        &self,
        old: &RoutingConfig,
        new: &RoutingConfig,
    ) -> Result<(), OperationError> {
        let err = match self.configure(new) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        admin_warn!(err = %err, "Unable to apply new routing mode, rolling back");
        if let Err(rollback_err) = self.configure(old) {
            admin_error!(
                err = %rollback_err,
                "Rollback to the previous routing mode also failed; the server \
                 must be restarted with a known-good configuration"
            );
        }
        Err(err)
    }

    /// Re-derive the table from the current registry state, after a backend
    /// was activated or deactivated. A no-op in manual mode, where the table
    /// reflects declared configuration rather than registry contents.
    pub fn refresh(&self) -> Result<(), OperationError> {
        if self.mode() != RoutingMode::Auto {
            return Ok(());
        }
        let new_table = self.build_auto()?;
        let mut w = self.table.write();
        *w = new_table;
        w.commit();
        Ok(())
    }

    pub fn mode(&self) -> RoutingMode {
        match self.mode.lock() {
            Ok(m) => *m,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn workflow(&self, id: &str) -> Option<Workflow> {
        self.table.read().workflows.get(id).cloned()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table.read().workflows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn network_group(&self, id: &str) -> Option<NetworkGroup> {
        self.table.read().groups.get(id).cloned()
    }

    fn build_auto(&self) -> Result<RoutingTable, OperationError> {
        let mut table = RoutingTable::with_default_group();
        let registry = self.ctx.base_dn_registry_copy();
        for (dn, reg) in registry.iter() {
            let id = workflow_id(&reg.backend_id, dn);
            table.insert_workflow(
                id,
                dn.clone(),
                reg.backend_id.clone(),
                DEFAULT_NETWORK_GROUP,
            )?;
        }
        table.append_bootstrap_workflows()?;
        Ok(table)
    }

    fn build_manual(
        &self,
        workflows: &[WorkflowConfig],
        groups: &[NetworkGroupConfig],
    ) -> Result<RoutingTable, OperationError> {
        let mut table = RoutingTable::with_default_group();
        for wf in workflows {
            if self.ctx.backend(&wf.backend_id).is_none() {
                return Err(OperationError::NoSuchBackend(wf.backend_id.clone()));
            }
            let base_dn = Dn::from_str(&wf.base_dn)?;
            table.insert_workflow(
                wf.workflow_id.clone(),
                base_dn,
                wf.backend_id.clone(),
                DEFAULT_NETWORK_GROUP,
            )?;
        }
        for group in groups {
            for wf_id in &group.workflow_ids {
                if !table.workflows.contains_key(wf_id) {
                    return Err(OperationError::NoSuchWorkflow(wf_id.clone()));
                }
            }
            table.groups.insert(
                group.group_id.clone(),
                NetworkGroup {
                    id: group.group_id.clone(),
                    workflow_ids: group.workflow_ids.iter().cloned().collect(),
                },
            );
        }
        table.append_bootstrap_workflows()?;
        Ok(table)
    }
}
