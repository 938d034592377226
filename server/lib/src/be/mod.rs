//! The backend capability boundary. A backend is a pluggable unit that is
//! authoritative for one or more base DNs. How it stores entries is its own
//! business - the core only drives its lifecycle and routes requests to it.

use std::sync::Arc;

use arbored_proto::OperationError;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::BackendEntryConfig;
use crate::dn::Dn;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WritabilityMode {
    #[default]
    Enabled,
    Disabled,
    /// Writes from internal operations only, external writes refused.
    InternalOnly,
}

/// The capability set every backend implementation provides. Lifecycle is
/// `configure` then `initialize`, then registration; `finalize` is the
/// inverse. Implementations are shared behind `Arc` and use interior
/// mutability where they carry state.
pub trait Backend: Send + Sync {
    fn backend_id(&self) -> String;

    /// The base DNs this backend is authoritative for. Valid after
    /// `configure`.
    fn base_dns(&self) -> Vec<Dn>;

    fn configure(&self, cfg: &BackendEntryConfig) -> Result<(), OperationError>;

    fn initialize(&self) -> Result<(), OperationError>;

    fn finalize(&self);

    fn set_writability(&self, mode: WritabilityMode);

    fn writability(&self) -> WritabilityMode;

    /// Configuration-handler backends bootstrap before the lifecycle manager
    /// runs and must never be re-activated by it.
    fn is_config_backend(&self) -> bool {
        false
    }
}

pub type BackendFactory =
    Box<dyn Fn(&BackendEntryConfig) -> Result<Arc<dyn Backend>, OperationError> + Send + Sync>;

/// Maps the implementation-class name a configuration entry carries to a
/// factory for that backend type. This is the registry the lifecycle manager
/// instantiates through, and what the acceptance phase validates class names
/// against.
#[derive(Default)]
pub struct BackendFactoryRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendFactoryRegistry {
    pub fn new() -> Self {
        BackendFactoryRegistry::default()
    }

    pub fn register_factory(&mut self, class: &str, factory: BackendFactory) {
        self.factories.insert(class.to_string(), factory);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn instantiate(
        &self,
        cfg: &BackendEntryConfig,
    ) -> Result<Arc<dyn Backend>, OperationError> {
        let factory = self.factories.get(cfg.implementation_class.as_str()).ok_or(
            OperationError::InstantiationError {
                backend_id: cfg.backend_id.clone(),
                cause: format!(
                    "unknown backend implementation class {}",
                    cfg.implementation_class
                ),
            },
        )?;
        factory(cfg).map_err(|e| OperationError::InstantiationError {
            backend_id: cfg.backend_id.clone(),
            cause: e.to_string(),
        })
    }
}
