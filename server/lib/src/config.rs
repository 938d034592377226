//! Structured configuration records. The configuration source collaborator
//! delivers these as plain values - the core depends only on the fields it
//! reads, never on the configuration framework's own type hierarchy.

use serde::{Deserialize, Serialize};

use crate::be::WritabilityMode;

/// One configured backend entry. `config_dn` is the DN of the configuration
/// entry itself, which is distinct from the backend ID and is the key the
/// lifecycle manager uses to correlate later change and delete events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackendEntryConfig {
    pub config_dn: String,
    pub backend_id: String,
    pub implementation_class: String,
    pub enabled: bool,
    pub base_dns: Vec<String>,
    pub writability: WritabilityMode,
    /// Private base DNs are served but not advertised as public naming
    /// contexts (config, monitoring, schema and the like).
    pub private: bool,
}

/// A manually declared workflow definition, only meaningful in manual routing
/// mode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub workflow_id: String,
    pub base_dn: String,
    pub backend_id: String,
}

/// A manually declared network group and the workflows attached to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkGroupConfig {
    pub group_id: String,
    pub workflow_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::BackendEntryConfig;
    use crate::be::WritabilityMode;

    #[test]
    fn test_backend_entry_config_serde() {
        let cfg = BackendEntryConfig {
            config_dn: "ds-cfg-backend-id=userRoot,cn=backends,cn=config".to_string(),
            backend_id: "userRoot".to_string(),
            implementation_class: "memory".to_string(),
            enabled: true,
            base_dns: vec!["dc=example,dc=com".to_string()],
            writability: WritabilityMode::Enabled,
            private: false,
        };
        let s = serde_json::to_string(&cfg).expect("serialise");
        let cfg2: BackendEntryConfig = serde_json::from_str(&s).expect("deserialise");
        assert_eq!(cfg, cfg2);
    }
}
