//! Password policy configuration and resolution. A policy is a plain value
//! record; resolution picks the policy subentry named on the user entry, or
//! the server-wide default, exactly once per operation.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::dn::Dn;
use crate::entry::{Attribute, Entry};

/// All durations and intervals are in seconds; zero disables the respective
/// mechanism.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PasswordPolicy {
    /// Failed binds before lockout. Zero disables failure lockout entirely.
    pub max_failure_count: u32,
    /// How long a failure lockout lasts. Zero means until administrative
    /// clear.
    pub lockout_duration: u64,
    /// Failures older than this no longer count toward the threshold. Zero
    /// means failures never age out.
    pub lockout_failure_expiration_interval: u64,
    pub idle_lockout_interval: u64,
    pub max_password_age: u64,
    /// Maximum age of a password after an administrative reset, while the
    /// reset flag is pending.
    pub max_password_reset_age: u64,
    /// Absolute "must change by" timestamp, generalized time.
    pub require_change_by_time: Option<String>,
    pub warning_interval: u64,
    pub expire_without_warning: bool,
    pub grace_login_count: u32,
    pub allow_user_password_changes: bool,
    pub force_change_on_add: bool,
    pub force_change_on_reset: bool,
    pub default_scheme: String,
    pub deprecated_schemes: BTreeSet<String>,
    /// Direct-update mode: state changes are applied to the in-memory entry
    /// instead of being queued as modifications.
    pub state_update_direct: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        PasswordPolicy {
            max_failure_count: 0,
            lockout_duration: 0,
            lockout_failure_expiration_interval: 0,
            idle_lockout_interval: 0,
            max_password_age: 0,
            max_password_reset_age: 0,
            require_change_by_time: None,
            warning_interval: 0,
            expire_without_warning: false,
            grace_login_count: 0,
            allow_user_password_changes: true,
            force_change_on_add: false,
            force_change_on_reset: false,
            default_scheme: "SSHA512".to_string(),
            deprecated_schemes: BTreeSet::new(),
            state_update_direct: false,
        }
    }
}

/// The policies known to the server: one default plus any number of policy
/// subentries keyed by DN.
pub struct PolicyStore {
    default_policy: Arc<PasswordPolicy>,
    subentries: HashMap<Dn, Arc<PasswordPolicy>>,
}

impl PolicyStore {
    pub fn new(default_policy: PasswordPolicy) -> Self {
        PolicyStore {
            default_policy: Arc::new(default_policy),
            subentries: HashMap::new(),
        }
    }

    pub fn register_subentry(&mut self, dn: Dn, policy: PasswordPolicy) {
        self.subentries.insert(dn, Arc::new(policy));
    }

    pub fn default_policy(&self) -> Arc<PasswordPolicy> {
        self.default_policy.clone()
    }

    /// Resolve the policy governing `entry`. A malformed or unknown subentry
    /// reference falls back to the default - logged, since it usually means
    /// a policy was deleted while entries still point at it.
    pub fn resolve(&self, entry: &Entry) -> Arc<PasswordPolicy> {
        let Some(raw) = entry.get_ava_single(Attribute::PasswordPolicySubentry) else {
            return self.default_policy.clone();
        };
        match Dn::from_str(raw) {
            Ok(dn) => match self.subentries.get(&dn) {
                Some(policy) => policy.clone(),
                None => {
                    security_error!(subentry = %dn, "Unknown password policy subentry, using default policy");
                    self.default_policy.clone()
                }
            },
            Err(_) => {
                security_error!(subentry = raw, "Malformed password policy subentry reference, using default policy");
                self.default_policy.clone()
            }
        }
    }
}
