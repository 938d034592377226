//! The base-DN registry. Maps every registered base DN to its owning backend
//! and maintains the derived view of the DIT: which base DNs are naming
//! contexts (no registered proper ancestor), which are subordinate to another
//! backend's base DN, and which backends are therefore subordinate backends
//! of which.
//!
//! This is a plain value. The live instance sits inside a `CowCell` on the
//! server context; mutation happens on a copy which is then committed
//! atomically, and `copy()` is also how the lifecycle manager dry-runs a
//! pending configuration change without touching live state. The registry
//! performs no I/O and never logs - warnings are returned to the caller to
//! log or surface.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use arbored_proto::OperationError;

use crate::dn::Dn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredBaseDn {
    pub backend_id: String,
    pub private: bool,
}

/// Non-fatal observations about a register/deregister. Callers decide whether
/// to log these or surface them to an administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryWarning {
    /// An existing naming context now sits below a newly registered ancestor.
    NamingContextDemoted { dn: Dn, superior: Dn },
    /// The newly registered base DN is not a naming context; it nests under
    /// an existing base DN.
    RegisteredSubordinate { dn: Dn, superior: Dn },
    /// A base DN became a naming context because its superior was removed.
    NamingContextPromoted { dn: Dn },
}

impl Display for RegistryWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RegistryWarning::NamingContextDemoted { dn, superior } => write!(
                f,
                "base DN {dn} was a naming context and is now subordinate to {superior}"
            ),
            RegistryWarning::RegisteredSubordinate { dn, superior } => {
                write!(f, "base DN {dn} is subordinate to existing base DN {superior}")
            }
            RegistryWarning::NamingContextPromoted { dn } => {
                write!(f, "base DN {dn} is now a naming context")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseDnRegistry {
    base_dns: BTreeMap<Dn, RegisteredBaseDn>,
    public_naming_contexts: BTreeSet<Dn>,
    private_naming_contexts: BTreeSet<Dn>,
    // superior backend id -> backend ids registered strictly below one of its
    // base DNs.
    subordinates: BTreeMap<String, BTreeSet<String>>,
}

impl BaseDnRegistry {
    pub fn new() -> Self {
        BaseDnRegistry::default()
    }

    /// A copy suitable for dry-run validation of a pending change set. The
    /// registry holds backend IDs, never backend handles, so a copy shares no
    /// mutable state with the live instance.
    pub fn copy(&self) -> BaseDnRegistry {
        self.clone()
    }

    /// Register `dn` as a base DN of `backend_id`. Fails without mutating any
    /// state if the DN is already registered - to any backend. On success the
    /// naming-context sets and subordinate relationships are recomputed, and
    /// the non-fatal consequences are returned as warnings.
    pub fn register_base_dn(
        &mut self,
        dn: Dn,
        backend_id: &str,
        private: bool,
    ) -> Result<Vec<RegistryWarning>, OperationError> {
        if let Some(existing) = self.base_dns.get(&dn) {
            return Err(OperationError::DuplicateBaseDn {
                dn: dn.to_string(),
                backend_id: existing.backend_id.clone(),
            });
        }

        let mut warnings = Vec::new();
        for nc in self
            .public_naming_contexts
            .iter()
            .chain(self.private_naming_contexts.iter())
        {
            if dn.is_ancestor_of(nc) {
                warnings.push(RegistryWarning::NamingContextDemoted {
                    dn: nc.clone(),
                    superior: dn.clone(),
                });
            }
        }
        if let Some((superior, _)) = self.nearest_ancestor(&dn) {
            warnings.push(RegistryWarning::RegisteredSubordinate {
                dn: dn.clone(),
                superior: superior.clone(),
            });
        }

        self.base_dns.insert(
            dn,
            RegisteredBaseDn {
                backend_id: backend_id.to_string(),
                private,
            },
        );
        self.recompute();
        Ok(warnings)
    }

    /// Remove `dn`. Fails without mutating any state if the DN is unknown.
    /// Base DNs whose nearest registered ancestor was `dn` are promoted to
    /// naming contexts, reported as warnings.
    pub fn deregister_base_dn(
        &mut self,
        dn: &Dn,
    ) -> Result<Vec<RegistryWarning>, OperationError> {
        if !self.base_dns.contains_key(dn) {
            return Err(OperationError::NoSuchBaseDn(dn.to_string()));
        }

        let before: BTreeSet<Dn> = self
            .public_naming_contexts
            .iter()
            .chain(self.private_naming_contexts.iter())
            .cloned()
            .collect();

        self.base_dns.remove(dn);
        self.recompute();

        let warnings = self
            .public_naming_contexts
            .iter()
            .chain(self.private_naming_contexts.iter())
            .filter(|nc| !before.contains(*nc))
            .map(|nc| RegistryWarning::NamingContextPromoted { dn: nc.clone() })
            .collect();
        Ok(warnings)
    }

    pub fn contains(&self, dn: &Dn) -> bool {
        self.base_dns.contains_key(dn)
    }

    pub fn registration(&self, dn: &Dn) -> Option<&RegisteredBaseDn> {
        self.base_dns.get(dn)
    }

    pub fn is_naming_context(&self, dn: &Dn) -> bool {
        self.public_naming_contexts.contains(dn) || self.private_naming_contexts.contains(dn)
    }

    pub fn public_naming_contexts(&self) -> &BTreeSet<Dn> {
        &self.public_naming_contexts
    }

    pub fn private_naming_contexts(&self) -> &BTreeSet<Dn> {
        &self.private_naming_contexts
    }

    /// The backend authoritative for `target`: the registered base DN that is
    /// the longest suffix of it, if any.
    pub fn backend_id_for_dn(&self, target: &Dn) -> Option<(&Dn, &str)> {
        self.base_dns
            .iter()
            .filter(|(dn, _)| *dn == target || dn.is_ancestor_of(target))
            .max_by_key(|(dn, _)| dn.rdn_count())
            .map(|(dn, reg)| (dn, reg.backend_id.as_str()))
    }

    pub fn subordinate_backends(&self, backend_id: &str) -> BTreeSet<String> {
        self.subordinates
            .get(backend_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn base_dns_for_backend(&self, backend_id: &str) -> Vec<Dn> {
        self.base_dns
            .iter()
            .filter(|(_, reg)| reg.backend_id == backend_id)
            .map(|(dn, _)| dn.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Dn, &RegisteredBaseDn)> {
        self.base_dns.iter()
    }

    pub fn len(&self) -> usize {
        self.base_dns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base_dns.is_empty()
    }

    fn nearest_ancestor(&self, dn: &Dn) -> Option<(&Dn, &RegisteredBaseDn)> {
        self.base_dns
            .iter()
            .filter(|(candidate, _)| candidate.is_ancestor_of(dn))
            .max_by_key(|(candidate, _)| candidate.rdn_count())
    }

    // Rebuild the derived view from the base DN map. A rescan is fine here:
    // the registry is bounded by the number of configured suffixes, not by
    // entry count.
    fn recompute(&mut self) {
        let mut public = BTreeSet::new();
        let mut private = BTreeSet::new();
        let mut subordinates: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (dn, reg) in &self.base_dns {
            match self.nearest_ancestor(dn) {
                None => {
                    if reg.private {
                        private.insert(dn.clone());
                    } else {
                        public.insert(dn.clone());
                    }
                }
                Some((_, superior)) => {
                    if superior.backend_id != reg.backend_id {
                        subordinates
                            .entry(superior.backend_id.clone())
                            .or_default()
                            .insert(reg.backend_id.clone());
                    }
                }
            }
        }

        self.public_naming_contexts = public;
        self.private_naming_contexts = private;
        self.subordinates = subordinates;
    }
}
