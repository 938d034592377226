//! Distinguished name handling. A [`Dn`] is a normalised sequence of RDN
//! strings, most specific first, so `ou=people,dc=example,dc=com` holds three
//! components. The registries only need equality, ordering and suffix
//! containment - full RFC 4514 escaping belongs to the wire layer and is out
//! of scope here.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use arbored_proto::OperationError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Dn {
    rdns: Vec<String>,
}

impl Dn {
    /// The root DSE. Note that the empty DN is never treated as a suffix of
    /// other DNs - the root DSE is served by a dedicated bootstrap workflow,
    /// not by suffix routing.
    pub fn root_dse() -> Self {
        Dn { rdns: Vec::new() }
    }

    pub fn is_root_dse(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn rdn_count(&self) -> usize {
        self.rdns.len()
    }

    /// True if self is a *proper* ancestor of other, i.e. other sits strictly
    /// below self in the DIT. A DN is never its own ancestor.
    pub fn is_ancestor_of(&self, other: &Dn) -> bool {
        if self.rdns.is_empty() || self.rdns.len() >= other.rdns.len() {
            return false;
        }
        let skip = other.rdns.len() - self.rdns.len();
        other.rdns[skip..] == self.rdns[..]
    }

    /// The immediate superior DN. None for the root DSE and for single-RDN
    /// DNs, whose superior is the root DSE.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.len() < 2 {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[1..].to_vec(),
        })
    }
}

impl FromStr for Dn {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Dn::root_dse());
        }
        let rdns = trimmed
            .split(',')
            .map(|rdn| {
                let rdn = rdn.trim();
                if rdn.is_empty() {
                    return Err(OperationError::InvalidDnSyntax(s.to_string()));
                }
                let (atype, avalue) = rdn
                    .split_once('=')
                    .ok_or_else(|| OperationError::InvalidDnSyntax(s.to_string()))?;
                let atype = atype.trim();
                let avalue = avalue.trim();
                if atype.is_empty() || avalue.is_empty() {
                    return Err(OperationError::InvalidDnSyntax(s.to_string()));
                }
                Ok(format!(
                    "{}={}",
                    atype.to_lowercase(),
                    avalue.to_lowercase()
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Dn { rdns })
    }
}

impl Display for Dn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rdns.join(","))
    }
}
