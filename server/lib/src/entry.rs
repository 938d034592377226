//! A minimal in-memory entry model. The core reads operational attributes from
//! entry snapshots handed to it by the entry store, and hands back
//! modification lists. How entries are stored, indexed and replicated is the
//! storage engine's business, not ours.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use arbored_proto::OperationError;
use serde::{Deserialize, Serialize};

use crate::utils::gtime_parse;

/// The attribute types the core reads and writes. Operational attributes for
/// password policy state come in two generations: the standard `pwd*` types
/// and the legacy `ds-pwp-*` types some older deployments still carry, so
/// several facts have a legacy fallback attribute.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    AccountDisabled,
    AccountExpirationTime,
    GraceLoginUseTime,
    GraceLoginUseTimeLegacy,
    LastLoginTime,
    PasswordChangedByRequiredTime,
    PasswordChangedTime,
    PasswordExpirationWarnedTime,
    PasswordExpirationWarnedTimeLegacy,
    PasswordFailureLockedTime,
    PasswordFailureLockedTimeLegacy,
    PasswordFailureTime,
    PasswordFailureTimeLegacy,
    PasswordPolicySubentry,
    PasswordReset,
    PasswordResetLegacy,
    UserPassword,
}

impl Attribute {
    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::AccountDisabled => "ds-pwp-account-disabled",
            Attribute::AccountExpirationTime => "ds-pwp-account-expiration-time",
            Attribute::GraceLoginUseTime => "pwdgraceusetime",
            Attribute::GraceLoginUseTimeLegacy => "ds-pwp-grace-login-use-time",
            Attribute::LastLoginTime => "ds-pwp-last-login-time",
            Attribute::PasswordChangedByRequiredTime => "ds-pwp-password-changed-by-required-time",
            Attribute::PasswordChangedTime => "pwdchangedtime",
            Attribute::PasswordExpirationWarnedTime => "pwdexpirationwarned",
            Attribute::PasswordExpirationWarnedTimeLegacy => "ds-pwp-warned-time",
            Attribute::PasswordFailureLockedTime => "pwdaccountlockedtime",
            Attribute::PasswordFailureLockedTimeLegacy => "ds-pwp-account-locked-time",
            Attribute::PasswordFailureTime => "pwdfailuretime",
            Attribute::PasswordFailureTimeLegacy => "ds-pwp-auth-failure-time",
            Attribute::PasswordPolicySubentry => "pwdpolicysubentry",
            Attribute::PasswordReset => "pwdreset",
            Attribute::PasswordResetLegacy => "ds-pwp-reset-required",
            Attribute::UserPassword => "userpassword",
        }
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry snapshot. Values are kept in insertion order per attribute, which
/// matters for the timestamp lists the policy state machine maintains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    avas: BTreeMap<Attribute, Vec<String>>,
}

impl Entry {
    pub fn new() -> Self {
        Entry::default()
    }

    pub fn get_ava(&self, attr: Attribute) -> Option<&[String]> {
        self.avas.get(&attr).map(|vs| vs.as_slice())
    }

    pub fn get_ava_single(&self, attr: Attribute) -> Option<&str> {
        self.avas
            .get(&attr)
            .and_then(|vs| vs.first())
            .map(|v| v.as_str())
    }

    /// LDAP boolean: TRUE/FALSE, case insensitive. A malformed value is an
    /// error, not a default - the callers decide their own fail-safe.
    pub fn get_ava_single_bool(&self, attr: Attribute) -> Result<Option<bool>, OperationError> {
        match self.get_ava_single(attr) {
            None => Ok(None),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(OperationError::InvalidAttributeValue {
                    attr: attr.to_string(),
                    cause: format!("expected boolean, got {raw}"),
                }),
            },
        }
    }

    pub fn get_ava_single_gtime(&self, attr: Attribute) -> Result<Option<Duration>, OperationError> {
        match self.get_ava_single(attr) {
            None => Ok(None),
            Some(raw) => gtime_parse(attr.as_str(), raw).map(Some),
        }
    }

    pub fn attribute_pres(&self, attr: Attribute) -> bool {
        self.avas.contains_key(&attr)
    }

    pub fn set_ava(&mut self, attr: Attribute, values: Vec<String>) {
        if values.is_empty() {
            self.avas.remove(&attr);
        } else {
            self.avas.insert(attr, values);
        }
    }

    pub fn add_ava(&mut self, attr: Attribute, value: String) {
        self.avas.entry(attr).or_default().push(value);
    }

    pub fn remove_ava_value(&mut self, attr: Attribute, value: &str) {
        if let Some(vs) = self.avas.get_mut(&attr) {
            vs.retain(|v| v != value);
            if vs.is_empty() {
                self.avas.remove(&attr);
            }
        }
    }

    pub fn purge_ava(&mut self, attr: Attribute) {
        self.avas.remove(&attr);
    }
}

#[cfg(test)]
mod tests {
    use super::{Attribute, Entry};

    #[test]
    fn test_entry_bool_decode() {
        let mut e = Entry::new();
        assert_eq!(e.get_ava_single_bool(Attribute::AccountDisabled), Ok(None));

        e.set_ava(Attribute::AccountDisabled, vec!["TRUE".to_string()]);
        assert_eq!(
            e.get_ava_single_bool(Attribute::AccountDisabled),
            Ok(Some(true))
        );

        e.set_ava(Attribute::AccountDisabled, vec!["maybe".to_string()]);
        assert!(e.get_ava_single_bool(Attribute::AccountDisabled).is_err());
    }

    #[test]
    fn test_entry_value_ordering_preserved() {
        let mut e = Entry::new();
        e.add_ava(Attribute::PasswordFailureTime, "20240101000000Z".to_string());
        e.add_ava(Attribute::PasswordFailureTime, "20240101000001Z".to_string());
        e.add_ava(Attribute::PasswordFailureTime, "20240101000002Z".to_string());
        let vs = e.get_ava(Attribute::PasswordFailureTime).expect("missing");
        assert_eq!(vs.len(), 3);
        assert_eq!(vs[0], "20240101000000Z");
        assert_eq!(vs[2], "20240101000002Z");
    }

    #[test]
    fn test_entry_remove_last_value_drops_attribute() {
        let mut e = Entry::new();
        e.add_ava(Attribute::UserPassword, "secret".to_string());
        e.remove_ava_value(Attribute::UserPassword, "secret");
        assert!(!e.attribute_pres(Attribute::UserPassword));
    }
}
