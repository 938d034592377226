//! The password policy state machine. One of these is built per operation
//! from the governing [`PasswordPolicy`](crate::idm::policy::PasswordPolicy),
//! a snapshot of the user entry, and the operation clock. Every predicate is
//! memoised as a [`Condition`] so repeated queries within the operation are
//! free, and every state change is expressed as a [`Modify`] - queued on a
//! [`ModifyList`] for the caller's update path, or applied directly to the
//! in-memory entry when the policy runs in direct-update mode.
//!
//! Decode failures on operational state attributes never abort the operation.
//! They resolve in the restrictive direction for the predicate at hand (a
//! mangled disabled flag disables, a mangled lockout time locks) and are
//! logged as security events.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use arbored_proto::OperationError;

use crate::condition::Condition;
use crate::credential::{split_tagged_value, tag_value, StorageSchemeRegistry};
use crate::entry::{Attribute, Entry};
use crate::idm::policy::PasswordPolicy;
use crate::modify::{Modify, ModifyList};
use crate::utils::{gtime_format, gtime_parse};

pub struct PasswordPolicyState {
    policy: Arc<PasswordPolicy>,
    schemes: Arc<StorageSchemeRegistry>,
    entry: Entry,
    now: Duration,
    mods: ModifyList,

    c_disabled: Condition,
    c_account_expired: Condition,
    c_failure_locked: Condition,
    c_idle_locked: Condition,
    c_must_change: Condition,
    c_expired: Condition,
    c_should_warn: Condition,
    c_first_warning: Condition,

    f_changed_time: Option<Duration>,
    f_warned_time: Option<Option<Duration>>,
    f_failure_times: Option<Vec<Duration>>,
    f_failure_attr: Attribute,
    f_grace_times: Option<Vec<Duration>>,
    f_grace_attr: Attribute,
    f_expiration_time: Option<Option<Duration>>,
    f_seconds_until_unlock: Option<u64>,
}

impl PasswordPolicyState {
    pub fn new(
        policy: Arc<PasswordPolicy>,
        schemes: Arc<StorageSchemeRegistry>,
        entry: Entry,
        now: Duration,
    ) -> Self {
        PasswordPolicyState {
            policy,
            schemes,
            entry,
            now,
            mods: ModifyList::new(),
            c_disabled: Condition::Unknown,
            c_account_expired: Condition::Unknown,
            c_failure_locked: Condition::Unknown,
            c_idle_locked: Condition::Unknown,
            c_must_change: Condition::Unknown,
            c_expired: Condition::Unknown,
            c_should_warn: Condition::Unknown,
            c_first_warning: Condition::Unknown,
            f_changed_time: None,
            f_warned_time: None,
            f_failure_times: None,
            f_failure_attr: Attribute::PasswordFailureTime,
            f_grace_times: None,
            f_grace_attr: Attribute::GraceLoginUseTime,
            f_expiration_time: None,
            f_seconds_until_unlock: None,
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// The changes accumulated so far. Empty in direct-update mode, where
    /// changes go straight to the entry snapshot instead.
    pub fn modifications(&self) -> &ModifyList {
        &self.mods
    }

    pub fn take_modifications(&mut self) -> ModifyList {
        mem::take(&mut self.mods)
    }

    // --- change plumbing ----------------------------------------------------

    fn queue(&mut self, m: Modify) {
        if self.policy.state_update_direct {
            match m {
                Modify::Present(attr, v) => self.entry.add_ava(attr, v),
                Modify::Removed(attr, v) => self.entry.remove_ava_value(attr, &v),
                Modify::Purged(attr) => self.entry.purge_ava(attr),
            }
        } else {
            self.mods.push_mod(m);
        }
    }

    /// Purge both generations of a state attribute, where present.
    fn purge_pair(&mut self, primary: Attribute, legacy: Attribute) {
        if self.entry.attribute_pres(primary) {
            self.queue(Modify::Purged(primary));
        }
        if self.entry.attribute_pres(legacy) {
            self.queue(Modify::Purged(legacy));
        }
    }

    /// Read a single-valued time fact, preferring the standard attribute over
    /// its legacy generation.
    fn read_time_pair(
        &self,
        primary: Attribute,
        legacy: Attribute,
    ) -> Result<Option<Duration>, OperationError> {
        if let Some(t) = self.entry.get_ava_single_gtime(primary)? {
            return Ok(Some(t));
        }
        self.entry.get_ava_single_gtime(legacy)
    }

    /// Read a multi-valued timestamp list. Returns the attribute generation it
    /// came from, the live timestamps, and the raw values that should be
    /// removed (aged out past `expire_after`, or unparseable).
    fn read_stamp_list(
        &self,
        primary: Attribute,
        legacy: Attribute,
        expire_after: u64,
    ) -> (Attribute, Vec<Duration>, Vec<String>) {
        let attr = if !self.entry.attribute_pres(primary) && self.entry.attribute_pres(legacy) {
            legacy
        } else {
            primary
        };
        let mut times = Vec::new();
        let mut stale = Vec::new();
        if let Some(raws) = self.entry.get_ava(attr) {
            for raw in raws {
                match gtime_parse(attr.as_str(), raw) {
                    Ok(t) => {
                        if expire_after > 0 && t + Duration::from_secs(expire_after) <= self.now {
                            stale.push(raw.clone());
                        } else {
                            times.push(t);
                        }
                    }
                    Err(err) => {
                        security_error!(
                            attr = %attr,
                            value = raw.as_str(),
                            ?err,
                            "Discarding unparseable timestamp value"
                        );
                        stale.push(raw.clone());
                    }
                }
            }
        }
        (attr, times, stale)
    }

    /// The next timestamp to append to a multi-valued list. Values must be
    /// strictly increasing so that no two list entries collide even when the
    /// clock stalls or steps backwards between operations.
    fn next_stamp(&self, existing: &[Duration]) -> Duration {
        match existing.iter().max() {
            Some(max) if *max >= self.now => *max + Duration::from_secs(1),
            _ => self.now,
        }
    }

    // --- account state ------------------------------------------------------

    pub fn is_account_disabled(&mut self) -> bool {
        if let Some(b) = self.c_disabled.as_bool() {
            return b;
        }
        let disabled = match self.entry.get_ava_single_bool(Attribute::AccountDisabled) {
            Ok(v) => v.unwrap_or(false),
            Err(err) => {
                security_error!(?err, "Unparseable account disabled flag, treating the account as disabled");
                true
            }
        };
        self.c_disabled = Condition::from_bool(disabled);
        disabled
    }

    pub fn is_account_expired(&mut self) -> bool {
        if let Some(b) = self.c_account_expired.as_bool() {
            return b;
        }
        let expired = match self
            .entry
            .get_ava_single_gtime(Attribute::AccountExpirationTime)
        {
            Ok(None) => false,
            Ok(Some(t)) => t <= self.now,
            Err(err) => {
                security_error!(?err, "Unparseable account expiration time, treating the account as expired");
                true
            }
        };
        self.c_account_expired = Condition::from_bool(expired);
        expired
    }

    /// When the password was last changed. An account with no recorded change
    /// time is treated as having held its password since the epoch, which is
    /// the restrictive reading for every age-based predicate.
    pub fn changed_time(&mut self) -> Duration {
        if let Some(t) = self.f_changed_time {
            return t;
        }
        let t = match self.entry.get_ava_single_gtime(Attribute::PasswordChangedTime) {
            Ok(Some(t)) => t,
            Ok(None) => Duration::ZERO,
            Err(err) => {
                security_error!(?err, "Unparseable password changed time, treating the password as never changed");
                Duration::ZERO
            }
        };
        self.f_changed_time = Some(t);
        t
    }

    pub fn update_password_changed_time(&mut self) {
        if self.entry.attribute_pres(Attribute::PasswordChangedTime) {
            self.queue(Modify::Purged(Attribute::PasswordChangedTime));
        }
        self.queue(Modify::Present(
            Attribute::PasswordChangedTime,
            gtime_format(self.now),
        ));
        self.f_changed_time = Some(self.now);
        self.invalidate_expiration();
        self.c_idle_locked.reset();
    }

    pub fn set_password_reset(&mut self, reset: bool) {
        self.purge_pair(Attribute::PasswordReset, Attribute::PasswordResetLegacy);
        if reset {
            self.queue(Modify::Present(Attribute::PasswordReset, "TRUE".to_string()));
        }
        self.c_must_change.reset();
        self.invalidate_expiration();
    }

    pub fn update_last_login_time(&mut self) {
        if self.entry.attribute_pres(Attribute::LastLoginTime) {
            self.queue(Modify::Purged(Attribute::LastLoginTime));
        }
        self.queue(Modify::Present(
            Attribute::LastLoginTime,
            gtime_format(self.now),
        ));
        self.c_idle_locked.reset();
    }

    // --- failure lockout ----------------------------------------------------

    /// The recorded authentication failure times, pruned of values that have
    /// aged past the policy's failure expiration interval.
    pub fn auth_failure_times(&mut self) -> Vec<Duration> {
        if let Some(ts) = &self.f_failure_times {
            return ts.clone();
        }
        let (attr, times, stale) = self.read_stamp_list(
            Attribute::PasswordFailureTime,
            Attribute::PasswordFailureTimeLegacy,
            self.policy.lockout_failure_expiration_interval,
        );
        for raw in stale {
            self.queue(Modify::Removed(attr, raw));
        }
        self.f_failure_attr = attr;
        self.f_failure_times = Some(times.clone());
        times
    }

    pub fn update_auth_failure_times(&mut self) {
        let mut times = self.auth_failure_times();
        let stamp = self.next_stamp(&times);
        let attr = self.f_failure_attr;
        self.queue(Modify::Present(attr, gtime_format(stamp)));
        times.push(stamp);
        self.f_failure_times = Some(times);
        self.c_failure_locked.reset();
    }

    pub fn clear_auth_failure_times(&mut self) {
        self.purge_pair(
            Attribute::PasswordFailureTime,
            Attribute::PasswordFailureTimeLegacy,
        );
        self.f_failure_times = Some(Vec::new());
        self.c_failure_locked.reset();
    }

    /// Whether the account is currently locked by authentication failures.
    /// This self-heals in both directions: a failure count at the threshold
    /// with no recorded lockout time writes one, and a timed lockout whose
    /// duration has elapsed clears itself and the failure history.
    pub fn locked_due_to_failures(&mut self) -> bool {
        if let Some(b) = self.c_failure_locked.as_bool() {
            return b;
        }
        let locked = self.compute_failure_lock();
        self.c_failure_locked = Condition::from_bool(locked);
        locked
    }

    fn compute_failure_lock(&mut self) -> bool {
        if self.policy.max_failure_count == 0 {
            return false;
        }
        let lock_time = match self.read_time_pair(
            Attribute::PasswordFailureLockedTime,
            Attribute::PasswordFailureLockedTimeLegacy,
        ) {
            Ok(t) => t,
            Err(err) => {
                security_error!(?err, "Unparseable failure lockout time, treating the account as locked");
                return true;
            }
        };
        match lock_time {
            Some(locked_at) => {
                if self.policy.lockout_duration == 0 {
                    // Locked until an administrator clears it.
                    self.f_seconds_until_unlock = None;
                    return true;
                }
                let unlock_at = locked_at + Duration::from_secs(self.policy.lockout_duration);
                if self.now >= unlock_at {
                    self.purge_pair(
                        Attribute::PasswordFailureLockedTime,
                        Attribute::PasswordFailureLockedTimeLegacy,
                    );
                    self.purge_pair(
                        Attribute::PasswordFailureTime,
                        Attribute::PasswordFailureTimeLegacy,
                    );
                    self.f_failure_times = Some(Vec::new());
                    self.f_seconds_until_unlock = None;
                    false
                } else {
                    self.f_seconds_until_unlock = Some((unlock_at - self.now).as_secs());
                    true
                }
            }
            None => {
                let count = self.auth_failure_times().len();
                if count >= self.policy.max_failure_count as usize {
                    security_critical!(
                        failures = count,
                        "Account is at the failure threshold without a recorded lockout time, locking now"
                    );
                    self.queue(Modify::Present(
                        Attribute::PasswordFailureLockedTime,
                        gtime_format(self.now),
                    ));
                    if self.policy.lockout_duration > 0 {
                        self.f_seconds_until_unlock = Some(self.policy.lockout_duration);
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Remaining lockout seconds, None when not locked or when the lockout
    /// does not expire on its own.
    pub fn seconds_until_unlock(&mut self) -> Option<u64> {
        if self.locked_due_to_failures() {
            self.f_seconds_until_unlock
        } else {
            None
        }
    }

    pub fn lock_due_to_failures(&mut self) {
        self.purge_pair(
            Attribute::PasswordFailureLockedTime,
            Attribute::PasswordFailureLockedTimeLegacy,
        );
        self.queue(Modify::Present(
            Attribute::PasswordFailureLockedTime,
            gtime_format(self.now),
        ));
        self.f_seconds_until_unlock =
            (self.policy.lockout_duration > 0).then_some(self.policy.lockout_duration);
        self.c_failure_locked = Condition::True;
    }

    /// Administrative unlock: clears the lockout time and the failure history.
    pub fn clear_failure_lockout(&mut self) {
        self.purge_pair(
            Attribute::PasswordFailureLockedTime,
            Attribute::PasswordFailureLockedTimeLegacy,
        );
        self.purge_pair(
            Attribute::PasswordFailureTime,
            Attribute::PasswordFailureTimeLegacy,
        );
        self.f_failure_times = Some(Vec::new());
        self.f_seconds_until_unlock = None;
        // The purges are queued changes in non-direct mode and a recompute
        // would re-read the stale lock attribute from the entry snapshot. The
        // outcome after a clear is deterministic, cache it as such.
        self.c_failure_locked = Condition::False;
    }

    // --- idle lockout -------------------------------------------------------

    pub fn locked_due_to_idle_interval(&mut self) -> bool {
        if let Some(b) = self.c_idle_locked.as_bool() {
            return b;
        }
        let locked = self.compute_idle_lock();
        self.c_idle_locked = Condition::from_bool(locked);
        locked
    }

    fn compute_idle_lock(&mut self) -> bool {
        if self.policy.idle_lockout_interval == 0 {
            return false;
        }
        let last_login = match self.entry.get_ava_single_gtime(Attribute::LastLoginTime) {
            Ok(t) => t,
            Err(err) => {
                security_error!(?err, "Unparseable last login time, treating the account as never logged in");
                None
            }
        };
        let most_recent = last_login.unwrap_or(Duration::ZERO).max(self.changed_time());
        most_recent + Duration::from_secs(self.policy.idle_lockout_interval) <= self.now
    }

    // --- forced change ------------------------------------------------------

    fn read_reset_flag(&self) -> bool {
        let primary = self.entry.get_ava_single_bool(Attribute::PasswordReset);
        match primary {
            Ok(Some(b)) => b,
            Ok(None) => match self.entry.get_ava_single_bool(Attribute::PasswordResetLegacy) {
                Ok(Some(b)) => b,
                Ok(None) => false,
                Err(err) => {
                    security_error!(?err, "Unparseable password reset flag, requiring a change");
                    true
                }
            },
            Err(err) => {
                security_error!(?err, "Unparseable password reset flag, requiring a change");
                true
            }
        }
    }

    /// Whether the user must change their password before doing anything
    /// else. Short-circuits before touching the entry: if the policy forbids
    /// user password changes, or neither forced-change trigger is enabled,
    /// the reset flag on the entry is irrelevant and is not decoded.
    pub fn must_change_password(&mut self) -> bool {
        if let Some(b) = self.c_must_change.as_bool() {
            return b;
        }
        let must = if !self.policy.allow_user_password_changes {
            false
        } else if !self.policy.force_change_on_add && !self.policy.force_change_on_reset {
            false
        } else {
            self.read_reset_flag()
        };
        self.c_must_change = Condition::from_bool(must);
        must
    }

    // --- expiration and warning ---------------------------------------------

    /// The absolute require-change-by deadline, unless the entry records that
    /// this exact deadline was already satisfied.
    fn require_change_candidate(&self) -> Option<Duration> {
        let raw = self.policy.require_change_by_time.as_deref()?;
        let required = match gtime_parse("require-change-by-time", raw) {
            Ok(t) => t,
            Err(err) => {
                admin_warn!(?err, "Ignoring malformed require-change-by-time in the password policy");
                return None;
            }
        };
        match self
            .entry
            .get_ava_single_gtime(Attribute::PasswordChangedByRequiredTime)
        {
            Ok(Some(t)) if t == required => None,
            Ok(_) => Some(required),
            Err(err) => {
                security_error!(?err, "Unparseable changed-by-required-time, keeping the deadline in force");
                Some(required)
            }
        }
    }

    /// The earliest applicable expiration time: maximum age, maximum reset
    /// age while a forced change is pending, and the require-change-by
    /// deadline. None when no expiration mechanism applies.
    pub fn expiration_time(&mut self) -> Option<Duration> {
        if let Some(cached) = self.f_expiration_time {
            return cached;
        }
        let changed = self.changed_time();
        let mut exp: Option<Duration> = None;
        if self.policy.max_password_age > 0 {
            exp = Some(changed + Duration::from_secs(self.policy.max_password_age));
        }
        if self.policy.max_password_reset_age > 0 && self.must_change_password() {
            let reset_exp = changed + Duration::from_secs(self.policy.max_password_reset_age);
            exp = Some(exp.map_or(reset_exp, |e| e.min(reset_exp)));
        }
        if let Some(required) = self.require_change_candidate() {
            exp = Some(exp.map_or(required, |e| e.min(required)));
        }
        self.f_expiration_time = Some(exp);
        exp
    }

    pub fn seconds_until_expiration(&mut self) -> Option<u64> {
        let exp = self.expiration_time()?;
        exp.checked_sub(self.now).map(|d| d.as_secs())
    }

    fn warned_time(&mut self) -> Option<Duration> {
        if let Some(w) = self.f_warned_time {
            return w;
        }
        let w = match self.read_time_pair(
            Attribute::PasswordExpirationWarnedTime,
            Attribute::PasswordExpirationWarnedTimeLegacy,
        ) {
            Ok(w) => w,
            Err(err) => {
                security_error!(?err, "Unparseable expiration warned time, treating the warning as long since issued");
                Some(Duration::ZERO)
            }
        };
        self.f_warned_time = Some(w);
        w
    }

    /// Evaluate expired / should-warn / first-warning together. The three are
    /// one decision table:
    ///
    /// - No warning interval: the expiration time is a hard cliff and no
    ///   warnings are ever issued.
    /// - Expire-without-warning: the cliff stands, but warnings are issued
    ///   during the interval leading up to it.
    /// - Otherwise the user is guaranteed a full warning interval: the
    ///   password cannot expire until `warned_time + interval` has passed, so
    ///   an account that was never warned does not expire, it warns. The
    ///   effective expiration is the later of the raw expiration and that
    ///   warned-anchored deadline.
    fn evaluate_expiration(&mut self) {
        let (expired, warn, first) = match self.expiration_time() {
            None => (false, false, false),
            Some(exp) => {
                let wi = self.policy.warning_interval;
                if wi == 0 {
                    (self.now >= exp, false, false)
                } else {
                    let warn_start = exp.saturating_sub(Duration::from_secs(wi));
                    if self.policy.expire_without_warning {
                        let expired = self.now >= exp;
                        let warn = !expired && self.now >= warn_start;
                        (expired, warn, warn && self.warned_time().is_none())
                    } else {
                        match self.warned_time() {
                            Some(w) => {
                                let effective = exp.max(w + Duration::from_secs(wi));
                                let expired = self.now >= effective;
                                (expired, !expired && self.now >= warn_start, false)
                            }
                            None => {
                                let warn = self.now >= warn_start;
                                (false, warn, warn)
                            }
                        }
                    }
                }
            }
        };
        if expired {
            security_info!("Password is expired");
        }
        self.c_expired = Condition::from_bool(expired);
        self.c_should_warn = Condition::from_bool(warn);
        self.c_first_warning = Condition::from_bool(first);
    }

    pub fn is_password_expired(&mut self) -> bool {
        if let Some(b) = self.c_expired.as_bool() {
            return b;
        }
        self.evaluate_expiration();
        matches!(self.c_expired, Condition::True)
    }

    pub fn should_warn(&mut self) -> bool {
        if let Some(b) = self.c_should_warn.as_bool() {
            return b;
        }
        self.evaluate_expiration();
        matches!(self.c_should_warn, Condition::True)
    }

    /// True only for the warning that starts the rolling window.
    pub fn is_first_warning(&mut self) -> bool {
        if let Some(b) = self.c_first_warning.as_bool() {
            return b;
        }
        self.evaluate_expiration();
        matches!(self.c_first_warning, Condition::True)
    }

    pub fn update_warned_time(&mut self) {
        self.purge_pair(
            Attribute::PasswordExpirationWarnedTime,
            Attribute::PasswordExpirationWarnedTimeLegacy,
        );
        self.queue(Modify::Present(
            Attribute::PasswordExpirationWarnedTime,
            gtime_format(self.now),
        ));
        self.f_warned_time = Some(Some(self.now));
        self.invalidate_expiration();
    }

    pub fn clear_warned_time(&mut self) {
        self.purge_pair(
            Attribute::PasswordExpirationWarnedTime,
            Attribute::PasswordExpirationWarnedTimeLegacy,
        );
        self.f_warned_time = Some(None);
        self.invalidate_expiration();
    }

    fn invalidate_expiration(&mut self) {
        self.f_expiration_time = None;
        self.c_expired.reset();
        self.c_should_warn.reset();
        self.c_first_warning.reset();
    }

    // --- grace logins -------------------------------------------------------

    pub fn grace_login_times(&mut self) -> Vec<Duration> {
        if let Some(ts) = &self.f_grace_times {
            return ts.clone();
        }
        let (attr, times, stale) = self.read_stamp_list(
            Attribute::GraceLoginUseTime,
            Attribute::GraceLoginUseTimeLegacy,
            0,
        );
        for raw in stale {
            self.queue(Modify::Removed(attr, raw));
        }
        self.f_grace_attr = attr;
        self.f_grace_times = Some(times.clone());
        times
    }

    pub fn may_use_grace_login(&mut self) -> bool {
        self.policy.grace_login_count > 0
            && (self.grace_login_times().len() as u32) < self.policy.grace_login_count
    }

    pub fn update_grace_login_times(&mut self) {
        let mut times = self.grace_login_times();
        let stamp = self.next_stamp(&times);
        let attr = self.f_grace_attr;
        security_info!(
            used = times.len() + 1,
            allowed = self.policy.grace_login_count,
            "Consuming a grace login"
        );
        self.queue(Modify::Present(attr, gtime_format(stamp)));
        times.push(stamp);
        self.f_grace_times = Some(times);
    }

    pub fn clear_grace_login_times(&mut self) {
        self.purge_pair(
            Attribute::GraceLoginUseTime,
            Attribute::GraceLoginUseTimeLegacy,
        );
        self.f_grace_times = Some(Vec::new());
    }

    // --- credentials --------------------------------------------------------

    /// Check a cleartext candidate against every stored password value.
    /// Untagged values and values under unknown schemes never match.
    pub fn password_matches(&self, cleartext: &str) -> bool {
        let Some(values) = self.entry.get_ava(Attribute::UserPassword) else {
            return false;
        };
        for value in values {
            let Some((scheme_name, payload)) = split_tagged_value(value) else {
                continue;
            };
            match self.schemes.get(scheme_name) {
                Some(scheme) => {
                    if scheme.matches(payload, cleartext) {
                        return true;
                    }
                }
                None => {
                    security_error!(scheme = scheme_name, "Stored password value uses an unknown storage scheme");
                }
            }
        }
        false
    }

    /// Encode a cleartext password with the policy's default scheme, tagged
    /// for storage.
    pub fn encode_password(&self, cleartext: &str) -> Result<String, OperationError> {
        let scheme = self
            .schemes
            .get(&self.policy.default_scheme)
            .ok_or_else(|| OperationError::NoSuchStorageScheme(self.policy.default_scheme.clone()))?;
        Ok(tag_value(scheme.scheme_name(), &scheme.encode(cleartext)?))
    }

    /// On a successful bind with the cleartext in hand, re-encode stored
    /// values held under deprecated schemes with the default scheme. Only
    /// deprecated values that actually match the cleartext are replaced, and
    /// the result is guaranteed to leave at least one stored value.
    pub fn handle_deprecated_storage_schemes(
        &mut self,
        cleartext: &str,
    ) -> Result<(), OperationError> {
        if self.policy.deprecated_schemes.is_empty() {
            return Ok(());
        }
        let Some(values) = self.entry.get_ava(Attribute::UserPassword) else {
            return Ok(());
        };
        let values: Vec<String> = values.to_vec();

        let mut retained = 0usize;
        let mut removals: Vec<String> = Vec::new();
        let mut has_default = false;
        for value in &values {
            match split_tagged_value(value) {
                Some((scheme_name, payload)) => {
                    if scheme_name.eq_ignore_ascii_case(&self.policy.default_scheme) {
                        has_default = true;
                        retained += 1;
                    } else if self
                        .policy
                        .deprecated_schemes
                        .iter()
                        .any(|d| d.eq_ignore_ascii_case(scheme_name))
                    {
                        match self.schemes.get(scheme_name) {
                            Some(scheme) if scheme.matches(payload, cleartext) => {
                                removals.push(value.clone())
                            }
                            // An unknown or non-matching deprecated value is
                            // left in place, it may belong to another
                            // credential.
                            _ => retained += 1,
                        }
                    } else {
                        retained += 1;
                    }
                }
                None => retained += 1,
            }
        }
        if removals.is_empty() {
            return Ok(());
        }

        let mut additions: Vec<String> = Vec::new();
        if !has_default {
            additions.push(self.encode_password(cleartext)?);
        }
        if retained + additions.len() == 0 {
            security_error!("Deprecated scheme cleanup would remove every stored password value, aborting");
            return Err(OperationError::PasswordSchemeCleanupAborted);
        }
        security_info!(
            removed = removals.len(),
            added = additions.len(),
            "Re-encoding password values stored with deprecated schemes"
        );
        // Additions first so the entry never passes through a valueless
        // state when the list is applied in order.
        for v in additions {
            self.queue(Modify::Present(Attribute::UserPassword, v));
        }
        for v in removals {
            self.queue(Modify::Removed(Attribute::UserPassword, v));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::PasswordPolicyState;
    use crate::credential::{split_tagged_value, StorageSchemeRegistry};
    use crate::entry::{Attribute, Entry};
    use crate::idm::policy::PasswordPolicy;
    use crate::modify::Modify;
    use crate::testkit::test_init;
    use crate::utils::gtime_format;

    const NOW: Duration = Duration::from_secs(1_700_000_000);
    const DAY: u64 = 86_400;

    fn state(policy: PasswordPolicy, entry: Entry) -> PasswordPolicyState {
        test_init();
        PasswordPolicyState::new(
            Arc::new(policy),
            Arc::new(StorageSchemeRegistry::with_default_schemes()),
            entry,
            NOW,
        )
    }

    fn gt(offset_secs: i64) -> String {
        let t = if offset_secs >= 0 {
            NOW + Duration::from_secs(offset_secs as u64)
        } else {
            NOW - Duration::from_secs(offset_secs.unsigned_abs())
        };
        gtime_format(t)
    }

    #[test]
    fn test_account_expiration() {
        let mut s = state(PasswordPolicy::default(), Entry::new());
        assert!(!s.is_account_expired());

        let mut e = Entry::new();
        e.set_ava(Attribute::AccountExpirationTime, vec![gt(DAY as i64)]);
        let mut s = state(PasswordPolicy::default(), e);
        assert!(!s.is_account_expired());

        let mut e = Entry::new();
        e.set_ava(Attribute::AccountExpirationTime, vec![gt(-(DAY as i64))]);
        let mut s = state(PasswordPolicy::default(), e);
        assert!(s.is_account_expired());

        // Fail safe: a mangled value expires the account.
        let mut e = Entry::new();
        e.set_ava(
            Attribute::AccountExpirationTime,
            vec!["garbage".to_string()],
        );
        let mut s = state(PasswordPolicy::default(), e);
        assert!(s.is_account_expired());
    }

    #[test]
    fn test_account_disabled_fail_safe() {
        let mut e = Entry::new();
        e.set_ava(Attribute::AccountDisabled, vec!["maybe".to_string()]);
        let mut s = state(PasswordPolicy::default(), e);
        assert!(s.is_account_disabled());

        let mut e = Entry::new();
        e.set_ava(Attribute::AccountDisabled, vec!["false".to_string()]);
        let mut s = state(PasswordPolicy::default(), e);
        assert!(!s.is_account_disabled());
    }

    #[test]
    fn test_failure_lockout_self_heal() {
        // Three failures at the threshold, but no recorded lockout time. The
        // state machine must lock and write the missing time itself.
        let policy = PasswordPolicy {
            max_failure_count: 3,
            lockout_duration: 300,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        for i in 1..=3 {
            e.add_ava(Attribute::PasswordFailureTime, gt(-(60 * i)));
        }
        let mut s = state(policy, e);
        assert!(s.locked_due_to_failures());
        assert_eq!(s.seconds_until_unlock(), Some(300));
        let mods = s.take_modifications();
        assert!(mods.iter().any(|m| matches!(
            m,
            Modify::Present(Attribute::PasswordFailureLockedTime, _)
        )));
    }

    #[test]
    fn test_failure_lockout_duration() {
        let policy = PasswordPolicy {
            max_failure_count: 3,
            lockout_duration: 300,
            ..PasswordPolicy::default()
        };

        // Locked within the duration.
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordFailureLockedTime, vec![gt(-100)]);
        let mut s = state(policy.clone(), e);
        assert!(s.locked_due_to_failures());
        assert_eq!(s.seconds_until_unlock(), Some(200));

        // Lock elapsed: clears itself, including the failure history.
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordFailureLockedTime, vec![gt(-301)]);
        e.add_ava(Attribute::PasswordFailureTime, gt(-400));
        let mut s = state(policy, e);
        assert!(!s.locked_due_to_failures());
        assert_eq!(s.seconds_until_unlock(), None);
        let mods = s.take_modifications();
        assert!(mods
            .iter()
            .any(|m| matches!(m, Modify::Purged(Attribute::PasswordFailureLockedTime))));
        assert!(mods
            .iter()
            .any(|m| matches!(m, Modify::Purged(Attribute::PasswordFailureTime))));
    }

    #[test]
    fn test_failure_lockout_permanent_without_duration() {
        let policy = PasswordPolicy {
            max_failure_count: 3,
            lockout_duration: 0,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordFailureLockedTime, vec![gt(-9_999_999)]);
        let mut s = state(policy, e);
        assert!(s.locked_due_to_failures());
        assert_eq!(s.seconds_until_unlock(), None);
    }

    #[test]
    fn test_failure_timestamps_strictly_increasing() {
        // With a stalled clock, appended timestamps must still be distinct
        // and increasing. Direct-update mode lets us observe the entry.
        let policy = PasswordPolicy {
            max_failure_count: 10,
            state_update_direct: true,
            ..PasswordPolicy::default()
        };
        let mut s = state(policy, Entry::new());
        s.update_auth_failure_times();
        s.update_auth_failure_times();
        s.update_auth_failure_times();
        let vs: Vec<String> = s
            .entry()
            .get_ava(Attribute::PasswordFailureTime)
            .expect("missing failure times")
            .to_vec();
        assert_eq!(vs.len(), 3);
        assert_eq!(vs[0], gt(0));
        assert_eq!(vs[1], gt(1));
        assert_eq!(vs[2], gt(2));
    }

    #[test]
    fn test_failure_expiration_interval_prunes() {
        let policy = PasswordPolicy {
            max_failure_count: 3,
            lockout_failure_expiration_interval: 600,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.add_ava(Attribute::PasswordFailureTime, gt(-700));
        e.add_ava(Attribute::PasswordFailureTime, gt(-100));
        e.add_ava(Attribute::PasswordFailureTime, gt(-50));
        let mut s = state(policy, e);
        // The aged-out failure no longer counts toward the threshold.
        assert_eq!(s.auth_failure_times().len(), 2);
        assert!(!s.locked_due_to_failures());
        let mods = s.take_modifications();
        assert!(mods
            .iter()
            .any(|m| matches!(m, Modify::Removed(Attribute::PasswordFailureTime, v) if *v == gt(-700))));
    }

    #[test]
    fn test_legacy_failure_attribute_generation() {
        // Only the legacy generation present: reads and writes stay on it.
        let policy = PasswordPolicy {
            max_failure_count: 5,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.add_ava(Attribute::PasswordFailureTimeLegacy, gt(-10));
        let mut s = state(policy, e);
        assert_eq!(s.auth_failure_times().len(), 1);
        s.update_auth_failure_times();
        let mods = s.take_modifications();
        assert!(mods.iter().any(|m| matches!(
            m,
            Modify::Present(Attribute::PasswordFailureTimeLegacy, _)
        )));
    }

    #[test]
    fn test_idle_lockout() {
        let policy = PasswordPolicy {
            idle_lockout_interval: 30 * DAY,
            ..PasswordPolicy::default()
        };

        let mut e = Entry::new();
        e.set_ava(Attribute::LastLoginTime, vec![gt(-(DAY as i64))]);
        let mut s = state(policy.clone(), e);
        assert!(!s.locked_due_to_idle_interval());

        let mut e = Entry::new();
        e.set_ava(Attribute::LastLoginTime, vec![gt(-(31 * DAY as i64))]);
        e.set_ava(Attribute::PasswordChangedTime, vec![gt(-(40 * DAY as i64))]);
        let mut s = state(policy.clone(), e);
        assert!(s.locked_due_to_idle_interval());

        // A recent password change counts as activity.
        let mut e = Entry::new();
        e.set_ava(Attribute::LastLoginTime, vec![gt(-(31 * DAY as i64))]);
        e.set_ava(Attribute::PasswordChangedTime, vec![gt(-(2 * DAY as i64))]);
        let mut s = state(policy, e);
        assert!(!s.locked_due_to_idle_interval());
    }

    #[test]
    fn test_must_change_short_circuits() {
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordReset, vec!["TRUE".to_string()]);

        // User changes forbidden: a forced change could never be satisfied.
        let policy = PasswordPolicy {
            allow_user_password_changes: false,
            force_change_on_reset: true,
            ..PasswordPolicy::default()
        };
        let mut s = state(policy, e.clone());
        assert!(!s.must_change_password());

        // Neither trigger enabled: the flag is not even decoded.
        let mut s = state(PasswordPolicy::default(), e.clone());
        assert!(!s.must_change_password());

        let policy = PasswordPolicy {
            force_change_on_reset: true,
            ..PasswordPolicy::default()
        };
        let mut s = state(policy.clone(), e);
        assert!(s.must_change_password());

        // A mangled flag fails safe toward requiring the change.
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordReset, vec!["sometimes".to_string()]);
        let mut s = state(policy, e);
        assert!(s.must_change_password());
    }

    #[test]
    fn test_expiration_hard_cliff_without_warning_interval() {
        let policy = PasswordPolicy {
            max_password_age: 100_000,
            warning_interval: 0,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordChangedTime, vec![gt(-200_000)]);
        let mut s = state(policy, e);
        assert!(s.is_password_expired());
        assert!(!s.should_warn());
    }

    #[test]
    fn test_expiration_rolling_warning_window() {
        let policy = PasswordPolicy {
            max_password_age: 100_000,
            warning_interval: DAY,
            expire_without_warning: false,
            ..PasswordPolicy::default()
        };
        let mut base = Entry::new();
        base.set_ava(Attribute::PasswordChangedTime, vec![gt(-200_000)]);

        // Past the raw expiration but never warned: the password does not
        // expire, the user gets their first warning instead.
        let mut s = state(policy.clone(), base.clone());
        assert!(!s.is_password_expired());
        assert!(s.should_warn());
        assert!(s.is_first_warning());

        // Warned recently: still inside the guaranteed interval.
        let mut e = base.clone();
        e.set_ava(Attribute::PasswordExpirationWarnedTime, vec![gt(-100)]);
        let mut s = state(policy.clone(), e);
        assert!(!s.is_password_expired());
        assert!(s.should_warn());
        assert!(!s.is_first_warning());

        // A full interval after the warning: now it expires.
        let mut e = base;
        e.set_ava(
            Attribute::PasswordExpirationWarnedTime,
            vec![gt(-(DAY as i64 + 1))],
        );
        let mut s = state(policy, e);
        assert!(s.is_password_expired());
        assert!(!s.should_warn());
    }

    #[test]
    fn test_expiration_without_warning_guarantee() {
        let policy = PasswordPolicy {
            max_password_age: 100_000,
            warning_interval: DAY,
            expire_without_warning: true,
            ..PasswordPolicy::default()
        };

        // Past the expiration: expired even though no warning was issued.
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordChangedTime, vec![gt(-200_000)]);
        let mut s = state(policy.clone(), e);
        assert!(s.is_password_expired());
        assert!(!s.should_warn());

        // Inside the warning window: warns, with the first-warning marker.
        let mut e = Entry::new();
        e.set_ava(
            Attribute::PasswordChangedTime,
            vec![gt(-(100_000 - 3_600))],
        );
        let mut s = state(policy, e);
        assert!(!s.is_password_expired());
        assert!(s.should_warn());
        assert!(s.is_first_warning());
    }

    #[test]
    fn test_require_change_by_time() {
        let deadline = gt(-10);
        let policy = PasswordPolicy {
            require_change_by_time: Some(deadline.clone()),
            ..PasswordPolicy::default()
        };

        // Deadline in the past and not satisfied: it is the expiration time.
        let mut s = state(policy.clone(), Entry::new());
        assert_eq!(s.expiration_time(), Some(NOW - Duration::from_secs(10)));

        // The entry records this exact deadline as satisfied: no expiration.
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordChangedByRequiredTime, vec![deadline]);
        let mut s = state(policy, e);
        assert_eq!(s.expiration_time(), None);
    }

    #[test]
    fn test_grace_logins() {
        let policy = PasswordPolicy {
            grace_login_count: 2,
            state_update_direct: true,
            ..PasswordPolicy::default()
        };
        let mut s = state(policy, Entry::new());
        assert!(s.may_use_grace_login());
        s.update_grace_login_times();
        assert!(s.may_use_grace_login());
        s.update_grace_login_times();
        assert!(!s.may_use_grace_login());

        // Stalled-clock appends are still distinct.
        let vs = s
            .entry()
            .get_ava(Attribute::GraceLoginUseTime)
            .expect("missing grace times");
        assert_eq!(vs, [gt(0), gt(1)]);
    }

    #[test]
    fn test_grace_logins_disabled_by_policy() {
        let mut s = state(PasswordPolicy::default(), Entry::new());
        assert!(!s.may_use_grace_login());
    }

    #[test]
    fn test_direct_update_mode_bypasses_queue() {
        let policy = PasswordPolicy {
            state_update_direct: true,
            ..PasswordPolicy::default()
        };
        let mut s = state(policy, Entry::new());
        s.update_last_login_time();
        assert!(s.modifications().is_empty());
        assert_eq!(
            s.entry().get_ava_single(Attribute::LastLoginTime),
            Some(gt(0).as_str())
        );
    }

    #[test]
    fn test_queued_mode_leaves_entry_untouched() {
        let mut s = state(PasswordPolicy::default(), Entry::new());
        s.update_last_login_time();
        assert!(!s.entry().attribute_pres(Attribute::LastLoginTime));
        assert_eq!(s.modifications().len(), 1);
    }

    #[test]
    fn test_password_matches() {
        let s = state(PasswordPolicy::default(), Entry::new());
        let stored = s.encode_password("correct horse").expect("encode");
        assert!(stored.starts_with("{SSHA512}"));

        let mut e = Entry::new();
        e.add_ava(Attribute::UserPassword, "untagged-ignored".to_string());
        e.add_ava(Attribute::UserPassword, stored);
        let s = state(PasswordPolicy::default(), e);
        assert!(s.password_matches("correct horse"));
        assert!(!s.password_matches("wrong horse"));
        assert!(!s.password_matches("untagged-ignored"));
    }

    #[test]
    fn test_deprecated_scheme_cleanup_upgrades() {
        // The only stored value is a deprecated cleartext one. Cleanup must
        // add a default-scheme value before removing it so the entry never
        // ends up with zero password values.
        let policy = PasswordPolicy {
            deprecated_schemes: ["PLAIN".to_string()].into_iter().collect(),
            state_update_direct: true,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.add_ava(Attribute::UserPassword, "{PLAIN}secret".to_string());
        let mut s = state(policy, e);
        s.handle_deprecated_storage_schemes("secret")
            .expect("cleanup failed");

        let vs = s
            .entry()
            .get_ava(Attribute::UserPassword)
            .expect("all password values removed");
        assert_eq!(vs.len(), 1);
        let (scheme, _) = split_tagged_value(&vs[0]).expect("untagged");
        assert_eq!(scheme, "SSHA512");
        assert!(s.password_matches("secret"));
    }

    #[test]
    fn test_deprecated_scheme_cleanup_keeps_existing_default() {
        let policy = PasswordPolicy {
            deprecated_schemes: ["PLAIN".to_string()].into_iter().collect(),
            state_update_direct: true,
            ..PasswordPolicy::default()
        };
        let s = state(policy.clone(), Entry::new());
        let stored = s.encode_password("secret").expect("encode");

        let mut e = Entry::new();
        e.add_ava(Attribute::UserPassword, stored.clone());
        e.add_ava(Attribute::UserPassword, "{PLAIN}secret".to_string());
        // A deprecated value for some other credential is left alone.
        e.add_ava(Attribute::UserPassword, "{PLAIN}other".to_string());
        let mut s = state(policy, e);
        s.handle_deprecated_storage_schemes("secret")
            .expect("cleanup failed");

        let vs = s
            .entry()
            .get_ava(Attribute::UserPassword)
            .expect("all password values removed");
        assert_eq!(vs.len(), 2);
        assert!(vs.contains(&stored));
        assert!(vs.iter().any(|v| v == "{PLAIN}other"));
    }

    #[test]
    fn test_deprecated_scheme_cleanup_noop_without_deprecated_values() {
        let policy = PasswordPolicy {
            deprecated_schemes: ["PLAIN".to_string()].into_iter().collect(),
            ..PasswordPolicy::default()
        };
        let s = state(policy.clone(), Entry::new());
        let stored = s.encode_password("secret").expect("encode");
        let mut e = Entry::new();
        e.add_ava(Attribute::UserPassword, stored);
        let mut s = state(policy, e);
        s.handle_deprecated_storage_schemes("secret")
            .expect("cleanup failed");
        assert!(s.modifications().is_empty());
    }

    #[test]
    fn test_admin_unlock_clears_history() {
        let policy = PasswordPolicy {
            max_failure_count: 3,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordFailureLockedTime, vec![gt(-100)]);
        for i in 1..=3 {
            e.add_ava(Attribute::PasswordFailureTime, gt(-(60 * i)));
        }
        let mut s = state(policy, e);
        assert!(s.locked_due_to_failures());
        s.clear_failure_lockout();
        // The purges are only queued, but the state answers unlocked even
        // though the entry snapshot still carries the lock attribute.
        assert!(!s.locked_due_to_failures());
        assert_eq!(s.seconds_until_unlock(), None);
        let mods = s.take_modifications();
        assert!(mods
            .iter()
            .any(|m| matches!(m, Modify::Purged(Attribute::PasswordFailureLockedTime))));
        assert!(mods
            .iter()
            .any(|m| matches!(m, Modify::Purged(Attribute::PasswordFailureTime))));
    }

    #[test]
    fn test_password_change_resets_expiration_state() {
        let policy = PasswordPolicy {
            max_password_age: 100_000,
            warning_interval: 0,
            ..PasswordPolicy::default()
        };
        let mut e = Entry::new();
        e.set_ava(Attribute::PasswordChangedTime, vec![gt(-200_000)]);
        let mut s = state(policy, e);
        assert!(s.is_password_expired());
        s.update_password_changed_time();
        assert!(!s.is_password_expired());
        assert_eq!(s.seconds_until_expiration(), Some(100_000));
    }
}
