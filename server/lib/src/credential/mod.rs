//! Password storage scheme plugins. Stored password values are tagged
//! `{SCHEME}payload` where payload is scheme-defined (base64 for the shipped
//! schemes). Schemes are looked up by name from a process-wide registry held
//! on the server context.

use std::sync::Arc;

use arbored_proto::OperationError;
use base64::engine::general_purpose;
use base64::Engine;
use hashbrown::HashMap;
use rand::Rng;
use sha2::{Digest, Sha512};

// NIST 800-63.b salt should be 112 bits; we keep the historic 8-byte salt for
// SSHA512 interoperability with values written by older servers.
const SSHA512_SALT_LEN: usize = 8;
const SSHA512_HASH_LEN: usize = 64;

pub trait PasswordStorageScheme: Send + Sync {
    fn scheme_name(&self) -> &'static str;

    /// Encode a cleartext password to this scheme's payload (without the
    /// `{SCHEME}` tag).
    fn encode(&self, cleartext: &str) -> Result<String, OperationError>;

    fn matches(&self, payload: &str, cleartext: &str) -> bool;

    fn is_reversible(&self) -> bool {
        false
    }

    fn decode(&self, _payload: &str) -> Result<String, OperationError> {
        Err(OperationError::UnwillingToPerform(format!(
            "scheme {} is not reversible",
            self.scheme_name()
        )))
    }
}

/// Split a stored value into scheme name and payload. None if the value does
/// not carry a `{SCHEME}` tag.
pub fn split_tagged_value(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix('{')?;
    let (scheme, payload) = rest.split_once('}')?;
    if scheme.is_empty() {
        return None;
    }
    Some((scheme, payload))
}

pub fn tag_value(scheme: &str, payload: &str) -> String {
    format!("{{{scheme}}}{payload}")
}

#[derive(Default)]
pub struct StorageSchemeRegistry {
    schemes: HashMap<String, Arc<dyn PasswordStorageScheme>>,
}

impl StorageSchemeRegistry {
    pub fn new() -> Self {
        StorageSchemeRegistry::default()
    }

    /// A registry with the shipped schemes present.
    pub fn with_default_schemes() -> Self {
        let mut reg = StorageSchemeRegistry::new();
        // Names are unique here, registration cannot fail.
        let _ = reg.register_scheme(Arc::new(SaltedSha512Scheme));
        let _ = reg.register_scheme(Arc::new(PlainScheme));
        reg
    }

    pub fn register_scheme(
        &mut self,
        scheme: Arc<dyn PasswordStorageScheme>,
    ) -> Result<(), OperationError> {
        let name = scheme.scheme_name().to_ascii_uppercase();
        if self.schemes.contains_key(&name) {
            return Err(OperationError::ConfigurationError(format!(
                "password storage scheme {name} is already registered"
            )));
        }
        self.schemes.insert(name, scheme);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PasswordStorageScheme>> {
        self.schemes.get(&name.to_ascii_uppercase())
    }
}

/// Salted SHA-512: payload is base64(sha512(cleartext || salt) || salt).
pub struct SaltedSha512Scheme;

impl PasswordStorageScheme for SaltedSha512Scheme {
    fn scheme_name(&self) -> &'static str {
        "SSHA512"
    }

    fn encode(&self, cleartext: &str) -> Result<String, OperationError> {
        let mut salt = [0u8; SSHA512_SALT_LEN];
        rand::thread_rng().fill(&mut salt[..]);

        let mut hasher = Sha512::new();
        hasher.update(cleartext.as_bytes());
        hasher.update(salt);
        let hash = hasher.finalize();

        let mut out = Vec::with_capacity(SSHA512_HASH_LEN + SSHA512_SALT_LEN);
        out.extend_from_slice(&hash);
        out.extend_from_slice(&salt);
        Ok(general_purpose::STANDARD.encode(out))
    }

    fn matches(&self, payload: &str, cleartext: &str) -> bool {
        let Ok(raw) = general_purpose::STANDARD.decode(payload) else {
            return false;
        };
        if raw.len() <= SSHA512_HASH_LEN {
            return false;
        }
        let (hash, salt) = raw.split_at(SSHA512_HASH_LEN);

        let mut hasher = Sha512::new();
        hasher.update(cleartext.as_bytes());
        hasher.update(salt);
        let check = hasher.finalize();
        check.as_slice() == hash
    }
}

/// Cleartext storage. Only sensible for migration scenarios and tests; kept
/// reversible so deprecated-scheme cleanup has something to upgrade from.
pub struct PlainScheme;

impl PasswordStorageScheme for PlainScheme {
    fn scheme_name(&self) -> &'static str {
        "PLAIN"
    }

    fn encode(&self, cleartext: &str) -> Result<String, OperationError> {
        Ok(cleartext.to_string())
    }

    fn matches(&self, payload: &str, cleartext: &str) -> bool {
        payload == cleartext
    }

    fn is_reversible(&self) -> bool {
        true
    }

    fn decode(&self, payload: &str) -> Result<String, OperationError> {
        Ok(payload.to_string())
    }
}
