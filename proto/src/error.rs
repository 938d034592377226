use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The core error type of the server. Every fallible operation in the core
/// returns one of these, with enough context (backend ID, DN, underlying cause
/// rendered to a string) for the caller to log or surface it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    // Conflicts. The configuration acceptance phase uses these to refuse a
    // change before it is committed.
    DuplicateBackendId(String),
    DuplicateBaseDn {
        dn: String,
        backend_id: String,
    },
    DuplicateWorkflowId(String),

    // Lookup failures.
    NoSuchBackend(String),
    NoSuchBaseDn(String),
    NoSuchWorkflow(String),
    NoSuchNetworkGroup(String),
    NoSuchStorageScheme(String),

    // Lifecycle failures. Each carries the backend ID and a rendered cause.
    InstantiationError {
        backend_id: String,
        cause: String,
    },
    InitializationError {
        backend_id: String,
        cause: String,
    },
    LockError {
        key: String,
        reason: String,
    },
    BackendHasSubordinates(String),

    // Value and syntax failures.
    InvalidDnSyntax(String),
    InvalidAttributeValue {
        attr: String,
        cause: String,
    },
    ConfigurationError(String),

    // Credential handling.
    PasswordSchemeCleanupAborted,
    CryptographyError,

    UnwillingToPerform(String),
    InvalidState(String),
}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::DuplicateBackendId(id) => {
                write!(f, "a backend with ID {id} is already registered")
            }
            OperationError::DuplicateBaseDn { dn, backend_id } => {
                write!(f, "base DN {dn} is already registered to backend {backend_id}")
            }
            OperationError::DuplicateWorkflowId(id) => {
                write!(f, "a workflow with ID {id} is already registered")
            }
            OperationError::NoSuchBackend(id) => write!(f, "no backend with ID {id}"),
            OperationError::NoSuchBaseDn(dn) => write!(f, "base DN {dn} is not registered"),
            OperationError::NoSuchWorkflow(id) => write!(f, "no workflow with ID {id}"),
            OperationError::NoSuchNetworkGroup(id) => write!(f, "no network group with ID {id}"),
            OperationError::NoSuchStorageScheme(name) => {
                write!(f, "password storage scheme {name} is not registered")
            }
            OperationError::InstantiationError { backend_id, cause } => {
                write!(f, "unable to instantiate backend {backend_id}: {cause}")
            }
            OperationError::InitializationError { backend_id, cause } => {
                write!(f, "unable to initialize backend {backend_id}: {cause}")
            }
            OperationError::LockError { key, reason } => {
                write!(f, "unable to acquire lock {key}: {reason}")
            }
            OperationError::BackendHasSubordinates(id) => {
                write!(f, "backend {id} has subordinate backends and cannot be removed")
            }
            OperationError::InvalidDnSyntax(dn) => write!(f, "invalid DN syntax: {dn}"),
            OperationError::InvalidAttributeValue { attr, cause } => {
                write!(f, "invalid value for attribute {attr}: {cause}")
            }
            OperationError::ConfigurationError(msg) => write!(f, "configuration error: {msg}"),
            OperationError::PasswordSchemeCleanupAborted => {
                write!(f, "deprecated scheme cleanup would remove all password values, aborted")
            }
            OperationError::CryptographyError => write!(f, "cryptographic operation failed"),
            OperationError::UnwillingToPerform(msg) => write!(f, "unwilling to perform: {msg}"),
            OperationError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}
