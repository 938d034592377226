use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// The subset of LDAP result codes the configuration framework understands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Success,
    OperationsError,
    UnwillingToPerform,
    ObjectClassViolation,
    Other,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// The structured outcome of a live configuration change. The configuration
/// framework refuses to commit a change whose result code is not success, and
/// surfaces the messages to the administrator. `admin_action_required` flags
/// changes (such as swapping the implementation class of an active backend)
/// that were accepted but only take effect after administrative action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigChangeResult {
    pub result_code: ResultCode,
    pub admin_action_required: bool,
    pub messages: Vec<String>,
}

impl ConfigChangeResult {
    pub fn success() -> Self {
        ConfigChangeResult {
            result_code: ResultCode::Success,
            admin_action_required: false,
            messages: Vec::with_capacity(0),
        }
    }

    pub fn failure(result_code: ResultCode, message: String) -> Self {
        ConfigChangeResult {
            result_code,
            admin_action_required: false,
            messages: vec![message],
        }
    }

    pub fn admin_action(message: String) -> Self {
        ConfigChangeResult {
            result_code: ResultCode::Success,
            admin_action_required: true,
            messages: vec![message],
        }
    }

    pub fn push_message(&mut self, message: String) {
        self.messages.push(message);
    }

    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }
}

impl From<OperationError> for ConfigChangeResult {
    fn from(err: OperationError) -> Self {
        let result_code = match &err {
            OperationError::UnwillingToPerform(_) | OperationError::BackendHasSubordinates(_) => {
                ResultCode::UnwillingToPerform
            }
            OperationError::ConfigurationError(_) | OperationError::InvalidAttributeValue { .. } => {
                ResultCode::ObjectClassViolation
            }
            _ => ResultCode::OperationsError,
        };
        ConfigChangeResult {
            result_code,
            admin_action_required: false,
            messages: vec![err.to_string()],
        }
    }
}
