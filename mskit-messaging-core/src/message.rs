// mskit-messaging-core/src/message.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MessagingError, Result};

/// Structured message envelope: an action name plus an arbitrary JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    pub payload: Value,
}

impl Message {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }

    /// Records the sending service in `payload.initiator`.
    /// A non-object payload is left untouched.
    pub fn with_initiator(mut self, initiator: &str) -> Self {
        if let Value::Object(map) = &mut self.payload {
            map.insert("initiator".into(), Value::String(initiator.to_string()));
        }
        self
    }

    /// A message needs a non-empty action and a payload.
    pub fn validate(&self) -> Result<()> {
        if self.action.is_empty() || self.payload.is_null() {
            return Err(MessagingError::InvalidMessage(format!(
                "expecting message format with action and payload, got: {}",
                serde_json::to_string(self).unwrap_or_default()
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = MessagingError;

    fn try_from(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}
