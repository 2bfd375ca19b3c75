use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{ErrorCode, ProxyError};

/// JSON body returned for every rejected request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorReply {
    pub status: u16,
    pub body: ErrorBody,
}

impl ErrorReply {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            status: code.status(),
            body: ErrorBody {
                error: code.as_str().to_string(),
                message: code.message().to_string(),
                timestamp: now_rfc3339(),
                details: None,
                context: None,
            },
        }
    }

    /// `details` carries the error's display text, which never includes secret or token values.
    pub fn from_error(err: &ProxyError) -> Self {
        Self::new(err.code()).with_details(err.to_string())
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.body.details = Some(details.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body
            .context
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.body).unwrap_or_else(|_| b"{}".to_vec())
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
