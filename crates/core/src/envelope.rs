//! Uniform relay response envelope: `{success, data}` or `{success, error}`

use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Empty `data` payload for acknowledgement-only operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }

    /// Unwrap the envelope back into a result
    pub fn into_result(self) -> Result<T> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (false, _, Some(body)) => Err(Error::from_kind(body.kind, body.message)),
            (true, None, _) => Err(Error::ProviderUpstream {
                status: None,
                detail: "relay response carried no data".to_string(),
            }),
            (false, _, None) => Err(Error::ProviderUpstream {
                status: None,
                detail: "relay reported failure without detail".to_string(),
            }),
        }
    }
}
