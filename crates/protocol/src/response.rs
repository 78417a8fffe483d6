//! Request outcome shared by every request/response exchange

use serde::{Deserialize, Serialize};

/// Outcome of a request sent to the exercise server
///
/// A rejected request is a value, not an error: `success` is `false` and
/// `message` says why. The requester decides whether to surface or retry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<T = ()> {
    /// Whether the server accepted the request
    pub success: bool,

    /// Data returned with an accepted request
    pub payload: Option<T>,

    /// Human-readable reason, set on rejection
    pub message: Option<String>,
}

/// Response to a proposed action; carries no payload
pub type ActionResponse = Response<()>;

impl<T> Response<T> {
    /// Accepted without payload
    pub fn ok() -> Self {
        Self {
            success: true,
            payload: None,
            message: None,
        }
    }

    /// Accepted with payload
    pub fn ok_with(payload: T) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            message: None,
        }
    }

    /// Rejected with a reason
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            message: Some(message.into()),
        }
    }

    /// Returns the payload of an accepted response, or the rejection message
    pub fn into_result(self) -> Result<Option<T>, String> {
        if self.success {
            Ok(self.payload)
        } else {
            Err(self.message.unwrap_or_else(|| "request rejected".to_string()))
        }
    }
}
