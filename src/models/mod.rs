//! Domain models and API envelopes
//!
//! Requests, decisions, plans and observed status shared by every layer.

pub mod decision;
pub mod plan;
pub mod request;
pub mod status;

pub use decision::*;
pub use plan::*;
pub use request::*;
pub use status::*;

use serde::Serialize;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn message_only(message: impl Into<String>) -> SuccessResponse<()> {
        SuccessResponse {
            success: true,
            message: message.into(),
            data: None,
        }
    }
}
