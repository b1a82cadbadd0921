use serde::{Deserialize, Serialize};

/// The platform that the runtime hosted application is running on.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimePlatform {
    Local,
    Other,
}

// Represents a response message to be used in runtime-specific
// API responses such as that of the operator API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseMessage {
    pub message: String,
}

// Represents a HTTP response for a health check of the runtime.
#[derive(Deserialize, Serialize)]
pub struct HealthCheckResponse {
    pub timestamp: u64,
}

/// The uniform response envelope for the operator API.
/// Successful responses carry `data`, failures carry `error`;
/// the two are mutually exclusive.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        ApiEnvelope {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: &str, message: String) -> Self {
        ApiEnvelope {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: code.to_string(),
                message,
            }),
        }
    }
}
