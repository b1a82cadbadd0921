use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dialcast_campaign::lifecycle::LifecycleError;
use dialcast_campaign::service::CampaignServiceError;
use dialcast_dispatch::errors::DispatchError;
use dialcast_helpers::runtime_types::ApiEnvelope;
use opentelemetry::trace::TraceError as OTelTraceError;
use redis::RedisError;
use tokio::task::JoinError;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

/// Provides a custom error type to be used for failures
/// in starting the runtime application.
#[derive(Debug)]
pub enum ApplicationStartError {
    Environment(String),
    Redis(RedisError),
    // An error occured while blocking on one of the long-running
    // tasks to complete. (e.g. API server or dispatcher loops)
    TaskWaitError(JoinError),
    OpenTelemetryTrace(OTelTraceError),
    TracerTryInit(TryInitError),
    TracingFilterParse(ParseError),
}

impl fmt::Display for ApplicationStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApplicationStartError::Environment(env_error) => {
                write!(f, "application start error: {env_error}")
            }
            ApplicationStartError::Redis(redis_error) => {
                write!(f, "application start error: {redis_error}")
            }
            ApplicationStartError::TaskWaitError(join_error) => {
                write!(f, "application start error: {join_error}")
            }
            ApplicationStartError::OpenTelemetryTrace(trace_error) => {
                write!(f, "application start error: {trace_error}")
            }
            ApplicationStartError::TracerTryInit(try_init_error) => {
                write!(f, "application start error: {try_init_error}")
            }
            ApplicationStartError::TracingFilterParse(parse_error) => {
                write!(f, "application start error: {parse_error}")
            }
        }
    }
}

impl From<RedisError> for ApplicationStartError {
    fn from(error: RedisError) -> Self {
        ApplicationStartError::Redis(error)
    }
}

impl From<JoinError> for ApplicationStartError {
    fn from(error: JoinError) -> Self {
        ApplicationStartError::TaskWaitError(error)
    }
}

impl From<OTelTraceError> for ApplicationStartError {
    fn from(error: OTelTraceError) -> Self {
        ApplicationStartError::OpenTelemetryTrace(error)
    }
}

impl From<TryInitError> for ApplicationStartError {
    fn from(error: TryInitError) -> Self {
        ApplicationStartError::TracerTryInit(error)
    }
}

impl From<ParseError> for ApplicationStartError {
    fn from(error: ParseError) -> Self {
        ApplicationStartError::TracingFilterParse(error)
    }
}

/// The error type returned by operator API handlers, rendered as the
/// uniform `{success, error: {code, message}}` envelope.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Validation(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::NotFound(message) => write!(f, "not found: {message}"),
            ApiError::Conflict(message) => write!(f, "conflict: {message}"),
            ApiError::Validation(message) => write!(f, "validation failed: {message}"),
            ApiError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, "validation", message),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        };
        (
            status,
            Json(ApiEnvelope::<serde_json::Value>::err(code, message)),
        )
            .into_response()
    }
}

impl From<CampaignServiceError> for ApiError {
    fn from(error: CampaignServiceError) -> Self {
        match error {
            CampaignServiceError::NotFound(id) => ApiError::NotFound(id),
            CampaignServiceError::Conflict { .. } => ApiError::Conflict(error.to_string()),
            CampaignServiceError::InternalError(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        ApiError::Conflict(error.to_string())
    }
}
