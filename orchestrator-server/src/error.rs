//! JSON error responses for the HTTP surface.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use orchestrator::io::command::CommandError;
use orchestrator::{Error, ErrorKind};
use serde_json::{Map, Value};
use tracing::error;

/// Seconds a client should wait before retrying a saturated request.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    details: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation.as_str(),
            message,
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound.as_str(), message)
    }

    /// Refusal from the execution gate, with a retry hint.
    pub fn saturated(active: usize, limit: usize) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Saturated.as_str(),
            "test execution concurrency limit reached, retry shortly",
        )
        .with_detail("active", active)
        .with_detail("limit", limit)
        .with_detail("retry_after_ms", RETRY_AFTER_SECS * 1000)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Saturated => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Execution => StatusCode::BAD_GATEWAY,
        ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        if let Error::Saturated { active, limit } = &err {
            return Self::saturated(*active, *limit);
        }

        let kind = err.kind();
        let api = Self::new(status_for(kind), kind.as_str(), err.to_string());
        match &err {
            Error::Validation { field, .. } => api.with_detail("field", *field),
            Error::IllegalTransition(illegal) => api
                .with_detail("status", illegal.from.label())
                .with_detail("transition", illegal.transition),
            Error::PlanProvider { task_id, .. } => api.with_detail("task_id", task_id.as_str()),
            Error::Command(CommandError::Validation { field, .. }) => {
                api.with_detail("field", *field)
            }
            Error::Command(cmd) => api
                .with_detail("exit_code", cmd.exit_code())
                .with_detail("stdout", cmd.stdout())
                .with_detail("stderr", cmd.stderr())
                .with_detail("duration_ms", cmd.duration().as_millis() as u64),
            _ => api,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Io.as_str(),
            format!("{err:#}"),
        )
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("worker task failed: {err}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, kind = self.kind, error = %self.message, "request failed");
        }

        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.message));
        body.insert("kind".to_string(), Value::String(self.kind.to_string()));
        body.extend(self.details);

        let mut response = (self.status, Json(Value::Object(body))).into_response();
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_documented_status_codes() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::Saturated),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Execution), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(ErrorKind::Io),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn saturated_response_carries_retry_after() {
        let response = ApiError::from(Error::Saturated {
            active: 5,
            limit: 5,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("1"))
        );
    }

    #[test]
    fn validation_error_names_the_field() {
        let api = ApiError::from(Error::validation("command", "must be non-empty"));
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.details.get("field"), Some(&Value::from("command")));
    }
}
