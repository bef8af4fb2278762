use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the superproxy crate.
#[derive(Error, Debug)]
pub enum SuperproxyError {
    /// The Pool cannot satisfy a selection request under the given
    /// constraints and wait budget.
    #[error("insufficient proxies: {0}")]
    InsufficientProxies(String),

    /// The brokered session exhausted `max_retries` without producing an
    /// acceptable response.
    #[error("proxy retries exhausted: {reason} (fail={fail_count}, rest={rest_count})")]
    ProxyMaxRetriesExceeded {
        reason: String,
        fail_count: u32,
        rest_count: u32,
    },

    #[error("unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SuperproxyError>;

impl SuperproxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SuperproxyError::InvalidRequest(_) | SuperproxyError::InvalidProxyAddress(_) => {
                StatusCode::BAD_REQUEST
            }
            SuperproxyError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            SuperproxyError::NotFound(_) | SuperproxyError::UnknownProxy(_) => {
                StatusCode::NOT_FOUND
            }
            SuperproxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SuperproxyError::InsufficientProxies(_)
            | SuperproxyError::ProxyMaxRetriesExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SuperproxyError::InvalidConfig(_) | SuperproxyError::MissingEnvVar(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SuperproxyError::Io(_)
            | SuperproxyError::Json(_)
            | SuperproxyError::Reqwest(_)
            | SuperproxyError::Internal(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// The exception-class name used in the gateway's `X-Superproxy-Error`
    /// header and JSON error body, and the name the client-side
    /// `SuperproxySession` whitelist matches against.
    pub fn error_class(&self) -> &'static str {
        match self {
            SuperproxyError::InsufficientProxies(_) => "InsufficientProxies",
            SuperproxyError::ProxyMaxRetriesExceeded { .. } => "ProxyMaxRetriesExceeded",
            SuperproxyError::UnknownProxy(_) => "UnknownProxy",
            SuperproxyError::InvalidProxyAddress(_) => "InvalidProxyAddress",
            SuperproxyError::AuthenticationFailed => "AuthenticationFailed",
            SuperproxyError::InvalidConfig(_) => "InvalidConfig",
            SuperproxyError::MissingEnvVar(_) => "MissingEnvVar",
            SuperproxyError::InvalidRequest(_) => "InvalidRequest",
            SuperproxyError::NotFound(_) => "NotFound",
            SuperproxyError::Timeout => "Timeout",
            SuperproxyError::Io(_) => "IoError",
            SuperproxyError::Json(_) => "JsonError",
            SuperproxyError::Reqwest(_) => "HttpError",
            SuperproxyError::Internal(_) => "InternalError",
        }
    }

    /// Extra diagnostic args carried alongside the class name in the
    /// gateway's `[ErrorClassName, ...args]` JSON error body (spec §4.7).
    pub fn error_args(&self) -> Vec<serde_json::Value> {
        match self {
            SuperproxyError::ProxyMaxRetriesExceeded {
                reason,
                fail_count,
                rest_count,
            } => vec![
                json!(reason),
                json!(fail_count),
                json!(rest_count),
            ],
            other => vec![json!(other.to_string())],
        }
    }
}

impl SuperproxyError {
    /// The gateway's brokering leg always answers errors with 500 (spec
    /// §4.7: "On InsufficientProxies/ProxyMaxRetriesExceeded/other error,
    /// respond 500..."), unlike the admin JSON API, which uses
    /// [`Self::status_code`]'s per-class mapping. Authentication failures
    /// are handled earlier, before a proxy is even selected, and never
    /// reach this path.
    pub fn into_gateway_response(self) -> Response {
        let class = self.error_class();
        let mut body = vec![json!(class)];
        body.extend(self.error_args());
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("X-Superproxy-Error", class)],
            Json(serde_json::Value::Array(body)),
        )
            .into_response()
    }
}

impl IntoResponse for SuperproxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let class = self.error_class();
        let mut body = vec![json!(class)];
        body.extend(self.error_args());

        if matches!(self, SuperproxyError::AuthenticationFailed) {
            return (
                status,
                [
                    ("X-Superproxy-Error", class.to_string()),
                    ("WWW-Authenticate", "Basic realm=superproxy".to_string()),
                ],
                Json(serde_json::Value::Array(body)),
            )
                .into_response();
        }

        (
            status,
            [("X-Superproxy-Error", class)],
            Json(serde_json::Value::Array(body)),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            SuperproxyError::InvalidRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SuperproxyError::AuthenticationFailed.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SuperproxyError::InsufficientProxies("none ready".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn error_class_names_match_spec_whitelist() {
        assert_eq!(
            SuperproxyError::InsufficientProxies("x".into()).error_class(),
            "InsufficientProxies"
        );
        assert_eq!(
            SuperproxyError::ProxyMaxRetriesExceeded {
                reason: "x".into(),
                fail_count: 2,
                rest_count: 0,
            }
            .error_class(),
            "ProxyMaxRetriesExceeded"
        );
    }
}
