use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

pub type AppResult<T> = Result<T, Error>;

/// Everything that can surface to a client as an HTTP failure. Component
/// errors that are recoverable (decode failures, rewrite failures, cache
/// faults) never become one of these.
#[derive(Debug)]
pub enum Error {
    /// admission failure: bad URL shape or disallowed host
    BadRequest(String),
    /// admission failure with a usage hint for the admission surfaces
    BadRequestWithUsage { message: String, url: Option<String> },
    /// upstream did not answer inside the configured timeout
    UpstreamTimeout { timeout_secs: u64 },
    /// upstream answered with a failure status, body carried through
    Upstream { status: u16, message: String, details: Option<Value> },
    InternalServerError,
    InternalServerErrorWithContext(String),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::BadRequestWithUsage { .. } => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::InternalServerError | Self::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            Self::BadRequestWithUsage { message, .. } => message.clone(),
            Self::UpstreamTimeout { timeout_secs } => {
                format!("upstream request timed out after {}s", timeout_secs)
            }
            Self::Upstream { message, .. } => message.clone(),
            Self::InternalServerError => "internal server error".to_string(),
            Self::InternalServerErrorWithContext(context) => context.clone(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut error = json!({
            "code": status.as_u16(),
            "message": self.message(),
        });

        match &self {
            Error::BadRequestWithUsage { url, .. } => {
                if let Some(url) = url {
                    error["url"] = json!(url);
                }
                error["usage"] = json!(
                    "/?url=<target>, /<target>, or /base64/<base64(target)>"
                );
            }
            Error::Upstream { details: Some(details), .. } => {
                error["details"] = details.clone();
            }
            _ => {}
        }

        let body = json!({
            "error": error,
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_error_kinds() {
        assert_eq!(Error::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::UpstreamTimeout { timeout_secs: 30 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Upstream { status: 403, message: "denied".into(), details: None }.status(),
            StatusCode::FORBIDDEN
        );
        // out-of-range upstream codes degrade to 500
        assert_eq!(
            Error::Upstream { status: 42, message: "?".into(), details: None }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn timeout_message_names_the_timeout() {
        assert!(Error::UpstreamTimeout { timeout_secs: 30 }
            .message()
            .contains("30"));
    }
}
