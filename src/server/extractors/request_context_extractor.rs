use std::convert::Infallible;
use std::time::Instant;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, Uri};

/// Immutable per-request value threaded through the pipeline. Built once at
/// the controller boundary; nothing downstream touches ambient request state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub range: Option<String>,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let range = parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(RequestContext {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            range,
            received_at: Instant::now(),
        })
    }
}
