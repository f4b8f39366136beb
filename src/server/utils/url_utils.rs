use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use tracing::error;

use crate::server::error::{AppResult, Error};

/// Admission verdict: hostname when the URL is absolute, None for path-only
/// and relative inputs that are allowed through for internal routing.
#[derive(Debug, PartialEq, Eq)]
pub struct AdmittedUrl {
    pub url: String,
    pub host: Option<String>,
}

/// Validate one decoded URL string. All three admission surfaces funnel here
/// so they reject identically.
pub fn validate_url(
    raw: &str,
    require_protocol: bool,
    max_length: usize,
    allowed_hosts: &[String],
) -> Result<AdmittedUrl, String> {
    let raw = raw.trim();

    if raw.is_empty() {
        return Err("URL is empty".to_string());
    }
    if raw.len() > max_length {
        return Err(format!(
            "URL exceeds maximum length of {} characters",
            max_length
        ));
    }

    // path-only and relative inputs skip shape checks entirely
    if !require_protocol && !raw.contains("://") {
        return Ok(AdmittedUrl {
            url: raw.to_string(),
            host: None,
        });
    }

    let parsed = match url::Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(e) => return Err(format!("URL does not parse: {}", e)),
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(format!("unsupported scheme '{}'", parsed.scheme()));
    }

    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
        _ => return Err("URL has no hostname".to_string()),
    };

    if !allowed_hosts.is_empty() && !allowed_hosts.iter().any(|allowed| *allowed == host) {
        return Err(format!("host '{}' is not in the allow-list", host));
    }

    Ok(AdmittedUrl {
        url: raw.to_string(),
        host: Some(host),
    })
}

/// `?url=` query surface: percent-decoded by the extractor already, so
/// only doubled encodings of the scheme still need unwrapping
pub fn decode_query_url(raw: &str) -> AppResult<String> {
    if raw.starts_with("http%3A%2F%2F") || raw.starts_with("https%3A%2F%2F") {
        return urlencoding::decode(raw)
            .map(|s| s.to_string())
            .map_err(|e| {
                error!("failed to decode url parameter: {}", e);
                Error::BadRequest("Invalid URL encoding".to_string())
            });
    }
    Ok(raw.to_string())
}

/// inline path surface: `https://` is prepended when the scheme is absent
pub fn decode_path_url(raw: &str) -> String {
    let raw = raw.trim_start_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("http:/").or_else(|| raw.strip_prefix("https:/")) {
        // routers collapse the double slash after the scheme
        if raw.starts_with("https") {
            format!("https://{}", rest.trim_start_matches('/'))
        } else {
            format!("http://{}", rest.trim_start_matches('/'))
        }
    } else {
        format!("https://{}", raw)
    }
}

/// base64 path surface: URL-safe alphabet with the padding clients strip
pub fn decode_base64_url(raw: &str) -> AppResult<String> {
    let mut padded = raw.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    URL_SAFE
        .decode(&padded)
        .map_err(|e| {
            error!("failed to decode base64 url: {}", e);
            Error::BadRequest("Invalid base64 URL encoding".to_string())
        })
        .and_then(|bytes| {
            String::from_utf8(bytes).map_err(|e| {
                error!("base64 url is not utf-8: {}", e);
                Error::BadRequest("Invalid base64 URL encoding".to_string())
            })
        })
}
