use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, Query},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use crate::server::dtos::debug_dto::{DebugResponse, UrlAnalysis};
use crate::server::error::{AppResult, Error};
use crate::server::extractors::RequestContext;
use crate::server::services::app_services::AppServices;
use crate::server::services::proxy_services::apply_cors;
use crate::server::utils::header_utils::synthesize_headers;
use crate::server::utils::url_utils::{
    decode_base64_url, decode_path_url, decode_query_url, validate_url,
};

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new()
            .route("/", any(Self::proxy_query))
            .route("/debug", get(Self::debug_probe))
            .route("/base64/{encoded}", any(Self::proxy_base64))
            .route("/{*url}", any(Self::proxy_path))
    }

    /// preflight requests short-circuit with the CORS set and no body
    fn preflight() -> Response {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers);
        (StatusCode::NO_CONTENT, headers).into_response()
    }

    /// `/?url=<target>`, the main admission surface
    async fn proxy_query(
        Extension(services): Extension<AppServices>,
        ctx: RequestContext,
        Query(params): Query<ProxyQuery>,
        body: Bytes,
    ) -> AppResult<Response> {
        if ctx.method == Method::OPTIONS {
            return Ok(Self::preflight());
        }

        let raw = params.url.ok_or_else(|| Error::BadRequestWithUsage {
            message: "missing url parameter".to_string(),
            url: None,
        })?;
        let target = decode_query_url(&raw)?;
        debug!("proxying (query): {}", target);

        Ok(services.proxy.handle(ctx, target, body).await)
    }

    /// `/<target>`, URL inline in the path, scheme optional
    async fn proxy_path(
        Extension(services): Extension<AppServices>,
        ctx: RequestContext,
        Path(url): Path<String>,
        body: Bytes,
    ) -> AppResult<Response> {
        if ctx.method == Method::OPTIONS {
            return Ok(Self::preflight());
        }

        // the target's own query string rides along on the request line
        let mut target = decode_path_url(&url);
        if let Some(query) = ctx.uri.query() {
            target.push('?');
            target.push_str(query);
        }
        debug!("proxying (path): {}", target);

        Ok(services.proxy.handle(ctx, target, body).await)
    }

    /// `/base64/<base64(target)>`
    async fn proxy_base64(
        Extension(services): Extension<AppServices>,
        ctx: RequestContext,
        Path(encoded): Path<String>,
        body: Bytes,
    ) -> AppResult<Response> {
        if ctx.method == Method::OPTIONS {
            return Ok(Self::preflight());
        }

        let target = decode_base64_url(&encoded)?;
        debug!("proxying (base64): {}", target);

        Ok(services.proxy.handle(ctx, target, body).await)
    }

    /// `/debug?url=...`: HEAD probe plus the classifier view of the URL
    async fn debug_probe(
        Extension(services): Extension<AppServices>,
        ctx: RequestContext,
        Query(params): Query<ProxyQuery>,
    ) -> AppResult<Json<DebugResponse>> {
        let raw = params.url.ok_or_else(|| Error::BadRequestWithUsage {
            message: "missing url parameter".to_string(),
            url: None,
        })?;
        let target = decode_query_url(&raw)?;

        let admitted = validate_url(
            &target,
            true,
            services.config.max_url_length,
            &services.config.allowed_hosts(),
        )
        .map_err(|reason| Error::BadRequestWithUsage {
            message: reason,
            url: Some(target.clone()),
        })?;
        let parsed = url::Url::parse(&admitted.url)
            .map_err(|e| Error::BadRequest(format!("URL does not parse: {}", e)))?;

        let upstream_headers = synthesize_headers(&parsed, &ctx.headers);
        let response = services
            .http
            .head(parsed.clone())
            .headers(upstream_headers)
            .send()
            .await
            .map_err(|e| {
                Error::InternalServerErrorWithContext(format!("upstream probe failed: {}", e))
            })?;

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Json(DebugResponse {
            url: parsed.to_string(),
            upstream_status: response.status().as_u16(),
            upstream_headers: headers,
            analysis: UrlAnalysis::of(parsed.as_str()),
        }))
    }
}
