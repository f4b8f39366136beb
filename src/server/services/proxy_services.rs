use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, error, warn};

use crate::config::AppConfig;
use crate::server::error::{AppResult, Error};
use crate::server::extractors::RequestContext;
use crate::server::services::cache_services::{parse_range_header, ResponseCacheService};
use crate::server::services::metrics_services::MetricsService;
use crate::server::services::{DynCacheService, DynWorkerPoolService};
use crate::server::utils::decompress_utils::{detect_encoding, BodyEncoding};
use crate::server::utils::header_utils::synthesize_headers;
use crate::server::utils::mime_utils::{
    arbitrate_content_type, has_segment_marker, is_audio_segment, is_streaming_format, is_vtt,
    needs_m3u8_rewriting, MIME_M3U8,
};
use crate::server::utils::playlist_utils::PlaylistRewriter;
use crate::server::utils::subtitle_utils::SubtitleRewriter;
use crate::server::utils::url_utils::validate_url;

// response headers that never cross the proxy boundary
const HOP_HEADERS: [HeaderName; 2] = [header::CONNECTION, header::TRANSFER_ENCODING];

const CORS_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PATCH";
const CORS_ALLOW_HEADERS: &str =
    "Content-Type, Authorization, Range, If-Range, Origin, Accept, Accept-Encoding, Accept-Language, Cache-Control, Pragma";
const CORS_EXPOSE_HEADERS: &str = "Content-Length, Content-Range, Content-Type, Accept-Ranges";

/// settles the in-flight gauge exactly once; a drop without settlement is a
/// client abort
struct InFlightGuard {
    metrics: Arc<MetricsService>,
    started: Instant,
    settled: bool,
}

impl InFlightGuard {
    fn new(metrics: Arc<MetricsService>, started: Instant) -> Self {
        metrics.record_request();
        Self {
            metrics,
            started,
            settled: false,
        }
    }

    fn success(mut self, body_bytes: u64) {
        self.metrics
            .record_response(self.started.elapsed(), body_bytes);
        self.settled = true;
    }

    fn failure(mut self) {
        self.metrics.record_error();
        self.settled = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.record_cancellation();
        }
    }
}

/// The request-handling pipeline: admission, cache, identity synthesis,
/// upstream fetch, classification, rewriting and emission.
pub struct ProxyService {
    http: reqwest::Client,
    cache: DynCacheService,
    workers: DynWorkerPoolService,
    metrics: Arc<MetricsService>,
    config: Arc<AppConfig>,
    allowed_hosts: Vec<String>,
    playlists: PlaylistRewriter,
    subtitles: SubtitleRewriter,
}

impl ProxyService {
    pub fn new(
        http: reqwest::Client,
        cache: DynCacheService,
        workers: DynWorkerPoolService,
        metrics: Arc<MetricsService>,
        config: Arc<AppConfig>,
    ) -> Self {
        let playlists = PlaylistRewriter::new(
            &config.proxy_base_url,
            "url",
            config.preserve_query_params,
        );
        let subtitles = SubtitleRewriter::new(&config.proxy_base_url, "url");
        let allowed_hosts = config.allowed_hosts();
        Self {
            http,
            cache,
            workers,
            metrics,
            config,
            allowed_hosts,
            playlists,
            subtitles,
        }
    }

    /// entry point for every proxied exchange
    pub async fn handle(&self, ctx: RequestContext, raw_url: String, body: Bytes) -> Response {
        let guard = InFlightGuard::new(self.metrics.clone(), ctx.received_at);

        match self.run(&ctx, &raw_url, body).await {
            Ok(response) => {
                let bytes = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                guard.success(bytes);
                response
            }
            Err(e) => {
                guard.failure();
                e.into_response()
            }
        }
    }

    async fn run(&self, ctx: &RequestContext, raw_url: &str, body: Bytes) -> AppResult<Response> {
        // 1. admission
        let admitted = validate_url(raw_url, true, self.config.max_url_length, &self.allowed_hosts)
            .map_err(|reason| Error::BadRequestWithUsage {
                message: reason,
                url: Some(raw_url.to_string()),
            })?;
        let target = url::Url::parse(&admitted.url)
            .map_err(|e| Error::BadRequest(format!("URL does not parse: {}", e)))?;

        // 2. cache lookup, GET only
        let fingerprint = ResponseCacheService::fingerprint(target.as_str(), &ctx.headers);
        if ctx.is_get() {
            if let Some(cached) = self.cache.get(&fingerprint) {
                self.metrics.record_cache_hit();
                debug!("cache hit for {}", target);
                return Ok(self.cached_response(ctx, &target, cached.body, cached.content_type));
            }
            self.metrics.record_cache_miss();
        }

        // 3. identity synthesis
        let upstream_headers = synthesize_headers(&target, &ctx.headers);

        // 4. streaming fast path bypasses the cache write entirely
        let url_str = target.as_str();
        if self.config.enable_streaming
            && ctx.is_get()
            && (is_streaming_format(url_str) || has_segment_marker(url_str))
        {
            return self.stream_path(ctx, &target, upstream_headers).await;
        }

        // 5. upstream fetch
        let response = self
            .fetch(ctx.method.clone(), &target, upstream_headers, body)
            .await?;

        // 6.-8. classification, emission, cache store
        self.classify_and_emit(ctx, &target, response, Some(fingerprint))
            .await
    }

    async fn fetch(
        &self,
        method: Method,
        target: &url::Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> AppResult<reqwest::Response> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let mut request = self
            .http
            .request(method, target.clone())
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => {
                warn!(
                    "upstream fetch for {} timed out after {}s",
                    target, self.config.request_timeout_secs
                );
                Err(Error::UpstreamTimeout {
                    timeout_secs: self.config.request_timeout_secs,
                })
            }
            Ok(Err(e)) => {
                error!("upstream fetch for {} failed: {}", target, e);
                Err(Error::InternalServerErrorWithContext(format!(
                    "upstream request failed: {}",
                    e
                )))
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// read the upstream failure body and carry it through to the client
    async fn upstream_failure(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.unwrap_or_default();
        let details: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();
        let message = if details.is_some() {
            format!("upstream returned status {}", status)
        } else {
            let text = String::from_utf8_lossy(&bytes);
            let text = text.trim();
            if text.is_empty() {
                format!("upstream returned status {}", status)
            } else {
                // cloudflare error pages are enormous, keep a taste of it
                text.chars().take(200).collect()
            }
        };
        Error::Upstream {
            status,
            message,
            details,
        }
    }

    // -- streaming ----------------------------------------------------------

    /// Fast path for segment and manifest URLs. Plain bodies pipe straight
    /// through; bodies that need processing are materialized first.
    async fn stream_path(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        upstream_headers: HeaderMap,
    ) -> AppResult<Response> {
        debug!("stream path for {}", target);
        let response = self
            .fetch(Method::GET, target, upstream_headers, Bytes::new())
            .await?;

        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(self.passthrough_stream(ctx, target, response, true));
        }
        if !status.is_success() {
            return Err(self.upstream_failure(response).await);
        }

        let url_str = target.as_str();
        let content_type = header_str(response.headers(), header::CONTENT_TYPE);
        let encoding = header_str(response.headers(), header::CONTENT_ENCODING)
            .and_then(|v| BodyEncoding::from_header(&v));

        if needs_m3u8_rewriting(url_str, content_type.as_deref()) {
            let upstream = response.headers().clone();
            let body = self.read_body(response).await?;
            return self
                .process_playlist(ctx, target, &upstream, body, encoding, None)
                .await;
        }

        if is_vtt(url_str) || content_type.as_deref().is_some_and(|ct| ct.starts_with("text/vtt")) {
            let upstream = response.headers().clone();
            let body = self.read_body(response).await?;
            return self
                .process_subtitles(ctx, target, &upstream, body, encoding)
                .await;
        }

        // compressed-generic: materialize, decode, send
        if encoding.is_some() && !is_audio_segment(url_str, content_type.as_deref()) {
            let upstream = response.headers().clone();
            let body = self.read_body(response).await?;
            return Ok(self
                .decoded_response(ctx, target, &upstream, body, encoding, None)
                .await);
        }

        Ok(self.passthrough_stream(ctx, target, response, true))
    }

    /// pipe the upstream body to the client without touching it
    fn passthrough_stream(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        response: reqwest::Response,
        streaming: bool,
    ) -> Response {
        let status = response.status();
        let upstream = response.headers().clone();

        let mut headers = copy_headers(&upstream, false);
        // a stream can't be sniffed, arbitration runs on URL and header alone
        let content_type = arbitrate_content_type(
            target.as_str(),
            header_str(&upstream, header::CONTENT_TYPE).as_deref(),
            &[],
        );
        set_content_type(&mut headers, &content_type);
        self.finish_headers(target, &mut headers, &content_type, false);
        if streaming {
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
            if self.config.use_cloudflare {
                headers.insert("cf-cache-status", HeaderValue::from_static("DYNAMIC"));
            }
        }

        // count streamed bytes as they flow, there is no buffer to measure
        let metrics = self.metrics.clone();
        let stream = response.bytes_stream().inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                metrics.record_bytes_in(chunk.len() as u64);
            }
        });
        (status, headers, Body::from_stream(stream)).into_response()
    }

    // -- buffered -----------------------------------------------------------

    async fn classify_and_emit(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        response: reqwest::Response,
        fingerprint: Option<String>,
    ) -> AppResult<Response> {
        let status = response.status();

        // partial content passes through with Content-Range intact
        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(self.passthrough_stream(ctx, target, response, true));
        }
        if !status.is_success() {
            return Err(self.upstream_failure(response).await);
        }

        // large bodies route to the stream path even off the fast path
        if response
            .content_length()
            .is_some_and(|len| len > self.config.stream_size_threshold)
        {
            debug!(
                "body for {} exceeds stream threshold, switching to stream path",
                target
            );
            return Ok(self.passthrough_stream(ctx, target, response, true));
        }

        let url_str = target.as_str();
        let content_type = header_str(response.headers(), header::CONTENT_TYPE);
        let encoding = header_str(response.headers(), header::CONTENT_ENCODING)
            .and_then(|v| BodyEncoding::from_header(&v));

        // audio segments pass through byte-for-byte, encoding intact
        if is_audio_segment(url_str, content_type.as_deref()) {
            return Ok(self.passthrough_stream(ctx, target, response, false));
        }

        if needs_m3u8_rewriting(url_str, content_type.as_deref()) {
            let upstream = response.headers().clone();
            let body = self.read_body(response).await?;
            return self
                .process_playlist(ctx, target, &upstream, body, encoding, fingerprint)
                .await;
        }

        if is_vtt(url_str) || content_type.as_deref().is_some_and(|ct| ct.starts_with("text/vtt")) {
            let upstream = response.headers().clone();
            let body = self.read_body(response).await?;
            return self
                .process_subtitles(ctx, target, &upstream, body, encoding)
                .await;
        }

        let upstream = response.headers().clone();
        let body = self.read_body(response).await?;
        Ok(self
            .decoded_response(ctx, target, &upstream, body, encoding, fingerprint)
            .await)
    }

    /// materialize a body under the same deadline as the fetch itself
    async fn read_body(&self, response: reqwest::Response) -> AppResult<Bytes> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let bytes = match tokio::time::timeout(timeout, response.bytes()).await {
            Err(_) => {
                return Err(Error::UpstreamTimeout {
                    timeout_secs: self.config.request_timeout_secs,
                })
            }
            Ok(Err(e)) => {
                error!("failed to read upstream body: {}", e);
                return Err(Error::InternalServerErrorWithContext(format!(
                    "failed to read upstream body: {}",
                    e
                )));
            }
            Ok(Ok(bytes)) => bytes,
        };
        self.metrics.record_bytes_in(bytes.len() as u64);
        Ok(bytes)
    }

    /// decode a body through the worker pool, falling back to the original
    /// bytes (and keeping its content-encoding) when nothing can decode it
    async fn decode_body(
        &self,
        body: &Bytes,
        encoding: Option<BodyEncoding>,
    ) -> (Bytes, bool) {
        // servers sometimes compress without saying so, the magic bytes tell
        let encoding = encoding.or_else(|| detect_encoding(body));
        if encoding.is_none() {
            return (body.clone(), true);
        }
        let outcome = self.workers.decompress(body.to_vec(), encoding).await;
        if outcome.decoded {
            self.metrics.record_worker_success();
            (Bytes::from(outcome.bytes), true)
        } else {
            self.metrics.record_worker_failure();
            (body.clone(), false)
        }
    }

    /// decompressed manifest → rewritten manifest → client
    async fn process_playlist(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        upstream: &HeaderMap,
        body: Bytes,
        encoding: Option<BodyEncoding>,
        fingerprint: Option<String>,
    ) -> AppResult<Response> {
        let (payload, decoded) = self.decode_body(&body, encoding).await;
        if !decoded {
            // ship the original bytes, the client may still know the codec
            warn!("manifest for {} would not decode, passing through", target);
            return Ok(self.raw_response(ctx, target, upstream, body, StatusCode::OK));
        }

        let rewritten = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Bytes::from(self.playlists.rewrite(&text, target)),
            Err(e) => {
                // rewrite failure returns the decoded body with its media type
                warn!("manifest for {} is not utf-8 ({}), skipping rewrite", target, e);
                payload.clone()
            }
        };

        let mut headers = copy_headers(upstream, true);
        set_content_type(&mut headers, MIME_M3U8);
        set_content_length(&mut headers, rewritten.len());
        self.finish_headers(target, &mut headers, MIME_M3U8, false);

        if let Some(fingerprint) = fingerprint {
            self.maybe_store(ctx, &fingerprint, &rewritten, MIME_M3U8, true);
        }

        Ok((StatusCode::OK, headers, Body::from(rewritten)).into_response())
    }

    /// decompressed VTT → image references rewritten → client
    async fn process_subtitles(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        upstream: &HeaderMap,
        body: Bytes,
        encoding: Option<BodyEncoding>,
    ) -> AppResult<Response> {
        let (payload, decoded) = self.decode_body(&body, encoding).await;
        if !decoded {
            warn!("vtt body for {} would not decode, passing through", target);
            return Ok(self.raw_response(ctx, target, upstream, body, StatusCode::OK));
        }

        let rewritten = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Bytes::from(self.subtitles.rewrite(&text, target.as_str())),
            Err(e) => {
                warn!("vtt body for {} is not utf-8 ({}), skipping rewrite", target, e);
                payload.clone()
            }
        };

        let mut headers = copy_headers(upstream, true);
        set_content_type(&mut headers, "text/vtt");
        set_content_length(&mut headers, rewritten.len());
        self.finish_headers(target, &mut headers, "text/vtt", false);

        Ok((StatusCode::OK, headers, Body::from(rewritten)).into_response())
    }

    /// generic buffered body: decode, arbitrate the content type, maybe cache
    async fn decoded_response(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        upstream: &HeaderMap,
        body: Bytes,
        encoding: Option<BodyEncoding>,
        fingerprint: Option<String>,
    ) -> Response {
        let (payload, decoded) = self.decode_body(&body, encoding).await;
        if !decoded {
            return self.raw_response(ctx, target, upstream, body, StatusCode::OK);
        }

        let content_type = arbitrate_content_type(
            target.as_str(),
            header_str(upstream, header::CONTENT_TYPE).as_deref(),
            &payload,
        );

        let mut headers = copy_headers(upstream, true);
        set_content_type(&mut headers, &content_type);
        set_content_length(&mut headers, payload.len());
        self.finish_headers(target, &mut headers, &content_type, false);

        if let Some(fingerprint) = fingerprint {
            self.maybe_store(ctx, &fingerprint, &payload, &content_type, true);
        }

        (StatusCode::OK, headers, Body::from(payload)).into_response()
    }

    /// body goes out exactly as it came in, content-encoding preserved
    fn raw_response(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        upstream: &HeaderMap,
        body: Bytes,
        status: StatusCode,
    ) -> Response {
        let content_type = arbitrate_content_type(
            target.as_str(),
            header_str(upstream, header::CONTENT_TYPE).as_deref(),
            &[],
        );
        let mut headers = copy_headers(upstream, false);
        set_content_type(&mut headers, &content_type);
        set_content_length(&mut headers, body.len());
        self.finish_headers(target, &mut headers, &content_type, false);
        (status, headers, Body::from(body)).into_response()
    }

    /// serve a cache hit, honoring a byte range when one is asked for
    fn cached_response(
        &self,
        ctx: &RequestContext,
        target: &url::Url,
        body: Bytes,
        content_type: Option<String>,
    ) -> Response {
        let content_type =
            arbitrate_content_type(target.as_str(), content_type.as_deref(), &body);

        let total = body.len();
        let (status, payload, content_range) = match ctx
            .range
            .as_deref()
            .and_then(|r| parse_range_header(r, total))
        {
            Some((start, end)) => (
                StatusCode::PARTIAL_CONTENT,
                body.slice(start..=end),
                Some(format!("bytes {}-{}/{}", start, end, total)),
            ),
            None => (StatusCode::OK, body, None),
        };

        let mut headers = HeaderMap::new();
        set_content_type(&mut headers, &content_type);
        set_content_length(&mut headers, payload.len());
        if let Some(range) = content_range {
            if let Ok(value) = HeaderValue::from_str(&range) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        self.finish_headers(target, &mut headers, &content_type, true);

        (status, headers, Body::from(payload)).into_response()
    }

    fn maybe_store(
        &self,
        ctx: &RequestContext,
        fingerprint: &str,
        body: &Bytes,
        content_type: &str,
        decode_ok: bool,
    ) {
        if !ctx.is_get() || ctx.range.is_some() || !decode_ok {
            return;
        }
        self.cache
            .put(fingerprint, body.clone(), Some(content_type.to_string()));
    }

    /// CORS, Accept-Ranges and X-Cache on every response the proxy emits
    fn finish_headers(
        &self,
        target: &url::Url,
        headers: &mut HeaderMap,
        content_type: &str,
        cache_hit: bool,
    ) {
        apply_cors(headers);

        let media = content_type.starts_with("video/")
            || content_type.starts_with("audio/")
            || content_type == MIME_M3U8
            || is_streaming_format(target.as_str());
        if media {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }

        headers.insert(
            "x-cache",
            HeaderValue::from_static(if cache_hit { "HIT" } else { "MISS" }),
        );
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// copy upstream headers minus hop-by-hop ones; `decoded` additionally drops
/// the encoding and length of the original representation
fn copy_headers(upstream: &HeaderMap, decoded: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if HOP_HEADERS.contains(name) {
            continue;
        }
        if decoded && (name == header::CONTENT_ENCODING || name == header::CONTENT_LENGTH) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers
}

fn set_content_type(headers: &mut HeaderMap, content_type: &str) {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
}

pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(CORS_EXPOSE_HEADERS),
    );
}
