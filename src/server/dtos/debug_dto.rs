use std::collections::BTreeMap;

use serde::Serialize;

use crate::server::utils::mime_utils;

#[derive(Serialize, Debug, Clone)]
pub struct DebugResponse {
    pub url: String,
    pub upstream_status: u16,
    pub upstream_headers: BTreeMap<String, String>,
    pub analysis: UrlAnalysis,
}

/// classifier verdicts for one URL, as the pipeline would see them
#[derive(Serialize, Debug, Clone)]
pub struct UrlAnalysis {
    pub is_m3u8: bool,
    pub is_ts_segment: bool,
    pub is_vtt: bool,
    pub is_disguised_segment: bool,
    pub is_streaming_format: bool,
    pub has_segment_marker: bool,
    pub extension_mime: Option<&'static str>,
}

impl UrlAnalysis {
    pub fn of(url: &str) -> Self {
        Self {
            is_m3u8: mime_utils::is_m3u8(url),
            is_ts_segment: mime_utils::is_ts_segment(url),
            is_vtt: mime_utils::is_vtt(url),
            is_disguised_segment: mime_utils::is_disguised_segment(url),
            is_streaming_format: mime_utils::is_streaming_format(url),
            has_segment_marker: mime_utils::has_segment_marker(url),
            extension_mime: mime_utils::extension_mime(url),
        }
    }
}
