use once_cell::sync::Lazy;
use regex::Regex;

pub const MIME_M3U8: &str = "application/vnd.apple.mpegurl";
pub const MIME_TS: &str = "video/mp2t";
pub const MIME_OCTET: &str = "application/octet-stream";

/// extensions that enter the streaming fast path
const STREAMING_EXTENSIONS: [&str; 5] = [".ts", ".m3u8", ".mp4", ".mp3", ".m4s"];

/// non-media extensions CDNs hide transport streams behind
const DISGUISE_EXTENSIONS: [&str; 6] = [".js", ".jpg", ".png", ".gif", ".css", ".html"];

// segment naming shapes seen in the wild: seg-123, segment-123, chunk-123, -v1-a1
static SEGMENT_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\bseg-\d+").unwrap(),
        Regex::new(r"(?i)\bsegment-?\d+").unwrap(),
        Regex::new(r"(?i)\bchunk-?\d+").unwrap(),
        Regex::new(r"(?i)-v\d+-a\d+").unwrap(),
    ]
});

/// path without query/fragment, lowercased, for extension matching
fn url_path(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_ascii_lowercase()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// extension → MIME for everything the proxy serves directly
pub fn extension_mime(url: &str) -> Option<&'static str> {
    let path = url_path(url);
    let ext = path.rsplit('.').next()?;
    match ext {
        "m3u8" | "m3u" => Some(MIME_M3U8),
        "mpd" => Some("application/dash+xml"),
        "ts" => Some(MIME_TS),
        "m4s" => Some("video/iso.segment"),
        "mp4" => Some("video/mp4"),
        "mp3" => Some("audio/mpeg"),
        "aac" => Some("audio/aac"),
        "vtt" => Some("text/vtt"),
        "srt" => Some("application/x-subrip"),
        "key" => Some(MIME_OCTET),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "js" => Some("application/javascript"),
        "css" => Some("text/css"),
        "html" | "htm" => Some("text/html"),
        "json" => Some("application/json"),
        _ => None,
    }
}

pub fn is_m3u8(url: &str) -> bool {
    let path = url_path(url);
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

pub fn is_ts_segment(url: &str) -> bool {
    url_path(url).ends_with(".ts")
}

pub fn is_vtt(url: &str) -> bool {
    url_path(url).ends_with(".vtt")
}

/// segment-shaped name hiding behind a non-media extension
pub fn is_disguised_segment(url: &str) -> bool {
    let path = url_path(url);
    if !DISGUISE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    let name = basename(&path);
    if SEGMENT_NAME_PATTERNS.iter().any(|p| p.is_match(name)) {
        return true;
    }
    // legacy rule: .jpg carrying both markers anywhere in the path
    path.ends_with(".jpg") && path.contains("segment-") && path.contains("-v1-a1")
}

pub fn is_streaming_format(url: &str) -> bool {
    let path = url_path(url);
    STREAMING_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) || is_disguised_segment(url)
}

/// segment-shaped name anywhere in the path, extension aside
pub fn has_segment_marker(url: &str) -> bool {
    let path = url_path(url);
    SEGMENT_NAME_PATTERNS.iter().any(|p| p.is_match(&path))
}

/// does this URL carry a playlist whose references must be re-routed
pub fn needs_m3u8_rewriting(url: &str, content_type: Option<&str>) -> bool {
    if is_m3u8(url) {
        return true;
    }
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("mpegurl") || ct.contains("m3u8")
        })
        .unwrap_or(false)
}

pub fn is_audio_segment(url: &str, content_type: Option<&str>) -> bool {
    let path = url_path(url);
    if path.ends_with(".aac") || path.contains("mp4a.40") {
        return true;
    }
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("audio/mp4") || ct.starts_with("audio/aac")
        })
        .unwrap_or(false)
}

// MPEG-TS packets are 188 bytes, each starting with the 0x47 sync byte
const TS_PACKET_LEN: usize = 188;
const TS_SYNC: u8 = 0x47;

/// positive only on two aligned sync bytes, so a lone 0x47 can't
/// misclassify a text body
pub fn sniff_mpeg_ts(buf: &[u8]) -> bool {
    if buf.len() < TS_PACKET_LEN || buf[0] != TS_SYNC {
        return false;
    }
    (1..=5).any(|i| buf.get(i * TS_PACKET_LEN) == Some(&TS_SYNC))
}

/// Content-type arbitration: sniffed transport stream beats everything,
/// then playlist URLs, then the disguise rules, then whatever upstream said.
pub fn arbitrate_content_type(url: &str, upstream_type: Option<&str>, body: &[u8]) -> String {
    if sniff_mpeg_ts(body) {
        return MIME_TS.to_string();
    }
    if is_m3u8(url) {
        let already = upstream_type
            .map(|ct| ct.to_ascii_lowercase().contains(MIME_M3U8))
            .unwrap_or(false);
        if !already {
            return MIME_M3U8.to_string();
        }
    }
    if is_disguised_segment(url) {
        return MIME_TS.to_string();
    }
    upstream_type
        .map(|ct| ct.to_string())
        .unwrap_or_else(|| MIME_OCTET.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffer_needs_full_packet() {
        let mut buf = vec![0u8; 100];
        buf[0] = TS_SYNC;
        assert!(!sniff_mpeg_ts(&buf));
    }

    #[test]
    fn sniffer_needs_two_sync_bytes() {
        let mut buf = vec![0u8; 400];
        buf[0] = TS_SYNC;
        assert!(!sniff_mpeg_ts(&buf));
        buf[188] = TS_SYNC;
        assert!(sniff_mpeg_ts(&buf));
    }

    #[test]
    fn sniffer_rejects_missing_initial_sync() {
        let mut buf = vec![0u8; 400];
        buf[188] = TS_SYNC;
        buf[376] = TS_SYNC;
        assert!(!sniff_mpeg_ts(&buf));
    }

    #[test]
    fn disguised_segments_match_naming_patterns() {
        assert!(is_disguised_segment("https://cdn.example/seg-00012.js"));
        assert!(is_disguised_segment("https://cdn.example/live/segment-42.png"));
        assert!(is_disguised_segment("https://cdn.example/chunk-7.html"));
        assert!(is_disguised_segment("https://cdn.example/media-v1-a1.css"));
        // legacy jpg rule, markers split across the path
        assert!(is_disguised_segment(
            "https://cdn.example/segment-x/stream-v1-a1/frame.jpg"
        ));

        assert!(!is_disguised_segment("https://cdn.example/app.js"));
        assert!(!is_disguised_segment("https://cdn.example/seg-1.ts"));
        assert!(!is_disguised_segment("https://cdn.example/photo.jpg"));
    }

    #[test]
    fn streaming_format_covers_extensions_and_disguises() {
        assert!(is_streaming_format("https://h/video/index.m3u8"));
        assert!(is_streaming_format("https://h/a.mp3"));
        assert!(is_streaming_format("https://h/init.m4s?token=x"));
        assert!(is_streaming_format("https://h/seg-3.jpg"));
        assert!(!is_streaming_format("https://h/page.html"));
    }

    #[test]
    fn arbiter_decision_order() {
        let mut ts_body = vec![0u8; 400];
        ts_body[0] = TS_SYNC;
        ts_body[188] = TS_SYNC;

        // sniffed TS wins even over a text claim
        assert_eq!(
            arbitrate_content_type("https://h/x.html", Some("text/html"), &ts_body),
            MIME_TS
        );
        // m3u8 URL corrects a generic upstream type
        assert_eq!(
            arbitrate_content_type("https://h/x.m3u8", Some("text/plain"), b"#EXTM3U"),
            MIME_M3U8
        );
        // disguised segment beats the claimed image type
        assert_eq!(
            arbitrate_content_type("https://h/seg-5.jpg", Some("image/jpeg"), b"abc"),
            MIME_TS
        );
        // otherwise upstream wins, octet-stream as last resort
        assert_eq!(
            arbitrate_content_type("https://h/file.bin", Some("application/x-foo"), b"abc"),
            "application/x-foo"
        );
        assert_eq!(
            arbitrate_content_type("https://h/file.bin", None, b"abc"),
            MIME_OCTET
        );
    }

    #[test]
    fn audio_segment_detection() {
        assert!(is_audio_segment("https://h/a.aac", None));
        assert!(is_audio_segment("https://h/init-mp4a.40.2.mp4", None));
        assert!(is_audio_segment("https://h/x", Some("audio/mp4")));
        assert!(!is_audio_segment("https://h/x.ts", Some("video/mp2t")));
    }
}
