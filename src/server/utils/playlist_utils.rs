use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

// quoted URI/URL attributes inside tag lines (EXT-X-KEY, EXT-X-MEDIA,
// EXT-X-MAP, EXT-X-I-FRAME-STREAM-INF and friends)
static URI_ATTR_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)(URI|URL)="([^"]+)""#).unwrap());

/// Rewrites every resource reference in an HLS manifest so it routes back
/// through the proxy.
pub struct PlaylistRewriter {
    proxy_base: String,
    url_param: String,
    preserve_query_params: bool,
}

impl PlaylistRewriter {
    pub fn new(proxy_base: &str, url_param: &str, preserve_query_params: bool) -> Self {
        Self {
            proxy_base: proxy_base.to_string(),
            url_param: url_param.to_string(),
            preserve_query_params,
        }
    }

    fn proxy_prefix(&self) -> String {
        let joiner = if self.proxy_base.contains('?') { '&' } else { '?' };
        format!("{}{}{}=", self.proxy_base, joiner, self.url_param)
    }

    /// resolve a manifest reference (absolute, protocol-relative,
    /// root-relative or path-relative) against the playlist URL
    fn resolve(&self, reference: &str, base: &url::Url) -> Option<String> {
        let mut resolved = match base.join(reference) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("failed to resolve manifest reference '{}': {}", reference, e);
                return None;
            }
        };
        if !self.preserve_query_params {
            resolved.set_query(None);
        }
        Some(resolved.to_string())
    }

    fn proxied(&self, absolute: &str) -> String {
        format!("{}{}", self.proxy_prefix(), urlencoding::encode(absolute))
    }

    fn rewrite_tag_line(&self, line: &str, base: &url::Url) -> String {
        let prefix = self.proxy_prefix();
        URI_ATTR_REGEX
            .replace_all(line, |caps: &regex::Captures| {
                let key = &caps[1];
                let value = &caps[2];
                // a reference that already points at us stays put
                if value.starts_with(&prefix) {
                    return caps[0].to_string();
                }
                match self.resolve(value, base) {
                    Some(absolute) => format!("{}=\"{}\"", key, self.proxied(&absolute)),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn rewrite_uri_line(&self, line: &str, base: &url::Url) -> String {
        if line.starts_with(&self.proxy_prefix()) {
            return line.to_string();
        }
        match self.resolve(line, base) {
            Some(absolute) => self.proxied(&absolute),
            None => line.to_string(),
        }
    }

    /// Walk the manifest line by line. Tag lines keep everything except
    /// quoted URI attributes; bare lines are segment/variant references.
    /// Inputs without #EXTM3U pass through untouched.
    pub fn rewrite(&self, text: &str, target: &url::Url) -> String {
        if !text.to_ascii_lowercase().contains("#extm3u") {
            warn!("body for {} is not an m3u8 manifest, leaving as-is", target);
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len() * 2);
        let mut rest = text;

        while !rest.is_empty() {
            let (line, remainder, newline) = match rest.find('\n') {
                Some(pos) => (&rest[..pos], &rest[pos + 1..], true),
                None => (rest, "", false),
            };
            rest = remainder;

            // keep the exact line ending the source used
            let (content, cr) = match line.strip_suffix('\r') {
                Some(stripped) => (stripped, true),
                None => (line, false),
            };

            let trimmed = content.trim();
            if trimmed.is_empty() {
                out.push_str(content);
            } else if trimmed.starts_with('#') {
                out.push_str(&self.rewrite_tag_line(content, target));
            } else {
                out.push_str(&self.rewrite_uri_line(trimmed, target));
            }

            if cr {
                out.push('\r');
            }
            if newline {
                out.push('\n');
            }
        }

        debug!("rewrote manifest for {} ({} bytes)", target, out.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> PlaylistRewriter {
        PlaylistRewriter::new("/", "url", true)
    }

    fn target() -> url::Url {
        url::Url::parse("https://cdn.example.com/live/stream/index.m3u8").unwrap()
    }

    #[test]
    fn passes_through_non_manifests() {
        let body = "<html>not a playlist</html>";
        assert_eq!(rewriter().rewrite(body, &target()), body);
    }

    #[test]
    fn rewrites_relative_segment_lines() {
        let manifest = "#EXTM3U\n#EXTINF:6.0,\nseg-001.ts\n";
        let out = rewriter().rewrite(manifest, &target());
        assert!(out.contains(
            "/?url=https%3A%2F%2Fcdn.example.com%2Flive%2Fstream%2Fseg-001.ts"
        ));
        assert!(out.contains("#EXTINF:6.0,"));
    }

    #[test]
    fn resolves_every_reference_shape() {
        let manifest = concat!(
            "#EXTM3U\n",
            "https://other.example.net/abs.ts\n",
            "//proto.example.net/rel.ts\n",
            "/root/rel.ts\n",
            "path/rel.ts\n",
        );
        let out = rewriter().rewrite(manifest, &target());
        assert!(out.contains("/?url=https%3A%2F%2Fother.example.net%2Fabs.ts"));
        assert!(out.contains("/?url=https%3A%2F%2Fproto.example.net%2Frel.ts"));
        assert!(out.contains("/?url=https%3A%2F%2Fcdn.example.com%2Froot%2Frel.ts"));
        assert!(out.contains(
            "/?url=https%3A%2F%2Fcdn.example.com%2Flive%2Fstream%2Fpath%2Frel.ts"
        ));
    }

    #[test]
    fn rewrites_uri_attributes_in_tags() {
        let manifest = concat!(
            "#EXTM3U\n",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"key/k1.key\",IV=0x1234\n",
            "#EXT-X-MAP:URI=\"init.mp4\"\n",
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",URI=\"audio/a.m3u8\"\n",
            "#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=100000,URI=\"iframe.m3u8\"\n",
        );
        let out = rewriter().rewrite(manifest, &target());
        assert!(out.contains(
            "URI=\"/?url=https%3A%2F%2Fcdn.example.com%2Flive%2Fstream%2Fkey%2Fk1.key\""
        ));
        assert!(out.contains("IV=0x1234"));
        assert!(out.contains(
            "URI=\"/?url=https%3A%2F%2Fcdn.example.com%2Flive%2Fstream%2Finit.mp4\""
        ));
        assert!(out.contains("TYPE=AUDIO,GROUP-ID=\"aud\""));
    }

    #[test]
    fn non_uri_tags_are_untouched() {
        let manifest = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n";
        assert_eq!(rewriter().rewrite(manifest, &target()), manifest);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let manifest = concat!(
            "#EXTM3U\n",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"k.key\"\n",
            "#EXTINF:4.0,\n",
            "seg-1.ts\n",
        );
        let once = rewriter().rewrite(manifest, &target());
        let twice = rewriter().rewrite(&once, &target());
        assert_eq!(once, twice);
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let manifest = "#EXTM3U\r\n#EXTINF:6.0,\r\nseg-1.ts\r\n";
        let out = rewriter().rewrite(manifest, &target());
        assert!(out.contains("#EXTM3U\r\n"));
        assert!(out.ends_with("\r\n"));
        assert_eq!(out.matches("\r\n").count(), 3);
    }

    #[test]
    fn can_strip_query_params() {
        let rewriter = PlaylistRewriter::new("/", "url", false);
        let manifest = "#EXTM3U\nseg-1.ts?token=abc\n";
        let out = rewriter.rewrite(manifest, &target());
        assert!(!out.contains("token"));
    }
}
