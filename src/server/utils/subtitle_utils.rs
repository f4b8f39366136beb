use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

// thumbnail/sprite references inside WebVTT cues
static IMAGE_REF_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)[^\s"']+?\.(jpg|jpeg|png|gif|webp)"#).unwrap());

/// Rewrites image references inside WebVTT subtitle bodies so thumbnail
/// sprites load through the proxy. Resolution rules match the playlist
/// rewriter; any failure returns the input untouched.
pub struct SubtitleRewriter {
    proxy_base: String,
    url_param: String,
}

impl SubtitleRewriter {
    pub fn new(proxy_base: &str, url_param: &str) -> Self {
        Self {
            proxy_base: proxy_base.to_string(),
            url_param: url_param.to_string(),
        }
    }

    fn proxy_prefix(&self) -> String {
        let joiner = if self.proxy_base.contains('?') { '&' } else { '?' };
        format!("{}{}{}=", self.proxy_base, joiner, self.url_param)
    }

    pub fn rewrite(&self, text: &str, target_url: &str) -> String {
        let base = match url::Url::parse(target_url) {
            Ok(base) => base,
            Err(e) => {
                warn!("cannot rewrite vtt, target url is unparsable: {}", e);
                return text.to_string();
            }
        };

        let prefix = self.proxy_prefix();

        // single pass keeps overlapping references from chewing on
        // already-rewritten text
        let mut seen: HashSet<String> = HashSet::new();
        let out = IMAGE_REF_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                let reference = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                if reference.starts_with(&prefix) {
                    return reference.to_string();
                }
                let Ok(absolute) = base.join(reference) else {
                    return reference.to_string();
                };
                seen.insert(reference.to_string());
                format!("{}{}", prefix, urlencoding::encode(absolute.as_str()))
            })
            .into_owned();

        debug!("rewrote {} distinct image references in vtt body", seen.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> SubtitleRewriter {
        SubtitleRewriter::new("/", "url")
    }

    const VTT: &str = concat!(
        "WEBVTT\n\n",
        "00:00:00.000 --> 00:00:05.000\n",
        "sprite-001.jpg#xywh=0,0,160,90\n\n",
        "00:00:05.000 --> 00:00:10.000\n",
        "thumbs/sprite-002.PNG#xywh=160,0,160,90\n",
    );

    #[test]
    fn rewrites_every_image_reference() {
        let out = rewriter().rewrite(VTT, "https://cdn.example.com/subs/track.vtt");
        assert!(out.contains("/?url=https%3A%2F%2Fcdn.example.com%2Fsubs%2Fsprite-001.jpg"));
        assert!(out.contains(
            "/?url=https%3A%2F%2Fcdn.example.com%2Fsubs%2Fthumbs%2Fsprite-002.PNG"
        ));
        // cue timings untouched
        assert!(out.contains("00:00:05.000 --> 00:00:10.000"));
    }

    #[test]
    fn duplicate_references_rewrite_consistently() {
        let body = "WEBVTT\n\na.jpg\na.jpg\n";
        let out = rewriter().rewrite(body, "https://h.example/x.vtt");
        assert_eq!(out.matches("/?url=https%3A%2F%2Fh.example%2Fa.jpg").count(), 2);
    }

    #[test]
    fn unparsable_target_returns_input() {
        assert_eq!(rewriter().rewrite(VTT, "not a url"), VTT);
    }

    #[test]
    fn bodies_without_images_are_untouched() {
        let body = "WEBVTT\n\n00:00.000 --> 00:05.000\nplain dialogue line\n";
        assert_eq!(rewriter().rewrite(body, "https://h.example/x.vtt"), body);
    }
}
