use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// the small fixed pool a request's User-Agent is drawn from
const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:145.0) Gecko/20100101 Firefox/145.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

/// client headers never forwarded upstream
const DROPPED_CLIENT_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "forwarded",
    "proxy-connection",
];

/// A per-domain identity template. `derive_origin` templates take their
/// Origin/Referer from the target URL itself instead of static values.
pub struct DomainTemplate {
    pattern: Regex,
    headers: Vec<(&'static str, &'static str)>,
    derive_origin: bool,
}

impl DomainTemplate {
    fn matches(&self, host: &str) -> bool {
        self.pattern.is_match(host)
    }
}

// ordered, first match wins, the final entry matches every host
static TEMPLATES: Lazy<Vec<DomainTemplate>> = Lazy::new(|| {
    vec![
        DomainTemplate {
            pattern: Regex::new(r"(?i)(^|\.)poocloud\.in$").unwrap(),
            headers: vec![
                ("origin", "https://ppvs.su"),
                ("referer", "https://modistreams.org/"),
                ("accept", "*/*"),
                ("accept-language", "en-US,en;q=0.9"),
                ("accept-encoding", "gzip, deflate, br, zstd"),
                ("sec-fetch-dest", "empty"),
                ("sec-fetch-mode", "cors"),
                ("sec-fetch-site", "cross-site"),
            ],
            derive_origin: false,
        },
        DomainTemplate {
            pattern: Regex::new(r"(?i)(^|\.)ppvs\.su$").unwrap(),
            headers: vec![
                ("origin", "https://api.ppvs.su/api/streams"),
                ("referer", "https://api.ppvs.su/api/streams/"),
                ("accept", "*/*"),
                ("accept-encoding", "gzip, deflate, br, zstd"),
            ],
            derive_origin: false,
        },
        // default fallback: synthesize Origin/Referer from the target host
        DomainTemplate {
            pattern: Regex::new(r".*").unwrap(),
            headers: vec![
                ("accept", "*/*"),
                ("accept-language", "en-US,en;q=0.9"),
                ("accept-encoding", "gzip, deflate, br, zstd"),
            ],
            derive_origin: true,
        },
    ]
});

// hostname → static header snapshot; values are immutable once inserted
static TEMPLATE_CACHE: Lazy<Mutex<HashMap<String, HeaderMap>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn template_for(host: &str) -> &'static DomainTemplate {
    TEMPLATES
        .iter()
        .find(|t| t.matches(host))
        .expect("template list ends with a catch-all")
}

/// static part of the synthesized headers for a hostname, cached per process
fn static_headers_for(host: &str) -> HeaderMap {
    if let Some(cached) = TEMPLATE_CACHE.lock().unwrap().get(host) {
        return cached.clone();
    }

    let template = template_for(host);
    let mut headers = HeaderMap::new();
    for (name, value) in &template.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    TEMPLATE_CACHE
        .lock()
        .unwrap()
        .entry(host.to_string())
        .or_insert_with(|| headers.clone());
    debug!("cached header template for {}", host);

    headers
}

fn is_dropped(name: &str) -> bool {
    DROPPED_CLIENT_HEADERS.contains(&name) || name.starts_with("x-forwarded")
}

/// Build the upstream request headers for one exchange: forwarded client
/// headers minus the drop-set, template headers layered over them, Host
/// rewritten to the target, a pool User-Agent, and derived Origin/Referer
/// where the template asks for it. Cache-control and pragma never survive.
pub fn synthesize_headers(target: &url::Url, client_headers: &HeaderMap) -> HeaderMap {
    let host = target.host_str().unwrap_or_default().to_ascii_lowercase();

    let mut headers = HeaderMap::new();

    for (name, value) in client_headers {
        if is_dropped(name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    // template identity wins over whatever the client sent
    for (name, value) in static_headers_for(&host).iter() {
        headers.insert(name.clone(), value.clone());
    }

    if template_for(&host).derive_origin {
        let origin = format!("{}://{}", target.scheme(), host);
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(reqwest::header::ORIGIN, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{}/", origin)) {
            headers.insert(reqwest::header::REFERER, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(reqwest::header::HOST, value);
    }

    let user_agent = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(user_agent),
    );

    // never let client caching directives poison the upstream cache
    headers.remove(reqwest::header::CACHE_CONTROL);
    headers.remove(reqwest::header::PRAGMA);

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> url::Url {
        url::Url::parse(url).unwrap()
    }

    #[test]
    fn fallback_template_derives_origin_and_referer() {
        let headers = synthesize_headers(&target("https://media.example.net/a.m3u8"), &HeaderMap::new());
        assert_eq!(
            headers.get("origin").unwrap(),
            "https://media.example.net"
        );
        assert_eq!(
            headers.get("referer").unwrap(),
            "https://media.example.net/"
        );
        assert_eq!(headers.get("host").unwrap(), "media.example.net");
    }

    #[test]
    fn first_matching_template_wins() {
        let headers = synthesize_headers(&target("https://strm.poocloud.in/x.ts"), &HeaderMap::new());
        assert_eq!(headers.get("origin").unwrap(), "https://ppvs.su");
        assert_eq!(headers.get("referer").unwrap(), "https://modistreams.org/");
    }

    #[test]
    fn client_hop_headers_are_dropped() {
        let mut client = HeaderMap::new();
        client.insert("connection", HeaderValue::from_static("keep-alive"));
        client.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        client.insert("content-length", HeaderValue::from_static("42"));
        client.insert("range", HeaderValue::from_static("bytes=0-100"));

        let headers = synthesize_headers(&target("https://h.example/a.ts"), &client);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-forwarded-for").is_none());
        assert!(headers.get("content-length").is_none());
        // conditionals like Range survive
        assert_eq!(headers.get("range").unwrap(), "bytes=0-100");
    }

    #[test]
    fn cache_directives_never_survive() {
        let mut client = HeaderMap::new();
        client.insert("cache-control", HeaderValue::from_static("no-cache"));
        client.insert("pragma", HeaderValue::from_static("no-cache"));

        let headers = synthesize_headers(&target("https://h.example/a.ts"), &client);
        assert!(headers.get("cache-control").is_none());
        assert!(headers.get("pragma").is_none());
    }

    #[test]
    fn user_agent_comes_from_the_pool() {
        let mut client = HeaderMap::new();
        client.insert("user-agent", HeaderValue::from_static("curl/8.0"));

        let headers = synthesize_headers(&target("https://h.example/a.ts"), &client);
        let ua = headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(USER_AGENTS.contains(&ua));
    }
}
