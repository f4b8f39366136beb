#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the proxy will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // seconds before an upstream fetch is abandoned and the client gets a 504
    #[clap(long, env, default_value = "30")]
    pub request_timeout_secs: u64,

    // longest URL we accept on any of the admission surfaces
    #[clap(long, env, default_value = "2048")]
    pub max_url_length: usize,

    // comma separated host allow-list, empty means every host is allowed
    #[clap(long, env, default_value = "")]
    pub url_allowlist: String,

    // bodies with a Content-Length above this stream straight through
    #[clap(long, env = "STREAM_SIZE_THRESHOLD", default_value = "1048576")]
    pub stream_size_threshold: u64,

    // streaming fast path can be disabled entirely for debugging
    #[clap(long, env = "ENABLE_STREAMING", action = clap::ArgAction::Set, default_value = "true")]
    pub enable_streaming: bool,

    // fly/cloudflare deployments want X-Accel-Buffering and CF-Cache-Status on streams
    #[clap(long, env = "USE_CLOUDFLARE", action = clap::ArgAction::Set, default_value = "false")]
    pub use_cloudflare: bool,

    // aggregate soft cap for the in-memory response cache
    #[clap(long, env, default_value = "268435456")]
    pub cache_max_bytes: u64,

    // decompression workers, 0 means one per CPU
    #[clap(long, env, default_value = "0")]
    pub worker_count: usize,

    // bodies smaller than this are decoded inline instead of queued
    #[clap(long, env, default_value = "65536")]
    pub worker_threshold_bytes: usize,

    // pending decompression tasks before submissions fail fast
    #[clap(long, env, default_value = "64")]
    pub worker_queue_depth: usize,

    // base URL that rewritten playlist/subtitle references point back at
    #[clap(long, env, default_value = "/")]
    pub proxy_base_url: String,

    // keep upstream query strings on rewritten URLs
    #[clap(long, env, action = clap::ArgAction::Set, default_value = "true")]
    pub preserve_query_params: bool,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// allow-list as a vec, empty when the list is unset
    pub fn allowed_hosts(&self) -> Vec<String> {
        self.url_allowlist
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect()
    }

    pub fn worker_pool_size(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get()
        } else {
            self.worker_count
        }
    }
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            request_timeout_secs: 30,
            max_url_length: 2048,
            url_allowlist: String::new(),
            stream_size_threshold: 1_048_576,
            enable_streaming: true,
            use_cloudflare: false,
            cache_max_bytes: 268_435_456,
            worker_count: 0,
            worker_threshold_bytes: 65_536,
            worker_queue_depth: 64,
            proxy_base_url: "/".to_string(),
            preserve_query_params: true,
            sentry_dsn: None,
        }
    }
}
