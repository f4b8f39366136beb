use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Serialize, Debug, Clone)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    pub environment: String,
    pub memory: MemoryStats,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

impl MemoryStats {
    /// best effort from procfs, zeros anywhere that isn't linux
    pub fn sample() -> Self {
        let page_size = 4096u64;
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                let mut fields = statm.split_whitespace();
                let virtual_pages: u64 = fields.next()?.parse().ok()?;
                let rss_pages: u64 = fields.next()?.parse().ok()?;
                Some(Self {
                    rss_bytes: rss_pages * page_size,
                    virtual_bytes: virtual_pages * page_size,
                })
            })
            .unwrap_or_default()
    }
}
