use serde::{Deserialize, Serialize};

// ================= config.toml =================
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL of the external queue processing service.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Shared key sent as `x-api-key` on every upstream call.
    pub api_key: Option<String>,
    pub proxy: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_queue_ttl")]
    pub queue_cache_ttl_secs: u64,
    #[serde(default = "default_status_ttl")]
    pub status_cache_ttl_secs: u64,
    #[serde(default = "default_stats_ttl")]
    pub stats_cache_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub cache_sweep_interval_secs: u64,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upstream_url: default_upstream_url(),
            api_key: None,
            proxy: None,
            request_timeout_secs: default_request_timeout(),
            queue_cache_ttl_secs: default_queue_ttl(),
            status_cache_ttl_secs: default_status_ttl(),
            stats_cache_ttl_secs: default_stats_ttl(),
            cache_sweep_interval_secs: default_sweep_interval(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// 加载完成后规整 URL
    pub fn finalize(&mut self) {
        self.upstream_url = self.upstream_url.trim_end_matches('/').to_string();
        self.client.proxy_url = self.client.proxy_url.trim_end_matches('/').to_string();
        if self.api_key.as_deref().is_some_and(str::is_empty) {
            self.api_key = None;
        }
    }
}

// ================= [client] =================
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Where the dashboard reaches the queue proxy.
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    /// Server-sent events endpoint of the external service.
    pub events_url: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_load_throttle")]
    pub load_throttle_secs: u64,
    #[serde(default = "default_process_throttle")]
    pub process_throttle_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            events_url: None,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter_ms: default_retry_jitter(),
            poll_interval_secs: default_poll_interval(),
            load_throttle_secs: default_load_throttle(),
            process_throttle_secs: default_process_throttle(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

fn default_upstream_url() -> String {
    "http://localhost:3001".into()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_queue_ttl() -> u64 {
    15
}

fn default_status_ttl() -> u64 {
    10
}

fn default_stats_ttl() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_proxy_url() -> String {
    "http://localhost:8080/api/queue-manager".into()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    5000
}

fn default_retry_jitter() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_load_throttle() -> u64 {
    60
}

fn default_process_throttle() -> u64 {
    300
}
