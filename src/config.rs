use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub shared_secret: String,
    pub redis_url: String,
    pub port: u16,
    pub user_agent: String,
    pub worker_count: usize,
    pub fetch_rate_per_second: u32,
    /// Headless browser driver script; the browser engine is only registered
    /// when this is set.
    pub browser_script_path: Option<String>,
    /// PDF/DOCX converter service; the document engine is only registered
    /// when this is set.
    pub converter_url: Option<String>,
    pub max_browser_sessions: usize,
    pub max_cpu_utilization: f32,
    pub max_memory_utilization: f32,
    pub poll_interval_ms: u64,
    pub resource_backoff_ms: u64,
    pub renew_interval_secs: u64,
    pub lease_extension_secs: u64,
    pub webhook_timeout_secs: u64,
    pub enterprise_concurrency: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let shared_secret =
            env::var("SHARED_SECRET").map_err(|_| ConfigError::Missing("SHARED_SECRET"))?;
        let redis_url = env::var("REDIS_URL").map_err(|_| ConfigError::Missing("REDIS_URL"))?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue("PORT", "must be a valid u16"))?;

        let user_agent =
            env::var("USER_AGENT").unwrap_or_else(|_| "scrapeloop/1.0".to_string());

        let worker_count = env::var("WORKER_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidValue("WORKER_COUNT", "must be a valid usize"))?;

        let fetch_rate_per_second = env::var("FETCH_RATE_PER_SECOND")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<u32>()
            .map_err(|_| {
                ConfigError::InvalidValue("FETCH_RATE_PER_SECOND", "must be a valid u32")
            })?;

        let browser_script_path = env::var("BROWSER_SCRIPT_PATH").ok().filter(|s| !s.is_empty());
        let converter_url = env::var("CONVERTER_URL").ok().filter(|s| !s.is_empty());

        let max_browser_sessions = env::var("MAX_BROWSER_SESSIONS")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::InvalidValue("MAX_BROWSER_SESSIONS", "must be a valid usize")
            })?;

        let max_cpu_utilization = env::var("MAX_CPU_UTILIZATION")
            .unwrap_or_else(|_| "0.8".to_string())
            .parse::<f32>()
            .map_err(|_| ConfigError::InvalidValue("MAX_CPU_UTILIZATION", "must be a valid f32"))?;

        let max_memory_utilization = env::var("MAX_MEMORY_UTILIZATION")
            .unwrap_or_else(|_| "0.8".to_string())
            .parse::<f32>()
            .map_err(|_| {
                ConfigError::InvalidValue("MAX_MEMORY_UTILIZATION", "must be a valid f32")
            })?;

        let poll_interval_ms = env::var("POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue("POLL_INTERVAL_MS", "must be a valid u64"))?;

        let resource_backoff_ms = env::var("RESOURCE_BACKOFF_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue("RESOURCE_BACKOFF_MS", "must be a valid u64")
            })?;

        let renew_interval_secs = env::var("RENEW_INTERVAL_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue("RENEW_INTERVAL_SECS", "must be a valid u64")
            })?;

        let lease_extension_secs = env::var("LEASE_EXTENSION_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue("LEASE_EXTENSION_SECS", "must be a valid u64")
            })?;

        let webhook_timeout_secs = env::var("WEBHOOK_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue("WEBHOOK_TIMEOUT_SECS", "must be a valid u64")
            })?;

        let enterprise_concurrency = env::var("ENTERPRISE_CONCURRENCY")
            .unwrap_or_else(|_| "200".to_string())
            .parse::<u32>()
            .map_err(|_| {
                ConfigError::InvalidValue("ENTERPRISE_CONCURRENCY", "must be a valid u32")
            })?;

        Ok(Config {
            shared_secret,
            redis_url,
            port,
            user_agent,
            worker_count,
            fetch_rate_per_second,
            browser_script_path,
            converter_url,
            max_browser_sessions,
            max_cpu_utilization,
            max_memory_utilization,
            poll_interval_ms,
            resource_backoff_ms,
            renew_interval_secs,
            lease_extension_secs,
            webhook_timeout_secs,
            enterprise_concurrency,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}
