use envconfig::Envconfig;
use std::net::SocketAddr;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Whether subjects with overage billing may exceed their hourly limit
    #[envconfig(from = "OVERAGE_BILLING_ENABLED", default = "true")]
    pub overage_billing_enabled: bool,

    /// Upper bound on how long a concurrent slot counts toward the gauge
    #[envconfig(from = "MAX_REQUEST_DURATION", default = "300")]
    pub max_request_duration_secs: i64,

    /// How long resolved effective limits may be served from cache
    #[envconfig(from = "LIMITS_CACHE_TTL", default = "60")]
    pub limits_cache_ttl_secs: i64,

    /// Usage records older than this many days are swept
    #[envconfig(from = "USAGE_RETENTION_DAYS", default = "30")]
    pub usage_retention_days: i64,

    /// Interval between background retention sweeps, in seconds
    #[envconfig(from = "RETENTION_SWEEP_INTERVAL", default = "3600")]
    pub retention_sweep_interval_secs: u64,

    /// Interval between background exception expiry sweeps, in seconds
    #[envconfig(from = "EXPIRY_SWEEP_INTERVAL", default = "60")]
    pub expiry_sweep_interval_secs: u64,

    /// Enable request tracing
    #[envconfig(from = "ENABLE_TRACING", default = "true")]
    pub enable_tracing: bool,

    /// Default log level when RUST_LOG is unset
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("valid default addr"),
            overage_billing_enabled: true,
            max_request_duration_secs: 300,
            limits_cache_ttl_secs: 60,
            usage_retention_days: 30,
            retention_sweep_interval_secs: 3600,
            expiry_sweep_interval_secs: 60,
            enable_tracing: true,
            log_level: "info".to_string(),
        }
    }
}
