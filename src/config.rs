use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Transport listener
    pub listen_addr: String,
    pub debug: bool,

    // Admission control
    pub rate_limit: RateLimitConfig,
    pub isolation: IsolationConfig,

    // Background execution
    pub pool: PoolConfig,

    // Startup / shutdown sequencing
    pub lifecycle: LifecycleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            debug: false,
            rate_limit: RateLimitConfig::default(),
            isolation: IsolationConfig::default(),
            pool: PoolConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Global token bucket settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Tokens per second
    pub rate: f64,
    /// Bucket capacity and initial fill
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 100.0,
            burst: 50,
        }
    }
}

/// Per-route bulkhead settings.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct IsolationConfig {
    pub enabled: bool,
    pub routes: HashMap<String, RouteLimitConfig>,
}

/// Limits for a single route.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RouteLimitConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub wait_timeout_ms: u64,
}

impl Default for RouteLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue: 0,
            wait_timeout_ms: 50,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout_ms: u64,
}

impl PoolConfig {
    pub fn new(workers: usize, queue_capacity: usize, task_timeout: Duration) -> Self {
        Self {
            workers,
            queue_capacity,
            task_timeout_ms: task_timeout.as_millis() as u64,
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            task_timeout_ms: 10_000,
        }
    }
}

/// Lifecycle orchestrator settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub stop_timeout_ms: u64,
}

impl LifecycleConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 10_000,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid route limit '{0}', expected ROUTE=MAX_CONCURRENT:MAX_QUEUE:WAIT_TIMEOUT_MS")]
    InvalidRoute(String),
    #[error("pool.workers must be greater than zero")]
    NoWorkers,
    #[error("pool.queue_capacity must be greater than zero")]
    NoQueueCapacity,
    #[error("rate_limit.rate must be positive when rate limiting is enabled")]
    InvalidRate,
    #[error("rate_limit.burst must be positive when rate limiting is enabled")]
    InvalidBurst,
}

impl Config {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::NoQueueCapacity);
        }
        if self.rate_limit.enabled {
            if !(self.rate_limit.rate > 0.0) {
                return Err(ConfigError::InvalidRate);
            }
            if self.rate_limit.burst == 0 {
                return Err(ConfigError::InvalidBurst);
            }
        }
        Ok(())
    }
}

/// Parse `"/slow=2:4:100,/jobs=4:0:50"` into route limits.
pub fn parse_routes(value: &str) -> Result<HashMap<String, RouteLimitConfig>, ConfigError> {
    let mut routes = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || ConfigError::InvalidRoute(entry.to_string());

        let (route, limits) = entry.split_once('=').ok_or_else(invalid)?;
        let parts: Vec<&str> = limits.split(':').map(str::trim).collect();
        if route.trim().is_empty() || parts.len() != 3 {
            return Err(invalid());
        }

        let max_concurrent = parts[0].parse().map_err(|_| invalid())?;
        let max_queue = parts[1].parse().map_err(|_| invalid())?;
        let wait_timeout_ms = parts[2].parse().map_err(|_| invalid())?;

        routes.insert(
            route.trim().to_string(),
            RouteLimitConfig {
                max_concurrent,
                max_queue,
                wait_timeout_ms,
            },
        );
    }
    Ok(routes)
}

pub fn load_config() -> anyhow::Result<Config> {
    load_from(|key| std::env::var(key).ok())
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn number<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Build a config from a key lookup (the process environment in production).
fn load_from(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    if let Some(path) = lookup("ADMISSION_CONFIG_PATH") {
        let cfg = Config::from_json_file(&path)?;
        cfg.validate()?;
        return Ok(cfg);
    }

    let defaults = Config::default();

    let listen_addr = lookup("ADMISSION_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

    let debug = lookup("DEBUG").is_some();

    // Global rate limit
    let rate_limit = RateLimitConfig {
        enabled: flag(lookup("ADMISSION_RATE_LIMIT_ENABLED")),
        rate: number(lookup("ADMISSION_RATE_LIMIT_RATE"), defaults.rate_limit.rate),
        burst: number(lookup("ADMISSION_RATE_LIMIT_BURST"), defaults.rate_limit.burst),
    };

    // Per-route isolation
    let routes = match lookup("ADMISSION_ISOLATION_ROUTES") {
        Some(value) => parse_routes(&value)?,
        None => HashMap::new(),
    };
    let isolation = IsolationConfig {
        enabled: flag(lookup("ADMISSION_ISOLATION_ENABLED")),
        routes,
    };

    // Worker pool
    let pool = PoolConfig {
        workers: number(lookup("ADMISSION_POOL_WORKERS"), defaults.pool.workers),
        queue_capacity: number(
            lookup("ADMISSION_POOL_QUEUE_CAPACITY"),
            defaults.pool.queue_capacity,
        ),
        task_timeout_ms: number(
            lookup("ADMISSION_POOL_TASK_TIMEOUT_MS"),
            defaults.pool.task_timeout_ms,
        ),
    };

    let lifecycle = LifecycleConfig {
        stop_timeout_ms: number(
            lookup("ADMISSION_STOP_TIMEOUT_MS"),
            defaults.lifecycle.stop_timeout_ms,
        ),
    };

    let cfg = Config {
        listen_addr,
        debug,
        rate_limit,
        isolation,
        pool,
        lifecycle,
    };
    cfg.validate()?;
    Ok(cfg)
}
