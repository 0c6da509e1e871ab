//! Configuration for the stratad daemon

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn expand_env_refs(value: &str) -> anyhow::Result<String> {
    let mut out = String::new();
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow::anyhow!("Unclosed env var reference in value: {}", value))?;
        let name = &after[..end];
        if name.is_empty() {
            return Err(anyhow::anyhow!(
                "Empty env var reference in value: {}",
                value
            ));
        }
        let resolved = std::env::var(name)
            .map_err(|_| anyhow::anyhow!("Missing environment variable: {}", name))?;
        out.push_str(&resolved);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Persistence backend for users, sessions and the audit chain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Everything lives in process memory and is lost on restart
    #[default]
    Memory,
    /// SQLite files at `control_db` and `audit_db`
    Sqlite,
}

/// Authentication and session configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Register unknown keys on first successful verification
    #[serde(default = "default_true")]
    pub auto_register: bool,
    /// New users start as Pending until an admin activates them
    #[serde(default)]
    pub require_approval: bool,
    /// Allow bootstrap-flagged methods without a token while no users exist
    #[serde(default = "default_true")]
    pub bootstrap: bool,
    /// Challenge lifetime in seconds
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,
    /// Session idle timeout in seconds
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Interval between background sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_challenge_ttl_secs() -> u64 {
    30
}

fn default_session_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auto_register: true,
            require_approval: false,
            bootstrap: true,
            challenge_ttl_secs: default_challenge_ttl_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl AuthConfig {
    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Rate limiting configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sustained requests per second per caller
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Burst size (number of requests allowed in a burst)
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// How often fully refilled buckets are dropped. A bucket goes once it
    /// has regained its whole burst, which may be much sooner than this.
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
    /// Trusted proxy IP addresses (X-Forwarded-For only trusted from these)
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Whether to trust X-Forwarded-For from any source (INSECURE - use trusted_proxies instead)
    #[serde(default)]
    pub trust_xff_from_any: bool,
}

fn default_requests_per_second() -> u32 {
    100
}

fn default_burst_size() -> u32 {
    50
}

fn default_idle_eviction_secs() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
            idle_eviction_secs: default_idle_eviction_secs(),
            trusted_proxies: Vec::new(),
            trust_xff_from_any: false,
        }
    }
}

/// In-memory log tail served to admins
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogBufferConfig {
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
    /// Per-subscriber queue depth; a full queue drops lines for that subscriber
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

fn default_log_capacity() -> usize {
    1000
}

fn default_subscriber_queue() -> usize {
    256
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

/// Daemon configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Listen address (e.g., "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Node identifier stamped on sessions and audit entries
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub storage: StorageBackend,

    /// Path to the SQLite control database (users, sessions)
    #[serde(default = "default_control_db")]
    pub control_db: PathBuf,

    /// Path to the SQLite audit database
    #[serde(default = "default_audit_db")]
    pub audit_db: PathBuf,

    /// Enable CORS for browser access
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Serve Prometheus metrics on /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub log_buffer: LogBufferConfig,
}

fn default_listen() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "strata-node".to_string())
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stratad")
}

fn default_control_db() -> PathBuf {
    default_data_dir().join("control.db")
}

fn default_audit_db() -> PathBuf {
    default_data_dir().join("audit.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            node_id: default_node_id(),
            log_level: default_log_level(),
            storage: StorageBackend::default(),
            control_db: default_control_db(),
            audit_db: default_audit_db(),
            cors_enabled: true,
            metrics_enabled: true,
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            log_buffer: LogBufferConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let mut config: Config = if path
            .as_ref()
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            serde_yaml::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.expand_env_refs()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (idx, proxy) in self.rate_limit.trusted_proxies.iter().enumerate() {
            proxy.parse::<IpAddr>().map_err(|e| {
                anyhow::anyhow!(
                    "Invalid rate_limit.trusted_proxies[{}] value {}: {}",
                    idx,
                    proxy,
                    e
                )
            })?;
        }
        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_second == 0 {
                anyhow::bail!("rate_limit.requests_per_second must be > 0");
            }
            if self.rate_limit.burst_size == 0 {
                anyhow::bail!("rate_limit.burst_size must be > 0");
            }
        }
        if self.auth.challenge_ttl_secs == 0 {
            anyhow::bail!("auth.challenge_ttl_secs must be > 0");
        }
        if self.auth.session_timeout_secs == 0 {
            anyhow::bail!("auth.session_timeout_secs must be > 0");
        }
        if self.log_buffer.capacity == 0 {
            anyhow::bail!("log_buffer.capacity must be > 0");
        }
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        Ok(())
    }

    pub fn expand_env_refs(&mut self) -> anyhow::Result<()> {
        self.listen = expand_env_refs(&self.listen)?;
        self.node_id = expand_env_refs(&self.node_id)?;
        self.control_db = PathBuf::from(expand_env_refs(&self.control_db.to_string_lossy())?);
        self.audit_db = PathBuf::from(expand_env_refs(&self.audit_db.to_string_lossy())?);
        for proxy in &mut self.rate_limit.trusted_proxies {
            *proxy = expand_env_refs(proxy)?;
        }
        Ok(())
    }

    /// Load from default locations or create default
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = [
            PathBuf::from("/etc/stratad/config.yaml"),
            PathBuf::from("/etc/stratad/config.toml"),
            dirs::config_dir()
                .map(|d| d.join("stratad/config.yaml"))
                .unwrap_or_default(),
            dirs::config_dir()
                .map(|d| d.join("stratad/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./stratad.yaml"),
            PathBuf::from("./stratad.toml"),
        ];

        let mut errors: Vec<(PathBuf, anyhow::Error)> = Vec::new();
        for path in paths {
            if path.as_os_str().is_empty() || !path.exists() {
                continue;
            }
            match Self::from_file(&path) {
                Ok(config) => {
                    if let Err(err) = config.validate() {
                        errors.push((path, err));
                    } else {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return Ok(config);
                    }
                }
                Err(err) => errors.push((path, err)),
            }
        }

        if !errors.is_empty() {
            let mut msg = String::from("Failed to load stratad config from existing file(s):\n");
            for (path, err) in errors {
                msg.push_str(&format!("  - {}: {err}\n", path.display()));
            }
            return Err(anyhow::anyhow!(msg));
        }

        Ok(Self::default())
    }

    /// Get the tracing level filter
    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Config as served to admins. Filesystem paths and proxy addresses are
    /// withheld.
    pub fn sanitized(&self) -> serde_json::Value {
        serde_json::json!({
            "listen": self.listen,
            "node_id": self.node_id,
            "log_level": self.log_level,
            "storage": self.storage,
            "cors_enabled": self.cors_enabled,
            "metrics_enabled": self.metrics_enabled,
            "auth": self.auth,
            "rate_limit": {
                "enabled": self.rate_limit.enabled,
                "requests_per_second": self.rate_limit.requests_per_second,
                "burst_size": self.rate_limit.burst_size,
                "idle_eviction_secs": self.rate_limit.idle_eviction_secs,
                "trusted_proxy_count": self.rate_limit.trusted_proxies.len(),
                "trust_xff_from_any": self.rate_limit.trust_xff_from_any,
            },
            "log_buffer": self.log_buffer,
        })
    }
}
