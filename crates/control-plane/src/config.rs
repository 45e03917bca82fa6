// Server configuration
// Decision: Environment variables only (optionally loaded from .env by main), parsed once at startup
// Decision: Enum-valued settings accept a few aliases, case-insensitive

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use graduation_durable::{RetryPolicy, RunnerConfig, ScannerConfig};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("invalid {var}={value}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which workflow store backs the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    InMemory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StoreKind::Postgres),
            "inmemory" | "in-memory" | "memory" => Ok(StoreKind::InMemory),
            other => Err(format!("unknown store: {other}")),
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Postgres => write!(f, "postgres"),
            StoreKind::InMemory => write!(f, "inmemory"),
        }
    }
}

/// Which provisioner implementation the steps call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    /// Deterministic in-process provisioners
    Simulated,
    /// JSON-over-HTTP provisioning service
    Http,
}

impl FromStr for ProvisionerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulated" | "sim" => Ok(ProvisionerKind::Simulated),
            "http" => Ok(ProvisionerKind::Http),
            other => Err(format!("unknown provisioners: {other}")),
        }
    }
}

impl std::fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionerKind::Simulated => write!(f, "simulated"),
            ProvisionerKind::Http => write!(f, "http"),
        }
    }
}

/// HTTP provisioning service settings
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub provisioners: ProvisionerKind,
    pub provisioner: ProvisionerConfig,
    pub max_concurrency: usize,
    pub scan_interval: Duration,
    pub retry_window: Duration,
    pub retention: Duration,
    pub stale_threshold: Duration,
    pub max_attempts: u32,
    /// JSON file of subjects to load at startup
    pub subjects_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let store = parse_or(&get, "GRADUATION_STORE", StoreKind::InMemory)?;
        let database_url = get("DATABASE_URL");
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing {
                var: "DATABASE_URL",
            });
        }

        let provisioners = parse_or(&get, "GRADUATION_PROVISIONERS", ProvisionerKind::Simulated)?;
        let provisioner = ProvisionerConfig {
            base_url: get("PROVISIONER_BASE_URL"),
            api_key: get("PROVISIONER_API_KEY"),
            timeout: parse_scaled(&get, "PROVISIONER_TIMEOUT_SECS", 30, 1)?,
        };
        if provisioners == ProvisionerKind::Http && provisioner.base_url.is_none() {
            return Err(ConfigError::Missing {
                var: "PROVISIONER_BASE_URL",
            });
        }

        // A step in flight longer than this is presumed abandoned and re-run
        let stale_threshold = parse_scaled(&get, "GRADUATION_STALE_THRESHOLD_SECS", 600, 1)?;
        let floor = provisioner.timeout.checked_mul(2);
        if floor.map_or(true, |floor| stale_threshold <= floor) {
            return Err(ConfigError::Invalid {
                var: "GRADUATION_STALE_THRESHOLD_SECS",
                value: stale_threshold.as_secs().to_string(),
                reason: format!(
                    "must exceed twice PROVISIONER_TIMEOUT_SECS ({}s)",
                    provisioner.timeout.as_secs()
                ),
            });
        }

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "PORT", 9000)?,
            store,
            database_url,
            provisioners,
            provisioner,
            max_concurrency: parse_or(&get, "GRADUATION_MAX_CONCURRENCY", 16)?,
            scan_interval: parse_scaled(&get, "GRADUATION_SCAN_INTERVAL_SECS", 30, 1)?,
            retry_window: parse_scaled(&get, "GRADUATION_RETRY_WINDOW_HOURS", 6, 3600)?,
            retention: parse_scaled(&get, "GRADUATION_RETENTION_DAYS", 30, 24 * 3600)?,
            stale_threshold,
            max_attempts: parse_or(&get, "GRADUATION_MAX_ATTEMPTS", 5)?,
            subjects_file: get("GRADUATION_SUBJECTS_FILE").map(PathBuf::from),
        })
    }

    /// Address the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff policy for failed workflows
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential().with_max_attempts(self.max_attempts)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default().with_max_concurrency(self.max_concurrency)
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig::default()
            .with_scan_interval(self.scan_interval)
            .with_retry_window(self.retry_window)
            .with_retention(self.retention)
            .with_stale_threshold(self.stale_threshold)
            .with_retry_policy(self.retry_policy())
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

/// Parse a count of `unit_secs`-second units into a duration
fn parse_scaled(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
    unit_secs: u64,
) -> Result<Duration, ConfigError> {
    let count: u64 = parse_or(get, var, default)?;
    count
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::Invalid {
            var,
            value: count.to_string(),
            reason: "duration overflows".to_string(),
        })
}
