//! Environment-driven configuration.
//!
//! The supervisor is launched with no arguments; everything it needs comes
//! from environment variables (a `.env` file is honored). Each logical
//! environment is configured by its `{ENV}_DATABASE_URL`; the OCR enable
//! flags, capacity ceilings, poll cadence, and monitor thresholds follow
//! the deployment's variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::capacity::CapacityLimits;
use crate::limiter::ApiLimits;
use crate::monitor::MonitorConfig;
use crate::worker::WorkerConfig;

/// Provider hard limits for the default tier in use. Overridable per
/// deployment; the limiter always applies the 80% safe ceiling on top.
const GEMINI_DEFAULT_RPM: u64 = 2000;
const GEMINI_DEFAULT_TPM: u64 = 4_000_000;
const ANTHROPIC_DEFAULT_RPM: u64 = 1000;
// Output tokens are the tighter Anthropic budget; the token bucket
// tracks that resource.
const ANTHROPIC_DEFAULT_TPM: u64 = 400_000;

/// One configured logical queue.
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub name: String,
    pub db_path: PathBuf,
    pub ocr_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub worker_count: usize,
    pub ocr_worker_count: usize,
    pub environments: Vec<EnvironmentSettings>,
    pub max_cpu: f64,
    pub max_ram: f64,
    pub reserve_cpu_percent: f64,
    pub reserve_ram_percent: f64,
    pub poll_interval: Duration,
    pub stale_job_threshold: Duration,
    pub dead_worker_threshold: Duration,
    pub gemini_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub blob_storage_dir: PathBuf,
    /// Shared store for limiter buckets and capacity allocations.
    pub shared_state_db: PathBuf,
    pub gemini_limits: ApiLimits,
    pub anthropic_limits: ApiLimits,
}

impl Settings {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Self {
        let environments = configured_environments();

        Self {
            worker_count: env_parse("WORKER_COUNT", 2),
            ocr_worker_count: env_parse("OCR_WORKER_COUNT", 1),
            environments,
            max_cpu: env_parse("SERVER_MAX_CPU", 4.0),
            max_ram: env_parse("SERVER_MAX_RAM", 8.0),
            reserve_cpu_percent: env_parse("SERVER_RESERVE_CPU_PERCENT", 20.0),
            reserve_ram_percent: env_parse("SERVER_RESERVE_RAM_PERCENT", 20.0),
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", 5000u64)),
            stale_job_threshold: Duration::from_millis(env_parse(
                "STALE_JOB_THRESHOLD_MS",
                180_000u64,
            )),
            dead_worker_threshold: Duration::from_millis(env_parse(
                "DEAD_WORKER_THRESHOLD_MS",
                120_000u64,
            )),
            gemini_api_key: env_opt("GEMINI_API_KEY"),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            blob_storage_dir: PathBuf::from(
                env::var("BLOB_STORAGE_DIR").unwrap_or_else(|_| "data/blobs".to_string()),
            ),
            shared_state_db: PathBuf::from(
                env::var("SHARED_STATE_DB").unwrap_or_else(|_| "data/shared.db".to_string()),
            ),
            gemini_limits: ApiLimits::new(
                "gemini",
                env_parse("GEMINI_RPM_LIMIT", GEMINI_DEFAULT_RPM),
                env_parse("GEMINI_TPM_LIMIT", GEMINI_DEFAULT_TPM),
            ),
            anthropic_limits: ApiLimits::new(
                "anthropic",
                env_parse("ANTHROPIC_RPM_LIMIT", ANTHROPIC_DEFAULT_RPM),
                env_parse("ANTHROPIC_TPM_LIMIT", ANTHROPIC_DEFAULT_TPM),
            ),
        }
    }

    pub fn capacity_limits(&self) -> CapacityLimits {
        CapacityLimits {
            max_cpu: self.max_cpu,
            max_ram: self.max_ram,
            reserve_cpu_percent: self.reserve_cpu_percent,
            reserve_ram_percent: self.reserve_ram_percent,
        }
    }

    /// Shape expected by the queue gateway.
    pub fn queue_configs(&self) -> Vec<(String, PathBuf, bool)> {
        self.environments
            .iter()
            .map(|e| (e.name.clone(), e.db_path.clone(), e.ocr_enabled))
            .collect()
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            ..WorkerConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            stale_job_threshold: self.stale_job_threshold,
            dead_worker_threshold: self.dead_worker_threshold,
            ..MonitorConfig::default()
        }
    }

    pub fn api_limits(&self) -> Vec<ApiLimits> {
        vec![self.gemini_limits.clone(), self.anthropic_limits.clone()]
    }
}

/// Environments come from `{DEV,STAGING,PROD}_DATABASE_URL`; an unset URL
/// means the environment is not served. With none configured, a local dev
/// queue is assumed so the platform runs out of the box.
fn configured_environments() -> Vec<EnvironmentSettings> {
    let mut environments = Vec::new();
    for name in ["dev", "staging", "prod"] {
        let url_var = format!("{}_DATABASE_URL", name.to_uppercase());
        if let Ok(url) = env::var(&url_var) {
            environments.push(EnvironmentSettings {
                name: name.to_string(),
                db_path: normalize_db_url(&url),
                ocr_enabled: env_bool(&format!("OCR_{}", name.to_uppercase()), true),
            });
        }
    }

    if environments.is_empty() {
        environments.push(EnvironmentSettings {
            name: "dev".to_string(),
            db_path: PathBuf::from("data/dev.db"),
            ocr_enabled: env_bool("OCR_DEV", true),
        });
    }
    environments
}

/// Accept both bare paths and `sqlite://` URLs for the per-environment
/// database location.
pub fn normalize_db_url(url: &str) -> PathBuf {
    let trimmed = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    PathBuf::from(trimmed)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_db_url() {
        assert_eq!(
            normalize_db_url("sqlite:///var/lib/queues/dev.db"),
            PathBuf::from("/var/lib/queues/dev.db")
        );
        assert_eq!(
            normalize_db_url("sqlite:data/dev.db"),
            PathBuf::from("data/dev.db")
        );
        assert_eq!(
            normalize_db_url("data/dev.db"),
            PathBuf::from("data/dev.db")
        );
    }

    #[test]
    fn test_env_bool_values() {
        env::set_var("REGISTREX_TEST_FLAG", "true");
        assert!(env_bool("REGISTREX_TEST_FLAG", false));
        env::set_var("REGISTREX_TEST_FLAG", "0");
        assert!(!env_bool("REGISTREX_TEST_FLAG", true));
        env::remove_var("REGISTREX_TEST_FLAG");
        assert!(env_bool("REGISTREX_TEST_FLAG", true));
        assert!(!env_bool("REGISTREX_TEST_FLAG", false));
    }

    #[test]
    fn test_env_parse_fallback() {
        env::set_var("REGISTREX_TEST_NUM", "not-a-number");
        assert_eq!(env_parse("REGISTREX_TEST_NUM", 7u64), 7);
        env::set_var("REGISTREX_TEST_NUM", "42");
        assert_eq!(env_parse("REGISTREX_TEST_NUM", 7u64), 42);
        env::remove_var("REGISTREX_TEST_NUM");
    }

    #[test]
    fn test_default_settings_have_dev_environment() {
        // No *_DATABASE_URL in the test environment.
        let settings = Settings::from_env();
        assert!(!settings.environments.is_empty());
        assert_eq!(settings.environments[0].name, "dev");
        assert_eq!(settings.gemini_limits.safe_requests_per_min(), 1600);
    }
}
