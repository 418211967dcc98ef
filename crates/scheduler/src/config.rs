//! Scheduler configuration

use anyhow::{bail, Result};
use config::builder::DefaultState;
use config::ConfigBuilder;
use scheduler_lib::mirror::MirrorConfig;
use scheduler_lib::reconciler::ReconcilerConfig;
use scheduler_lib::toggle::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "SCHEDULER_CONFIG_FILE";

/// Prefix of configuration environment variables (`SCHEDULER_API_PORT`, ...)
pub const ENV_PREFIX: &str = "SCHEDULER";

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Name used in structured log events, from the pod's hostname
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Port of the health, metrics and control API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between reconciliation ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Seconds between full re-lists of the workload mirror
    #[serde(default = "default_resync_period")]
    pub resync_period_secs: u64,

    /// Seconds to wait for the initial workload listing
    #[serde(default = "default_cache_sync_timeout")]
    pub cache_sync_timeout_secs: u64,

    /// Seconds to stay up, not ready, before stopping on shutdown
    #[serde(default = "default_shutdown_wait")]
    pub shutdown_wait_secs: u64,

    /// Watch a single namespace; all namespaces if unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Explicit kubeconfig path
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Evaluate windows against UTC instead of local time
    #[serde(default)]
    pub use_utc: bool,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "replica-scheduler".to_string())
}

fn default_api_port() -> u16 {
    8081
}

fn default_tick_interval() -> u64 {
    5
}

fn default_resync_period() -> u64 {
    300
}

fn default_cache_sync_timeout() -> u64 {
    60
}

fn default_shutdown_wait() -> u64 {
    5
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    10
}

impl SchedulerConfig {
    /// Load configuration from the optional config file, then the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        Self::from_builder(builder.add_source(config::Environment::with_prefix(ENV_PREFIX)))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be greater than zero");
        }
        if self.resync_period_secs == 0 {
            bail!("resync_period_secs must be greater than zero");
        }
        if self.cache_sync_timeout_secs == 0 {
            bail!("cache_sync_timeout_secs must be greater than zero");
        }
        if self.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }

    pub fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            resync_period: Duration::from_secs(self.resync_period_secs),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Environment, File, FileFormat};
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::from_builder(config::Config::builder().add_source(env(&[])))
            .unwrap();

        assert_eq!(config.api_port, 8081);
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.resync_period_secs, 300);
        assert_eq!(config.cache_sync_timeout_secs, 60);
        assert_eq!(config.shutdown_wait(), Duration::from_secs(5));
        assert!(config.namespace.is_none());
        assert!(!config.use_utc);

        let retry = config.reconciler_config().retry;
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_environment_overrides() {
        let config = SchedulerConfig::from_builder(config::Config::builder().add_source(env(&[
            ("SCHEDULER_API_PORT", "9090"),
            ("SCHEDULER_NAMESPACE", "staging"),
            ("SCHEDULER_USE_UTC", "true"),
            ("SCHEDULER_TICK_INTERVAL_SECS", "30"),
        ])))
        .unwrap();

        assert_eq!(config.api_port, 9090);
        assert_eq!(config.namespace.as_deref(), Some("staging"));
        assert!(config.use_utc);
        assert_eq!(
            config.reconciler_config().tick_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = File::from_str(
            "api_port = 7000\nresync_period_secs = 60\n",
            FileFormat::Toml,
        );
        let config = SchedulerConfig::from_builder(
            config::Config::builder()
                .add_source(file)
                .add_source(env(&[("SCHEDULER_API_PORT", "7100")])),
        )
        .unwrap();

        assert_eq!(config.api_port, 7100);
        assert_eq!(
            config.mirror_config().resync_period,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_rejects_zero_intervals() {
        for var in [
            "SCHEDULER_TICK_INTERVAL_SECS",
            "SCHEDULER_RESYNC_PERIOD_SECS",
            "SCHEDULER_CACHE_SYNC_TIMEOUT_SECS",
            "SCHEDULER_RETRY_MAX_ATTEMPTS",
        ] {
            let result =
                SchedulerConfig::from_builder(config::Config::builder().add_source(env(&[(var, "0")])));
            assert!(result.is_err(), "{} = 0 should be rejected", var);
        }
    }
}
