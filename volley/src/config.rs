//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `VOLLEY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `VOLLEY_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `VOLLEY_PROCESSOR__MAX_CONCURRENT=8` sets `processor.max_concurrent`.
//!
//! ## Example
//!
//! ```yaml
//! processor:
//!   max_retries: 3
//!   retry_delay: 1s
//! cache:
//!   ttl: 24h
//!   disk:
//!     dir: /var/cache/volley
//! providers:
//!   - id: openai
//!     is_default: true
//!     requests_per_minute: 50
//!     max_batch_size: 4
//!     cost_per_image: 0.02
//!     kind:
//!       type: openai
//!       api_key: sk-...
//!   - id: sandbox
//!     cost_per_image: 0.0
//!     kind:
//!       type: simulated
//!       latency: 2s
//!       failure_rate: 0.05
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::registry::ProviderSettings;
use crate::types::ProviderId;

/// CLI args - config file plus an optional one-shot batch submission
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "VOLLEY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the engine.
    #[arg(long)]
    pub validate: bool,

    /// Submit the requests in this JSONL file as one batch, wait for it, and exit
    #[arg(long)]
    pub submit: Option<PathBuf>,

    /// Route the submitted batch to this provider instead of round robin
    #[arg(long, requires = "submit")]
    pub provider: Option<String>,

    /// Priority of the submitted batch (higher runs first)
    #[arg(long, default_value_t = 0, requires = "submit")]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub processor: ProcessorConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub providers: Vec<ProviderConfig>,
    pub log_format: LogFormat,
    /// Expose Prometheus metrics on `metrics_addr`
    pub enable_metrics: bool,
    pub metrics_addr: String,
    /// Export traces over OTLP (configured via `OTEL_*` environment variables)
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            providers: Vec::new(),
            log_format: LogFormat::Text,
            enable_metrics: false,
            metrics_addr: "0.0.0.0:9464".to_string(),
            enable_otel_export: false,
        }
    }
}

/// Worker pool and retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Ceiling on workers per provider
    pub max_concurrent: usize,
    /// Total attempts per item across all providers
    pub max_retries: u32,
    /// Attempts spent on one provider before falling back
    pub max_attempts_per_provider: u32,
    /// Base delay between attempts, multiplied by the attempt number
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Cap on rate-limit backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Rate-limit deferrals per item before trying another provider
    pub max_rate_limit_retries: u32,
    /// How long a provider counts as rate limited when it does not say
    #[serde(with = "humantime_serde")]
    pub rate_limit_cooldown: Duration,
    /// Per-call timeout, `None` to wait indefinitely
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    pub event_buffer: usize,
    /// Samples kept for the moving-average generation time
    pub metrics_window: usize,
    /// Resolved jobs older than this are dropped from memory
    #[serde(with = "humantime_serde")]
    pub job_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub housekeeping_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            max_attempts_per_provider: 2,
            retry_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_rate_limit_retries: 3,
            rate_limit_cooldown: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(600)),
            event_buffer: 10_000,
            metrics_window: 100,
            job_retention: Duration::from_secs(24 * 3600),
            housekeeping_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Memory tier ceiling; exceeding it triggers eviction
    pub max_memory_entries: usize,
    /// Extra entries removed per eviction pass, capped at a tenth of the ceiling
    pub eviction_batch: usize,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Bound on every distributed or durable tier call
    #[serde(with = "humantime_serde")]
    pub tier_timeout: Duration,
    pub disk: Option<DiskCacheConfig>,
    pub redis: Option<RedisCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_entries: 1000,
            eviction_batch: 100,
            ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            tier_timeout: Duration::from_secs(2),
            disk: None,
            redis: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiskCacheConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RedisCacheConfig {
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
}

fn default_redis_prefix() -> String {
    "img_cache:".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Samples retained in history
    pub history_size: usize,
    /// Outcomes retained per provider
    pub outcome_window: usize,
    /// Same-type alerts within this window are suppressed
    #[serde(with = "humantime_serde")]
    pub alert_dedup: Duration,
    /// Alerts older than this are purged, resolved or not
    #[serde(with = "humantime_serde")]
    pub alert_retention: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval: Duration::from_secs(30),
            history_size: 1000,
            outcome_window: 100,
            alert_dedup: Duration::from_secs(300),
            alert_retention: Duration::from_secs(24 * 3600),
            thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertThresholds {
    /// Fraction of failed items, 0.0-1.0
    pub failure_rate: f64,
    #[serde(with = "humantime_serde")]
    pub response_time: Duration,
    pub queue_depth: usize,
    /// Credit balance in dollars
    pub low_credits: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            failure_rate: 0.2,
            response_time: Duration::from_secs(30),
            queue_depth: 100,
            low_credits: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub kind: ProviderKind,
    pub requests_per_minute: u32,
    /// Worker pool size, capped by `processor.max_concurrent`
    pub max_batch_size: usize,
    /// Relative cost used to rank fallback candidates
    pub cost_per_image: f64,
    pub is_default: bool,
    pub active: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: ProviderId::from(""),
            kind: ProviderKind::default(),
            requests_per_minute: 60,
            max_batch_size: 1,
            cost_per_image: 0.02,
            is_default: false,
            active: true,
        }
    }
}

impl ProviderConfig {
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            requests_per_minute: self.requests_per_minute,
            max_batch_size: self.max_batch_size,
            cost_per_image: self.cost_per_image,
            is_default: self.is_default,
            active: self.active,
        }
    }
}

/// Which adapter backs a provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process provider with configurable latency and failures
    Simulated {
        #[serde(default, with = "humantime_serde")]
        latency: Duration,
        #[serde(default)]
        failure_rate: f64,
        #[serde(default)]
        credits: Option<f64>,
    },
    /// OpenAI-compatible images endpoint
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default = "default_openai_base_url")]
        base_url: String,
        api_key: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_openai_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Simulated {
            latency: Duration::ZERO,
            failure_rate: 0.0,
            credits: None,
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "dall-e-2".to_string()
}

fn default_openai_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Config {
    /// Load configuration from the YAML file and `VOLLEY_` environment variables, then validate.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // VOLLEY_CONFIG names the file itself
            .merge(Env::prefixed("VOLLEY_").ignore(&["config"]).split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Err(Error::InvalidRequest(format!("Config validation: {message}")));

        let p = &self.processor;
        if p.max_concurrent == 0 {
            return invalid("processor.max_concurrent must be at least 1".to_string());
        }
        if p.max_retries == 0 {
            return invalid("processor.max_retries must be at least 1".to_string());
        }
        if p.max_attempts_per_provider == 0 {
            return invalid("processor.max_attempts_per_provider must be at least 1".to_string());
        }
        if p.event_buffer == 0 || p.metrics_window == 0 {
            return invalid("processor.event_buffer and processor.metrics_window must be at least 1".to_string());
        }

        if self.cache.max_memory_entries == 0 {
            return invalid("cache.max_memory_entries must be at least 1".to_string());
        }

        let m = &self.monitor;
        if m.history_size == 0 || m.outcome_window == 0 {
            return invalid("monitor.history_size and monitor.outcome_window must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&m.thresholds.failure_rate) {
            return invalid(format!(
                "monitor.thresholds.failure_rate must be between 0 and 1, got {}",
                m.thresholds.failure_rate
            ));
        }

        let mut seen = HashSet::new();
        let mut defaults = 0;
        for provider in &self.providers {
            if provider.id.as_str().is_empty() {
                return invalid("provider id must not be empty".to_string());
            }
            if !seen.insert(provider.id.clone()) {
                return invalid(format!("duplicate provider id '{}'", provider.id));
            }
            if provider.requests_per_minute == 0 {
                return invalid(format!("provider '{}': requests_per_minute must be at least 1", provider.id));
            }
            if provider.max_batch_size == 0 {
                return invalid(format!("provider '{}': max_batch_size must be at least 1", provider.id));
            }
            if provider.cost_per_image < 0.0 {
                return invalid(format!("provider '{}': cost_per_image must not be negative", provider.id));
            }
            if let ProviderKind::Simulated { failure_rate, .. } = &provider.kind
                && !(0.0..=1.0).contains(failure_rate)
            {
                return invalid(format!("provider '{}': failure_rate must be between 0 and 1", provider.id));
            }
            if provider.is_default {
                defaults += 1;
            }
        }
        if defaults > 1 {
            return invalid("at most one provider may set is_default".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
            submit: None,
            provider: None,
            priority: 0,
        }
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml"))?;

            assert_eq!(config.processor.max_concurrent, 5);
            assert_eq!(config.processor.max_retries, 3);
            assert_eq!(config.cache.max_memory_entries, 1000);
            assert_eq!(config.cache.ttl, Duration::from_secs(86400));
            assert_eq!(config.monitor.sample_interval, Duration::from_secs(30));
            assert_eq!(config.monitor.thresholds.queue_depth, 100);
            assert!(config.providers.is_empty());

            Ok(())
        });
    }

    #[test]
    fn test_providers_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
processor:
  retry_delay: 250ms
  request_timeout: 45s
cache:
  disk:
    dir: /tmp/volley-cache
providers:
  - id: openai
    is_default: true
    requests_per_minute: 50
    max_batch_size: 4
    kind:
      type: openai
      api_key: sk-test
  - id: sandbox
    cost_per_image: 0.0
    kind:
      type: simulated
      latency: 2s
      failure_rate: 0.1
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.processor.retry_delay, Duration::from_millis(250));
            assert_eq!(config.processor.request_timeout, Some(Duration::from_secs(45)));
            assert_eq!(
                config.cache.disk.as_ref().map(|d| d.dir.clone()),
                Some(PathBuf::from("/tmp/volley-cache"))
            );
            assert_eq!(config.providers.len(), 2);

            let openai = &config.providers[0];
            assert_eq!(openai.id.as_str(), "openai");
            assert!(openai.is_default);
            assert_eq!(openai.settings().requests_per_minute, 50);
            match &openai.kind {
                ProviderKind::OpenAi {
                    base_url,
                    api_key,
                    model,
                    ..
                } => {
                    assert_eq!(base_url, "https://api.openai.com");
                    assert_eq!(api_key, "sk-test");
                    assert_eq!(model, "dall-e-2");
                }
                other => panic!("unexpected kind {other:?}"),
            }

            let sandbox = &config.providers[1];
            assert_eq!(sandbox.requests_per_minute, 60);
            assert_eq!(sandbox.max_batch_size, 1);
            assert!(sandbox.active);
            assert!(matches!(
                sandbox.kind,
                ProviderKind::Simulated { latency, .. } if latency == Duration::from_secs(2)
            ));

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
processor:
  max_concurrent: 3
"#,
            )?;
            jail.set_env("VOLLEY_PROCESSOR__MAX_CONCURRENT", "8");
            jail.set_env("VOLLEY_CACHE__TTL", "2h");
            jail.set_env("VOLLEY_ENABLE_METRICS", "true");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.processor.max_concurrent, 8);
            assert_eq!(config.cache.ttl, Duration::from_secs(7200));
            assert!(config.enable_metrics);

            Ok(())
        });
    }

    #[test]
    fn test_rejects_duplicate_provider_ids() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
providers:
  - id: a
  - id: a
"#,
            )?;

            let err = Config::load(&args("test.yaml")).unwrap_err();
            assert!(err.to_string().contains("duplicate provider id"));

            Ok(())
        });
    }

    #[test]
    fn test_rejects_zero_quota() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
providers:
  - id: a
    requests_per_minute: 0
"#,
            )?;

            let err = Config::load(&args("test.yaml")).unwrap_err();
            assert!(err.to_string().contains("requests_per_minute"));

            Ok(())
        });
    }

    #[test]
    fn test_rejects_unknown_fields() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
processor:
  max_concurency: 4
"#,
            )?;

            assert!(Config::load(&args("test.yaml")).is_err());

            Ok(())
        });
    }
}
