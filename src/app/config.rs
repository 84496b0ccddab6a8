use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::circuit_breaker::CircuitBreakerConfig;
use crate::models::rate_limiter::RateLimitThresholds;
use crate::models::retry::RetryPolicy;
use crate::models::use_case::{default_mappings, UseCase, UseCaseModelMapping};
use crate::platform::AppPaths;

/// `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// `Duration` as whole milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

const ENV_PREFIX: &str = "ORCHESTRATOR";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    /// Kind implied by a well-known provider name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Wire protocol; inferred from the provider name when omitted.
    pub kind: Option<ProviderKind>,
    pub enabled: bool,
    /// Never written back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub rate_limits: RateLimitThresholds,
}

impl ProviderConfig {
    pub fn kind_for(&self, name: &str) -> Option<ProviderKind> {
        self.kind.or_else(|| ProviderKind::from_name(name))
    }

    fn builtin(kind: ProviderKind, default_model: &str, rpm: u32, tpm: u32) -> Self {
        Self {
            kind: Some(kind),
            enabled: false,
            api_key: None,
            base_url: None,
            default_model: Some(default_model.to_string()),
            timeout_secs: None,
            max_retries: None,
            rate_limits: RateLimitThresholds {
                requests_per_minute: Some(rpm),
                tokens_per_minute: Some(tpm),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    /// Consecutive failures after which a provider is considered unhealthy.
    pub unhealthy_threshold: u32,
    pub retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            unhealthy_threshold: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_secs: u64,
    /// Overrides `resilience.retry.max_retries` for every provider.
    pub max_retries: Option<u32>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostTrackingConfig {
    pub enabled: bool,
    pub max_records: usize,
    pub debounce_ms: u64,
    /// Defaults to `costs.json` in the data directory.
    pub file: Option<PathBuf>,
}

impl Default for CostTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_records: 10_000,
            debounce_ms: 1_000,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLogConfig {
    pub enabled: bool,
    /// Defaults to `query_log.db` in the data directory.
    pub database: Option<PathBuf>,
    pub prompt_prefix_chars: usize,
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database: None,
            prompt_prefix_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: String,
    pub json: bool,
    /// Also write a daily rolling file into the logs directory.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json: false,
            file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Keyed by use-case name (`chat`, `code_generation`, ...).
    pub use_cases: BTreeMap<String, UseCaseModelMapping>,
    pub resilience: ResilienceConfig,
    pub request: RequestConfig,
    pub health_check: HealthCheckConfig,
    pub cost_tracking: CostTrackingConfig,
    pub query_log: QueryLogConfig,
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        // Disabled until a credential is configured
        providers.insert(
            "openai".to_string(),
            ProviderConfig::builtin(ProviderKind::OpenAi, "gpt-4o-mini", 60, 10_000),
        );
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig::builtin(ProviderKind::Anthropic, "claude-3-5-haiku-20241022", 50, 40_000),
        );
        providers.insert(
            "gemini".to_string(),
            ProviderConfig::builtin(ProviderKind::Gemini, "gemini-1.5-flash", 60, 32_000),
        );

        let use_cases = default_mappings()
            .into_iter()
            .map(|(use_case, mapping)| (use_case.as_str().to_string(), mapping))
            .collect();

        Self {
            providers,
            use_cases,
            resilience: ResilienceConfig::default(),
            request: RequestConfig::default(),
            health_check: HealthCheckConfig::default(),
            cost_tracking: CostTrackingConfig::default(),
            query_log: QueryLogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(paths: &AppPaths) -> Result<Self> {
        Self::load_from(Some(&paths.config_file()))
    }

    /// File (if present), then `ORCHESTRATOR_*` variables, then the plain
    /// provider/AI environment keys.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::load_layered(path, |key| std::env::var(key).ok())
    }

    pub fn load_layered<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from: {:?}", path);
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: OrchestratorConfig = builder.build()?.try_deserialize()?;
        config.apply_env_overrides(env)?;
        config.validate()?;

        debug!(
            "Configuration loaded with providers: {:?}",
            config.enabled_providers()
        );
        Ok(config)
    }

    /// Applies the conventional environment keys. A credential enables its
    /// provider.
    pub fn apply_env_overrides<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = [
            ("openai", ProviderKind::OpenAi, vec!["OPENAI_API_KEY"]),
            ("anthropic", ProviderKind::Anthropic, vec!["ANTHROPIC_API_KEY"]),
            ("gemini", ProviderKind::Gemini, vec!["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
        ];
        for (name, kind, keys) in credentials {
            if let Some(api_key) = keys.iter().find_map(|k| env(k)).filter(|k| !k.is_empty()) {
                let provider = self.providers.entry(name.to_string()).or_default();
                provider.kind.get_or_insert(kind);
                provider.api_key = Some(api_key);
                provider.enabled = true;
            }
        }

        for (name, provider) in self.providers.iter_mut() {
            let prefix = name.to_ascii_uppercase().replace('-', "_");
            if let Some(base_url) = env(&format!("{}_BASE_URL", prefix)) {
                provider.base_url = Some(base_url);
            }
            if let Some(model) = env(&format!("{}_DEFAULT_MODEL", prefix)) {
                provider.default_model = Some(model);
            }
        }

        if let Some(value) = env("AI_REQUEST_TIMEOUT_SECS") {
            self.request.timeout_secs = parse_env("AI_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = env("AI_MAX_RETRIES") {
            self.request.max_retries = Some(parse_env("AI_MAX_RETRIES", &value)?);
        }
        if let Some(value) = env("AI_HEALTH_CHECK_ENABLED") {
            self.health_check.enabled = parse_env("AI_HEALTH_CHECK_ENABLED", &value)?;
        }
        if let Some(value) = env("AI_HEALTH_CHECK_INTERVAL_SECS") {
            self.health_check.interval_secs = parse_env("AI_HEALTH_CHECK_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = env("AI_LOGGING_ENABLED") {
            self.logging.enabled = parse_env("AI_LOGGING_ENABLED", &value)?;
        }
        if let Some(value) = env("AI_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            if provider.kind_for(name).is_none() {
                return Err(Error::validation(format!(
                    "Provider {} has no kind and the name does not imply one",
                    name
                )));
            }
            if provider.default_model.as_deref() == Some("") {
                return Err(Error::validation(format!("Provider {} has empty default_model", name)));
            }
            if let Some(base_url) = &provider.base_url {
                let parsed = url::Url::parse(base_url).map_err(|e| {
                    Error::validation(format!("Provider {} has invalid base_url {}: {}", name, base_url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::validation(format!(
                        "Provider {} base_url must be http or https",
                        name
                    )));
                }
            }
        }

        for (name, mapping) in &self.use_cases {
            UseCase::from_str(name)?;
            mapping.candidates()?;
            if let Some(temperature) = mapping.temperature {
                if !(0.0..=2.0).contains(&temperature) {
                    return Err(Error::validation(format!(
                        "Use case {} temperature must be between 0 and 2",
                        name
                    )));
                }
            }
        }

        let resilience = &self.resilience;
        if resilience.circuit_breaker.failure_threshold == 0 {
            return Err(Error::validation("Circuit breaker failure_threshold must be at least 1"));
        }
        if resilience.unhealthy_threshold == 0 {
            return Err(Error::validation("unhealthy_threshold must be at least 1"));
        }
        if !(0.0..=1.0).contains(&resilience.retry.jitter) {
            return Err(Error::validation("Retry jitter must be between 0 and 1"));
        }
        if resilience.retry.backoff_multiplier < 1.0 {
            return Err(Error::validation("Retry backoff_multiplier must be at least 1"));
        }

        if self.request.timeout_secs == 0 {
            return Err(Error::validation("Request timeout must be positive"));
        }
        if self.health_check.enabled && self.health_check.interval_secs == 0 {
            return Err(Error::validation("Health check interval must be positive"));
        }
        if self.cost_tracking.max_records == 0 {
            return Err(Error::validation("cost_tracking.max_records must be at least 1"));
        }
        if tracing::Level::from_str(&self.logging.level).is_err() {
            return Err(Error::validation(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        self.save_to(&paths.config_file()).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.to_toml()?).await?;
        Ok(())
    }

    /// Enabled provider names, sorted.
    pub fn enabled_providers(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, provider)| provider.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request.timeout_secs)
    }

    pub fn provider_timeout(&self, name: &str) -> Duration {
        self.providers
            .get(name)
            .and_then(|p| p.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.request_timeout())
    }

    /// `resilience.retry` with the global retry override applied.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        let policy = self.resilience.retry.clone();
        match self.request.max_retries {
            Some(max_retries) => policy.with_max_retries(max_retries),
            None => policy,
        }
    }

    pub fn retry_policy_for(&self, name: &str) -> RetryPolicy {
        let policy = self.default_retry_policy();
        match self.providers.get(name).and_then(|p| p.max_retries) {
            Some(max_retries) => policy.with_max_retries(max_retries),
            None => policy,
        }
    }

    pub fn use_case_mappings(&self) -> Result<Vec<(UseCase, UseCaseModelMapping)>> {
        self.use_cases
            .iter()
            .map(|(name, mapping)| Ok((UseCase::from_str(name)?, mapping.clone())))
            .collect()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check.interval_secs)
    }

    pub fn cost_debounce(&self) -> Duration {
        Duration::from_millis(self.cost_tracking.debounce_ms)
    }

    pub fn cost_file(&self, paths: &AppPaths) -> PathBuf {
        self.cost_tracking
            .file
            .clone()
            .unwrap_or_else(|| paths.cost_records_file())
    }

    pub fn query_log_database(&self, paths: &AppPaths) -> PathBuf {
        self.query_log
            .database
            .clone()
            .unwrap_or_else(|| paths.query_log_file())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("Invalid value for {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 3);
        assert!(config.enabled_providers().is_empty());
        assert_eq!(config.use_cases.len(), UseCase::ALL.len());
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.resilience.unhealthy_threshold, 3);
        assert_eq!(config.cost_tracking.max_records, 10_000);
        assert_eq!(config.cost_debounce(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_credentials_enable_providers() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_env_overrides(env_from(&[
                ("OPENAI_API_KEY", "sk-test"),
                ("GOOGLE_API_KEY", "g-test"),
                ("OPENAI_BASE_URL", "http://localhost:8080/v1"),
                ("AI_REQUEST_TIMEOUT_SECS", "15"),
                ("AI_MAX_RETRIES", "1"),
                ("AI_LOG_LEVEL", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.enabled_providers(), vec!["gemini", "openai"]);
        assert_eq!(config.providers["openai"].api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            config.providers["openai"].base_url.as_deref(),
            Some("http://localhost:8080/v1")
        );
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.retry_policy_for("openai").max_retries, 1);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let mut config = OrchestratorConfig::default();
        let result = config.apply_env_overrides(env_from(&[("AI_REQUEST_TIMEOUT_SECS", "soon")]));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = OrchestratorConfig::default();
        config.providers.get_mut("openai").unwrap().base_url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.resilience.retry.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config
            .use_cases
            .insert("poetry".to_string(), UseCaseModelMapping::new("openai:gpt-4o", &[]));
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config
            .use_cases
            .insert("chat".to_string(), UseCaseModelMapping::new("gpt-4o", &[]));
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config
            .providers
            .insert("local".to_string(), ProviderConfig::default());
        assert!(config.validate().is_err());
        config.providers.get_mut("local").unwrap().kind = Some(ProviderKind::OpenAi);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_per_provider_retry_override() {
        let mut config = OrchestratorConfig::default();
        config.request.max_retries = Some(2);
        config.providers.get_mut("anthropic").unwrap().max_retries = Some(0);
        assert_eq!(config.retry_policy_for("openai").max_retries, 2);
        assert_eq!(config.retry_policy_for("anthropic").max_retries, 0);
        assert_eq!(config.retry_policy_for("gemini").base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_load_layered_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[providers.local]
kind = "openai"
enabled = true
base_url = "http://127.0.0.1:11434/v1"
default_model = "llama3"

[resilience]
unhealthy_threshold = 5

[resilience.retry]
max_retries = 1
base_delay = 250

[health_check]
enabled = false
"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load_layered(Some(&path), |_| None).unwrap();
        assert_eq!(config.enabled_providers(), vec!["local"]);
        assert_eq!(config.resilience.unhealthy_threshold, 5);
        assert_eq!(config.resilience.retry.max_retries, 1);
        assert_eq!(config.resilience.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.resilience.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 5);
        assert!(!config.health_check.enabled);
        assert_eq!(config.use_cases.len(), UseCase::ALL.len());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config =
            OrchestratorConfig::load_layered(Some(&dir.path().join("absent.toml")), |_| None)
                .unwrap();
        assert_eq!(config.providers.len(), 3);
    }

    #[tokio::test]
    async fn test_save_round_trip_omits_api_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = OrchestratorConfig::default();
        config
            .apply_env_overrides(env_from(&[("ANTHROPIC_API_KEY", "secret")]))
            .unwrap();
        config.save_to(&path).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret"));

        let reloaded: OrchestratorConfig = toml::from_str(&written).unwrap();
        assert!(reloaded.validate().is_ok());
        assert!(reloaded.providers["anthropic"].enabled);
        assert!(reloaded.providers["anthropic"].api_key.is_none());
        assert_eq!(reloaded.use_cases, config.use_cases);
    }
}
