pub mod config;

pub use config::{
    CostTrackingConfig, HealthCheckConfig, LoggingConfig, OrchestratorConfig, ProviderConfig,
    ProviderKind, QueryLogConfig, RequestConfig, ResilienceConfig,
};
