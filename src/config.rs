//! Environment-driven configuration. Each component owns a typed settings
//! struct with a `from_env()` constructor that falls back to documented
//! defaults; invalid values are logged and defaulted rather than panicking
//! (mirrors `TenantRewriteSettings::from_env`, `ValidatorConfig::from_env`).

use crate::execution::ExecutionEngineConfig;
use crate::sql::tenant_rewriter::TenantRewriteSettings;
use crate::sql::validator::ValidatorConfig;

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            _ => {
                tracing::warn!(key, value = %v, "invalid boolean env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "invalid env value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Telemetry exporter configuration (`OTEL_*`).
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub otlp_protocol: String,
    pub service_name: String,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            otlp_protocol: env_string("OTEL_EXPORTER_OTLP_PROTOCOL", "grpc"),
            service_name: env_string("OTEL_SERVICE_NAME", "text2sql-core"),
        }
    }
}

/// Workflow orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_correction_rounds: u32,
    pub max_clarify_rounds: u32,
    pub persistence_fail_open: bool,
    pub legacy_tool_shim_enabled: bool,
    pub schema_drift_hints_enabled: bool,
    pub schema_drift_auto_refresh: bool,
    pub environment: String,
    pub deployment: String,
    pub llm_model: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_correction_rounds: crate::state::MAX_CORRECTION_ROUNDS,
            max_clarify_rounds: crate::state::MAX_CLARIFY_ROUNDS,
            persistence_fail_open: false,
            legacy_tool_shim_enabled: false,
            schema_drift_hints_enabled: true,
            schema_drift_auto_refresh: false,
            environment: "development".to_string(),
            deployment: "local".to_string(),
            llm_model: "default".to_string(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_correction_rounds: default.max_correction_rounds,
            max_clarify_rounds: default.max_clarify_rounds,
            persistence_fail_open: env_bool("PERSISTENCE_FAIL_OPEN", default.persistence_fail_open),
            legacy_tool_shim_enabled: env_bool(
                "AGENT_ENABLE_LEGACY_TOOL_SHIM",
                default.legacy_tool_shim_enabled,
            ),
            schema_drift_hints_enabled: env_bool(
                "AGENT_SCHEMA_DRIFT_HINTS",
                default.schema_drift_hints_enabled,
            ),
            schema_drift_auto_refresh: env_bool(
                "AGENT_SCHEMA_DRIFT_AUTO_REFRESH",
                default.schema_drift_auto_refresh,
            ),
            environment: env_string("ENVIRONMENT", &default.environment),
            deployment: env_string("DEPLOYMENT", &default.deployment),
            llm_model: env_string("LLM_MODEL", &default.llm_model),
        }
    }
}

/// Query-target backend selection and its capability hints.
#[derive(Debug, Clone)]
pub struct QueryTargetConfig {
    pub provider: String,
    pub topology: String,
    pub disallow_federated_offset: bool,
}

impl Default for QueryTargetConfig {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            topology: "single".to_string(),
            disallow_federated_offset: true,
        }
    }
}

impl QueryTargetConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let provider = std::env::var("QUERY_TARGET_PROVIDER")
            .or_else(|_| std::env::var("QUERY_TARGET_BACKEND"))
            .unwrap_or(default.provider);
        Self {
            provider,
            topology: default.topology,
            disallow_federated_offset: env_bool(
                "PAGINATION_DISALLOW_FEDERATED_OFFSET",
                default.disallow_federated_offset,
            ),
        }
    }
}

/// Aggregates every component's settings, constructed once at process
/// start-up via [`AppConfig::from_env`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub validator: ValidatorConfigSummary,
    pub tenant_rewrite: TenantRewriteSettings,
    pub execution: ExecutionEngineConfig,
    pub orchestrator: OrchestratorSettings,
    pub telemetry: TelemetryConfig,
    pub query_target: QueryTargetConfig,
}

/// `ValidatorConfig` itself is not `Clone` (it wraps owned `HashSet`s built
/// from env lists); `AppConfig` carries a lightweight summary so the
/// aggregate stays cheap to clone, while `validator()` rebuilds the real
/// config on demand from the same environment.
#[derive(Debug, Clone, Default)]
pub struct ValidatorConfigSummary {
    pub max_join_complexity: usize,
    pub block_sensitive_columns: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let validator = ValidatorConfig::from_env();
        Self {
            validator: ValidatorConfigSummary {
                max_join_complexity: validator.max_join_complexity,
                block_sensitive_columns: validator.block_sensitive_columns,
            },
            tenant_rewrite: TenantRewriteSettings::from_env(),
            execution: ExecutionEngineConfig::from_env(),
            orchestrator: OrchestratorSettings::from_env(),
            telemetry: TelemetryConfig::from_env(),
            query_target: QueryTargetConfig::from_env(),
        }
    }

    pub fn validator(&self) -> ValidatorConfig {
        ValidatorConfig::from_env()
    }
}

pub(crate) use env_bool as config_env_bool;
pub(crate) use env_parse as config_env_parse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_falls_back_on_invalid_value() {
        std::env::set_var("TEXT2SQL_TEST_BOOL", "not-a-bool");
        assert!(env_bool("TEXT2SQL_TEST_BOOL", true));
        std::env::remove_var("TEXT2SQL_TEST_BOOL");
    }

    #[test]
    fn app_config_builds_from_defaults() {
        let config = AppConfig::from_env();
        assert_eq!(config.orchestrator.max_correction_rounds, 3);
    }
}
