use crate::observability::logging::LoggingConfig;
use crate::rule::RuleSpec;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "DQGUARD";
pub const TOKEN_ENV: &str = "DQGUARD_TOKEN";
pub const API_KEY_ENV: &str = "DQGUARD_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct DqGuardConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Without a lineage section the impact index stays empty.
    #[serde(default)]
    pub lineage: Option<LineageConfig>,
    pub outcomes: OutcomeSourceConfig,
    #[serde(default)]
    pub termination: Option<TerminationConfig>,
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Rules seeded into the store at startup.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize, // Max rules dispatched at once by evaluate_all
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_revalidate_workflows")]
    pub revalidate_workflows: bool,
    #[serde(default)]
    pub audit_path: Option<PathBuf>, // sled directory; no audit log when unset
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: default_dispatch_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            revalidate_workflows: default_revalidate_workflows(),
            audit_path: None,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_dispatch_concurrency() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_revalidate_workflows() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineageConfig {
    pub base_url: String,
    pub catalog: String,
    pub schema: String,
    pub table: String,
    #[serde(default = "default_depth")]
    pub upstream_depth: u32,
    #[serde(default = "default_depth")]
    pub downstream_depth: u32,
}

impl LineageConfig {
    /// `{catalog}.{catalog}.{schema}.{table}`, the form the lineage service
    /// keys tables by.
    pub fn table_fqn(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.catalog, self.catalog, self.schema, self.table
        )
    }
}

fn default_depth() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutcomeSourceConfig {
    Http {
        url: String,
        #[serde(default)]
        ranked: bool,
        #[serde(default)]
        table_filter: Option<String>,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        ranked: bool,
        #[serde(default)]
        table_filter: Option<String>,
    },
}

impl OutcomeSourceConfig {
    pub fn ranked(&self) -> bool {
        match self {
            Self::Http { ranked, .. } | Self::File { ranked, .. } => *ranked,
        }
    }

    pub fn table_filter(&self) -> Option<&str> {
        match self {
            Self::Http { table_filter, .. } | Self::File { table_filter, .. } => table_filter
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TerminationConfig {
    pub base_url: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_workspace() -> String {
    "public".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertSinkKind {
    #[default]
    Webhook,
    Logger,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertConfig {
    #[serde(default)]
    pub sink: AlertSinkKind,
    #[serde(default)]
    pub template: Option<String>, // Handlebars template for the alert text
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Configured keys plus `DQGUARD_API_KEY`, if set.
    pub fn resolved_api_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            let key = key.trim().to_string();
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

fn default_port() -> u16 {
    3030
}

#[derive(Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub token: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AuthConfig {
    /// `DQGUARD_TOKEN` wins over the file value.
    pub fn resolved_token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV)
            .ok()
            .or_else(|| self.token.clone())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

impl DqGuardConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("failed to load config from {}", path.display()))?;

        let config: DqGuardConfig = settings
            .try_deserialize()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        let config: DqGuardConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks only. Seed rules are validated against lineage
    /// when the engine loads them.
    pub fn validate(&self) -> Result<()> {
        if self.engine.dispatch_concurrency == 0 {
            anyhow::bail!("engine.dispatch_concurrency must be at least 1");
        }
        if self.engine.request_timeout_secs == 0 {
            anyhow::bail!("engine.request_timeout_secs must be at least 1");
        }

        if let Some(lineage) = &self.lineage {
            if lineage.base_url.trim().is_empty() {
                anyhow::bail!("lineage.base_url must not be empty");
            }
            for (field, value) in [
                ("catalog", &lineage.catalog),
                ("schema", &lineage.schema),
                ("table", &lineage.table),
            ] {
                if value.trim().is_empty() {
                    anyhow::bail!("lineage.{} must not be empty", field);
                }
            }
        }

        match &self.outcomes {
            OutcomeSourceConfig::Http { url, .. } if url.trim().is_empty() => {
                anyhow::bail!("outcomes.url must not be empty")
            }
            OutcomeSourceConfig::File { path, .. } if path.as_os_str().is_empty() => {
                anyhow::bail!("outcomes.path must not be empty")
            }
            _ => {}
        }

        let terminates = self
            .rules
            .iter()
            .any(|r| r.action == crate::rule::ActionKind::AlertAndTerminate);
        if terminates && self.termination.is_none() {
            anyhow::bail!("rules terminate workflows but no termination section is configured");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use crate::rule::ActionKind;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let yaml = r#"
outcomes:
  type: file
  path: "outcomes.json"
"#;
        let config = DqGuardConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.engine.dispatch_concurrency, 4);
        assert_eq!(config.engine.request_timeout(), Duration::from_secs(30));
        assert!(config.engine.revalidate_workflows);
        assert_eq!(config.server.port, 3030);
        assert_eq!(config.alerts.sink, AlertSinkKind::Webhook);
        assert!(config.lineage.is_none());
        assert!(!config.outcomes.ranked());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
engine:
  dispatch_concurrency: 8
  request_timeout_secs: 5
lineage:
  base_url: "https://catalog.example"
  catalog: "icebase"
  schema: "retail"
  table: "orders"
outcomes:
  type: http
  url: "https://catalog.example/checks"
  ranked: true
  table_filter: "orders"
termination:
  base_url: "https://catalog.example"
alerts:
  sink: logger
  template: "{{check_name}} is {{outcome}}"
rules:
  - check_name: "row_count_check"
    desired_outcome: "FAIL"
    action: alert_and_terminate
    workflow_name: "ingest_wf"
    webhook_target: "https://hooks.example/x"
"#;
        let config = DqGuardConfig::from_yaml_str(yaml).unwrap();
        let lineage = config.lineage.as_ref().unwrap();
        assert_eq!(lineage.table_fqn(), "icebase.icebase.retail.orders");
        assert_eq!(lineage.upstream_depth, 2);
        assert_eq!(config.outcomes.table_filter(), Some("orders"));
        assert!(config.outcomes.ranked());
        assert_eq!(config.termination.as_ref().unwrap().workspace, "public");
        assert_eq!(config.alerts.sink, AlertSinkKind::Logger);
        assert_eq!(config.rules[0].desired_outcome, Outcome::Fail);
        assert_eq!(config.rules[0].action, ActionKind::AlertAndTerminate);
    }

    #[test]
    fn test_terminating_rule_requires_termination_section() {
        let yaml = r#"
outcomes:
  type: file
  path: "outcomes.json"
rules:
  - check_name: "c"
    desired_outcome: fail
    action: alert_and_terminate
    workflow_name: "wf"
"#;
        let err = DqGuardConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("termination"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let yaml = r#"
engine:
  dispatch_concurrency: 0
outcomes:
  type: file
  path: "outcomes.json"
"#;
        assert!(DqGuardConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_auth_debug_redacts_token() {
        let auth = AuthConfig {
            token: Some("secret-token".into()),
        };
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("redacted"));
    }
}
