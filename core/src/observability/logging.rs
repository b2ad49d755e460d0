//! Structured logging setup for the `dqguard` binary.

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CRATES: [&str; 5] = [
    "dq_guard",
    "dq_guard_core",
    "dq_guard_agents",
    "dq_guard_connectors",
    "dqguard",
];

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level for this workspace's crates (`trace` .. `error`).
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, alias = "json")]
    pub json_format: bool,
    /// Include file/line info.
    #[serde(default)]
    pub include_location: bool,
    #[serde(default = "default_include_target")]
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_format: false,
            include_location: false,
            include_target: default_include_target(),
        }
    }
}

impl LoggingConfig {
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            include_location: true,
            include_target: true,
        }
    }

    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            include_location: false,
            include_target: true,
        }
    }

    fn directives(&self) -> String {
        CRATES
            .iter()
            .map(|krate| format!("{}={}", krate, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_include_target() -> bool {
    true
}

/// Installs the global subscriber, writing to stderr. `RUST_LOG` overrides
/// the configured level. Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))?;

    if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(config.include_target)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(config.include_target)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }
    Ok(())
}
