//! Layered configuration.
//!
//! Sources, lowest priority first:
//! 1. `config/default.toml`, embedded in the binary
//! 2. `config/local.toml` in the working directory, if present
//! 3. the file passed with `--config`
//! 4. `TETHER_<SECTION>__<KEY>` environment variables

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tether_pty::{InputValidator, RegistryConfig};

use crate::handler::{HandlerSettings, InputPolicy};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    pub max_input_bytes: usize,
    pub output_buffer_bytes: usize,
    pub idle_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub sweep_interval_secs: u64,
    pub forward_control_signals: bool,
    pub input_policy: InputPolicy,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::with_name("config/local").required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("TETHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self, ConfigError> {
        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.bind",
                message: "must not be empty".into(),
            });
        }
        let terminal = &self.terminal;
        let positive = [
            ("terminal.max_input_bytes", terminal.max_input_bytes as u64),
            ("terminal.output_buffer_bytes", terminal.output_buffer_bytes as u64),
            ("terminal.idle_timeout_secs", terminal.idle_timeout_secs),
            ("terminal.sweep_interval_secs", terminal.sweep_interval_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            output_buffer_bytes: self.terminal.output_buffer_bytes,
            idle_timeout: Duration::from_secs(self.terminal.idle_timeout_secs),
            grace_period: Duration::from_secs(self.terminal.grace_period_secs),
            sweep_interval: Duration::from_secs(self.terminal.sweep_interval_secs),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            validator: InputValidator::new(self.terminal.max_input_bytes),
            policy: self.terminal.input_policy,
            forward_control_signals: self.terminal.forward_control_signals,
        }
    }
}
