use reporting::{DeliveryPolicy, EndpointGroup, Origin, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub delivery: DeliveryPolicy,
    /// Origins allowed to deliver reports. Every origin is allowed when absent.
    pub allowed_origins: Option<Vec<Origin>>,
    #[serde(default)]
    pub endpoint_groups: Vec<EndpointGroup>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.delivery.validate()?;

        if let Some(logging) = &self.logging {
            logging
                .sentry_dsn
                .parse::<sentry::types::Dsn>()
                .map_err(|e| ConfigError::InvalidSentryDsn(e.to_string()))?;
        }

        if let Some(group) = self.endpoint_groups.iter().find(|g| g.endpoints.is_empty()) {
            return Err(ConfigError::EmptyEndpointGroup(group.key.to_string()));
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid delivery policy: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid sentry dsn: {0}")]
    InvalidSentryDsn(String),
    #[error("endpoint group {0} has no endpoints")]
    EmptyEndpointGroup(String),
}
