mod options;
mod schema;

pub use options::apply_router_options;
pub use schema::*;

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Check cross references and limits that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipe_pool.size == 0 {
            return Err(ConfigError::Invalid("pipe_pool.size must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        let mut services = HashSet::new();
        for service in &self.services {
            if !services.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
            for name in &service.servers {
                if !names.contains(name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}' references unknown server '{}'",
                        service.name, name
                    )));
                }
            }
            service.effective_router()?;
        }

        Ok(())
    }
}

impl ServiceConfig {
    /// Router settings with `router_options` applied and checked
    pub fn effective_router(&self) -> Result<RouterSettings, ConfigError> {
        let settings = match &self.router_options {
            Some(options) => apply_router_options(&self.router, options)?,
            None => self.router.clone(),
        };

        if settings.min_backends == 0 {
            return Err(ConfigError::Invalid(format!(
                "service '{}': min_backends must be at least 1",
                self.name
            )));
        }
        if settings.max_replicas + 1 < settings.min_backends {
            return Err(ConfigError::Invalid(format!(
                "service '{}': max_replicas ({}) cannot satisfy min_backends ({})",
                self.name, settings.max_replicas, settings.min_backends
            )));
        }

        Ok(settings)
    }
}
