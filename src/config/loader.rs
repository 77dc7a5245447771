// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Configuration file discovery and loading.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AgentError, Result};

use super::AgentConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "CERT_AGENT_CONFIG";

/// Configuration file loader with discovery and precedence rules.
///
/// # Search Order
///
/// Configuration files are searched in the following order (first found wins):
///
/// 1. Explicit path (if set via `with_path()`)
/// 2. Environment variable `CERT_AGENT_CONFIG`
/// 3. `/etc/cert-agent/config.toml`
/// 4. `~/.config/cert-agent/config.toml`
/// 5. Current directory: `./cert-agent.toml`
///
/// An explicit path or environment variable that points at a missing file is
/// an error; discovery does not fall through to the standard locations.
///
/// # Example
///
/// ```no_run
/// use usg_cert_agent::config::ConfigLoader;
///
/// // Load from default locations
/// let config = ConfigLoader::new().load().unwrap();
///
/// // Load from specific path
/// let config = ConfigLoader::new()
///     .with_path("/custom/path/config.toml")
///     .load()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    expand_variables: bool,
    validate: bool,
    env_var_name: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader that expands variables and validates.
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            expand_variables: true,
            validate: true,
            env_var_name: CONFIG_ENV_VAR.to_string(),
        }
    }

    /// Use this file only.
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enable or disable variable expansion.
    ///
    /// Default: `true`
    pub fn with_expand_variables(mut self, expand: bool) -> Self {
        self.expand_variables = expand;
        self
    }

    /// Enable or disable validation after loading.
    ///
    /// Default: `true`
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Set the environment variable name for path override.
    ///
    /// Default: `CERT_AGENT_CONFIG`
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var_name = name.into();
        self
    }

    /// Find, read, expand and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if no file is found, it cannot be read,
    /// the TOML is invalid, or validation fails.
    pub fn load(&self) -> Result<AgentConfig> {
        let config_path = self.find_config_file()?;
        debug!("Loading configuration from {}", config_path.display());

        let toml_content = std::fs::read_to_string(&config_path).map_err(|e| {
            AgentError::config(format!("Failed to read {}: {e}", config_path.display()))
        })?;

        self.load_from_str(&toml_content)
    }

    /// Load configuration from a TOML string.
    pub fn load_from_str(&self, toml_content: &str) -> Result<AgentConfig> {
        let mut config = AgentConfig::from_toml(toml_content)?;

        if self.expand_variables {
            config.expand_variables()?;
        }

        if self.validate {
            config.validate()?;
        }

        Ok(config)
    }

    /// Resolve which file would be loaded.
    pub fn find_config_file(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.explicit_path {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(AgentError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        if let Ok(env_path) = std::env::var(&self.env_var_name) {
            let path = PathBuf::from(&env_path);
            if path.is_file() {
                return Ok(path);
            }
            return Err(AgentError::config(format!(
                "Configuration file from {} not found: {}",
                self.env_var_name, env_path
            )));
        }

        let search_paths = self.search_paths();
        if let Some(path) = search_paths.iter().find(|p| p.is_file()) {
            return Ok(path.clone());
        }

        Err(AgentError::config(format!(
            "No configuration file found. Searched:\n  - {}",
            search_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n  - ")
        )))
    }

    /// Standard locations, in search order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/cert-agent/config.toml")];

        if let Some(mut path) = dirs::config_dir() {
            path.push("cert-agent");
            path.push("config.toml");
            paths.push(path);
        }

        paths.push(PathBuf::from("cert-agent.toml"));
        paths
    }
}
