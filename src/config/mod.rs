// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Agent configuration.
//!
//! The agent is configured from a single TOML file. Everything is read and
//! validated once at startup and then handed to the runtime as immutable
//! settings.
//!
//! # Example
//!
//! ```toml
//! [identity]
//! common_name = "${HOSTNAME}"
//! dns_names = ["${HOSTNAME}"]
//!
//! [storage]
//! cert_path = "/etc/edge-agent/tls/cert.pem"
//! key_path = "/etc/edge-agent/tls/key.pem"
//!
//! [renewal]
//! threshold = 0.75
//! check_interval_seconds = 60
//! force_trigger_path = "/run/cert-agent/force-renew"
//!
//! [crl]
//! enabled = true
//! url = "http://pki.example.com/issuing-ca.crl"
//! cache_path = "/var/lib/cert-agent/issuing-ca.crl"
//! max_age_hours = 24
//!
//! [enrollment]
//! server_url = "https://est.example.com"
//! username = "${HOSTNAME}"
//! password_source = "env:CERT_AGENT_EST_PASSWORD"
//!
//! [reload]
//! command = ["systemctl", "reload", "edge-agent"]
//! ```

mod expand;
mod loader;

pub use expand::{expand_variables, has_unexpanded};
pub use loader::{CONFIG_ENV_VAR, ConfigLoader};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::enroll::{EstEnroller, EstSettings, SubjectIdentity};
use crate::error::{AgentError, Result};
use crate::publish::{DEFAULT_CERT_MODE, DEFAULT_KEY_MODE, PublishTargets};
use crate::reload::{CommandReloader, NoopReloader, ReloadNotifier};
use crate::renewal::OrchestratorSettings;
use crate::revocation::RevocationSettings;

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Certificate subject.
    pub identity: IdentityConfig,

    /// Where material is stored.
    pub storage: StorageConfig,

    /// Renewal policy and loop timing.
    #[serde(default)]
    pub renewal: RenewalConfig,

    /// CRL checking.
    #[serde(default)]
    pub crl: CrlConfig,

    /// Enrollment server.
    pub enrollment: EnrollmentConfig,

    /// Dependent service reload.
    #[serde(default)]
    pub reload: ReloadConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or missing required fields.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| AgentError::config(format!("Invalid TOML: {e}")))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AgentError::config(format!("TOML serialize: {e}")))
    }

    /// Expand all variable references in the configuration.
    pub fn expand_variables(&mut self) -> Result<()> {
        self.identity.common_name = expand_variables(&self.identity.common_name)?;
        if let Some(ref mut org) = self.identity.organization {
            *org = expand_variables(org)?;
        }
        self.identity.dns_names = self
            .identity
            .dns_names
            .iter()
            .map(|s| expand_variables(s))
            .collect::<Result<Vec<_>>>()?;

        expand_path(&mut self.storage.cert_path)?;
        expand_path(&mut self.storage.key_path)?;
        if let Some(ref mut path) = self.storage.chain_path {
            expand_path(path)?;
        }

        if let Some(ref mut path) = self.renewal.force_trigger_path {
            expand_path(path)?;
        }

        if let Some(ref mut url) = self.crl.url {
            *url = expand_variables(url)?;
        }
        if let Some(ref mut path) = self.crl.cache_path {
            expand_path(path)?;
        }

        self.enrollment.server_url = expand_variables(&self.enrollment.server_url)?;
        if let Some(ref mut label) = self.enrollment.ca_label {
            *label = expand_variables(label)?;
        }
        if let Some(ref mut username) = self.enrollment.username {
            *username = expand_variables(username)?;
        }
        if let Some(ref mut path) = self.enrollment.ca_bundle_path {
            expand_path(path)?;
        }

        self.reload.command = self
            .reload
            .command
            .iter()
            .map(|s| expand_variables(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(())
    }

    /// Validate the configuration for completeness and consistency.
    ///
    /// Every problem is reported, not just the first.
    ///
    /// # Errors
    ///
    /// Returns an error describing any validation failures.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        // Identity
        if self.identity.common_name.trim().is_empty() {
            errors.push("identity.common_name is required".to_string());
        } else if has_unexpanded(&self.identity.common_name) {
            errors.push(format!(
                "identity.common_name has an undefined variable: {}",
                self.identity.common_name
            ));
        }

        // Storage
        if self.storage.cert_path.as_os_str().is_empty() {
            errors.push("storage.cert_path is required".to_string());
        }
        if self.storage.key_path.as_os_str().is_empty() {
            errors.push("storage.key_path is required".to_string());
        }
        if self.storage.cert_path == self.storage.key_path {
            errors.push("storage.cert_path and storage.key_path must differ".to_string());
        }
        for (name, mode) in [
            ("storage.cert_mode", self.storage.cert_mode),
            ("storage.key_mode", self.storage.key_mode),
        ] {
            if mode > 0o777 {
                errors.push(format!("{name} must be a permission mode (0o000-0o777)"));
            }
        }

        // Renewal
        if !(self.renewal.threshold > 0.0 && self.renewal.threshold <= 1.0) {
            errors.push("renewal.threshold must be in (0, 1]".to_string());
        }
        if self.renewal.check_interval_seconds == 0 {
            errors.push("renewal.check_interval_seconds must be > 0".to_string());
        }
        if self.renewal.error_backoff_seconds == 0 {
            errors.push("renewal.error_backoff_seconds must be > 0".to_string());
        } else if self.renewal.error_backoff_seconds >= self.renewal.check_interval_seconds {
            errors.push(
                "renewal.error_backoff_seconds must be shorter than renewal.check_interval_seconds"
                    .to_string(),
            );
        }

        // CRL
        if self.crl.enabled {
            match self.crl.url.as_deref() {
                None | Some("") => {
                    errors.push("crl.url is required when crl.enabled is true".to_string())
                }
                Some(url) => match Url::parse(url) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                    Ok(parsed) => errors.push(format!(
                        "crl.url must use http or https, not '{}'",
                        parsed.scheme()
                    )),
                    Err(e) => errors.push(format!("crl.url is invalid: {e}")),
                },
            }
            if self.crl.cache_path.is_none() {
                errors.push("crl.cache_path is required when crl.enabled is true".to_string());
            }
            if !(self.crl.max_age_hours > 0.0) {
                errors.push("crl.max_age_hours must be > 0".to_string());
            }
            if self.crl.timeout_seconds == 0 {
                errors.push("crl.timeout_seconds must be > 0".to_string());
            }
        }

        // Enrollment
        if self.enrollment.server_url.is_empty() {
            errors.push("enrollment.server_url is required".to_string());
        } else {
            match Url::parse(&self.enrollment.server_url) {
                Ok(url) if url.scheme() == "https" => {}
                Ok(url) if url.scheme() == "http" && self.enrollment.allow_insecure_http => {}
                Ok(_) => errors.push("enrollment.server_url must use HTTPS".to_string()),
                Err(e) => errors.push(format!("enrollment.server_url is invalid: {e}")),
            }
        }
        match (
            &self.enrollment.username,
            &self.enrollment.password_source,
        ) {
            (Some(_), None) => errors.push(
                "enrollment.password_source is required when enrollment.username is set"
                    .to_string(),
            ),
            (None, Some(_)) => errors.push(
                "enrollment.username is required when enrollment.password_source is set"
                    .to_string(),
            ),
            _ => {}
        }
        if let Some(ref source) = self.enrollment.password_source {
            if !(source.starts_with("env:") || source.starts_with("file:")) {
                errors.push(format!(
                    "enrollment.password_source must be 'env:VAR' or 'file:/path', got '{source}'"
                ));
            }
        }
        if self.enrollment.timeout_seconds == 0 {
            errors.push("enrollment.timeout_seconds must be > 0".to_string());
        }

        // Reload
        if !self.reload.command.is_empty() && self.reload.timeout_seconds == 0 {
            errors.push("reload.timeout_seconds must be > 0".to_string());
        }

        // Logging
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not valid", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Immutable runtime settings for the orchestrator.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            identity: SubjectIdentity {
                common_name: self.identity.common_name.clone(),
                organization: self.identity.organization.clone(),
                dns_names: self.identity.dns_names.clone(),
            },
            targets: PublishTargets {
                cert_path: self.storage.cert_path.clone(),
                key_path: self.storage.key_path.clone(),
                chain_path: self.storage.chain_path.clone(),
                cert_mode: self.storage.cert_mode,
                key_mode: self.storage.key_mode,
            },
            threshold: self.renewal.threshold,
            check_interval: Duration::from_secs(self.renewal.check_interval_seconds),
            error_backoff: Duration::from_secs(self.renewal.error_backoff_seconds),
            force_trigger_path: self.renewal.force_trigger_path.clone(),
            revocation: self.revocation_settings(),
        }
    }

    /// CRL settings, `None` when CRL checking is disabled or incomplete.
    pub fn revocation_settings(&self) -> Option<RevocationSettings> {
        if !self.crl.enabled {
            return None;
        }
        Some(RevocationSettings {
            url: self.crl.url.clone()?,
            cache_path: self.crl.cache_path.clone()?,
            max_age_hours: self.crl.max_age_hours,
            timeout: Duration::from_secs(self.crl.timeout_seconds),
            mismatch_warn_after: self.crl.mismatch_warn_after,
        })
    }

    /// Build the EST enroller, resolving the password and CA bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or a secret or bundle cannot
    /// be read.
    pub fn est_enroller(&self) -> Result<EstEnroller> {
        let server_url = Url::parse(&self.enrollment.server_url)
            .map_err(|e| AgentError::config(format!("Invalid server URL: {e}")))?;

        let password = match self.enrollment.password_source {
            Some(ref source) => Some(resolve_password(source)?),
            None => None,
        };

        let ca_bundle_pem = match self.enrollment.ca_bundle_path {
            Some(ref path) => Some(std::fs::read(path).map_err(|e| {
                AgentError::config(format!("Failed to read {}: {e}", path.display()))
            })?),
            None => None,
        };

        Ok(EstEnroller::new(EstSettings {
            server_url,
            ca_label: self.enrollment.ca_label.clone(),
            username: self.enrollment.username.clone(),
            password,
            ca_bundle_pem,
            timeout: Duration::from_secs(self.enrollment.timeout_seconds),
        }))
    }

    /// Build the reload notifier.
    pub fn reloader(&self) -> Result<Arc<dyn ReloadNotifier>> {
        if self.reload.command.is_empty() {
            return Ok(Arc::new(NoopReloader));
        }
        Ok(Arc::new(CommandReloader::new(
            self.reload.command.clone(),
            Duration::from_secs(self.reload.timeout_seconds),
        )?))
    }
}

/// Resolve a secret from `env:VAR` or `file:/path`.
fn resolve_password(source: &str) -> Result<String> {
    if let Some(var_name) = source.strip_prefix("env:") {
        std::env::var(var_name)
            .map_err(|_| AgentError::config(format!("Environment variable {var_name} not set")))
    } else if let Some(path) = source.strip_prefix("file:") {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| AgentError::config(format!("Failed to read password file: {e}")))
    } else {
        Err(AgentError::config(format!(
            "Unknown password_source: {source}"
        )))
    }
}

fn expand_path(path: &mut PathBuf) -> Result<()> {
    let expanded = expand_variables(&path.to_string_lossy())?;
    *path = PathBuf::from(expanded);
    Ok(())
}

/// Certificate subject configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Subject common name (required).
    pub common_name: String,

    /// Subject organization.
    #[serde(default)]
    pub organization: Option<String>,

    /// DNS subject alternative names.
    #[serde(default)]
    pub dns_names: Vec<String>,
}

/// Certificate storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Certificate file (PEM).
    pub cert_path: PathBuf,

    /// Private key file (PEM).
    pub key_path: PathBuf,

    /// CA chain file (PEM).
    #[serde(default)]
    pub chain_path: Option<PathBuf>,

    /// Mode for the certificate and chain files.
    #[serde(default = "default_cert_mode")]
    pub cert_mode: u32,

    /// Mode for the key file.
    #[serde(default = "default_key_mode")]
    pub key_mode: u32,
}

fn default_cert_mode() -> u32 {
    DEFAULT_CERT_MODE
}

fn default_key_mode() -> u32 {
    DEFAULT_KEY_MODE
}

/// Renewal policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenewalConfig {
    /// Fraction of the validity window after which renewal starts.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Seconds between cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,

    /// Seconds to wait after a failed cycle.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: u64,

    /// Sentinel file that forces renewal when present.
    #[serde(default)]
    pub force_trigger_path: Option<PathBuf>,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            check_interval_seconds: default_check_interval(),
            error_backoff_seconds: default_error_backoff(),
            force_trigger_path: None,
        }
    }
}

fn default_threshold() -> f64 {
    0.75
}

fn default_check_interval() -> u64 {
    60
}

fn default_error_backoff() -> u64 {
    10
}

/// CRL checking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrlConfig {
    /// Enable revocation checking.
    #[serde(default)]
    pub enabled: bool,

    /// CRL distribution URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Local cache file.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Cache age after which a refresh is attempted.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: f64,

    /// Download timeout in seconds.
    #[serde(default = "default_crl_timeout")]
    pub timeout_seconds: u64,

    /// Consecutive issuer mismatches before a standing warning.
    #[serde(default = "default_mismatch_warn_after")]
    pub mismatch_warn_after: u32,
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            cache_path: None,
            max_age_hours: default_max_age_hours(),
            timeout_seconds: default_crl_timeout(),
            mismatch_warn_after: default_mismatch_warn_after(),
        }
    }
}

fn default_max_age_hours() -> f64 {
    24.0
}

fn default_crl_timeout() -> u64 {
    10
}

fn default_mismatch_warn_after() -> u32 {
    3
}

/// Enrollment server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentConfig {
    /// EST server URL.
    pub server_url: String,

    /// Optional CA label for multi-CA deployments.
    #[serde(default)]
    pub ca_label: Option<String>,

    /// HTTP Basic username.
    #[serde(default)]
    pub username: Option<String>,

    /// Password source: `env:VAR_NAME` or `file:/path`.
    #[serde(default)]
    pub password_source: Option<String>,

    /// PEM bundle of CAs trusted for the server connection.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    /// Request timeout in seconds.
    #[serde(default = "default_enroll_timeout")]
    pub timeout_seconds: u64,

    /// Permit a plain `http://` server URL (test deployments only).
    #[serde(default)]
    pub allow_insecure_http: bool,
}

fn default_enroll_timeout() -> u64 {
    60
}

/// Reload command configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadConfig {
    /// Command and arguments; empty for none.
    #[serde(default)]
    pub command: Vec<String>,

    /// Seconds the command may run.
    #[serde(default = "default_reload_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_seconds: default_reload_timeout(),
        }
    }
}

fn default_reload_timeout() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive: "error", "warn", "info", "debug", "trace", or a
    /// full `tracing` filter such as `usg_cert_agent=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
