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

//! # usg-cert-agent
//!
//! An agent that keeps one X.509 certificate and private key pair on disk
//! valid for a dependent service.
//!
//! Every cycle the agent inspects the managed certificate, optionally checks
//! it against the issuer's CRL, looks for an operator trigger, and decides
//! whether to renew. When it renews, it enrolls over EST (RFC 7030), writes
//! the new pair atomically, and tells the dependent service to reload.
//!
//! ## Components
//!
//! - [`inspector`]: reads the certificate and its file mode
//! - [`crl`]: downloads, caches and parses the issuer's CRL
//! - [`revocation`]: turns the cached CRL into a status for one certificate
//! - [`decision`]: pure renewal decision rules
//! - [`enroll`]: CSR generation and EST enrollment
//! - [`publish`]: atomic writes of the issued material
//! - [`reload`]: dependent service notification
//! - [`trigger`]: operator force-renewal sentinel
//! - [`renewal`]: the orchestration loop tying it all together
//! - [`config`]: TOML configuration loading and validation
//!
//! ## Quick Start
//!
//! ```no_run
//! use usg_cert_agent::config::ConfigLoader;
//!
//! # async fn example() -> usg_cert_agent::Result<()> {
//! let config = ConfigLoader::new().with_path("/etc/cert-agent/config.toml").load()?;
//! let mut agent = usg_cert_agent::build_orchestrator(&config)?;
//!
//! let report = agent.run_cycle().await?;
//! println!("decision: {}", report.assessment.decision);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::sync::Arc;

pub mod config;
pub mod crl;
pub mod decision;
pub mod enroll;
pub mod error;
pub mod inspector;
pub mod logging;
pub mod publish;
pub mod reload;
pub mod renewal;
pub mod revocation;
pub mod trigger;


// Re-export main types at crate root for convenience
pub use config::{AgentConfig, ConfigLoader};
pub use decision::{CertificateState, RenewalDecision};
pub use enroll::{EstEnroller, Enroller, IssuedMaterial};
pub use error::{AgentError, Result};
pub use inspector::{CertificateInspector, ManagedCertificate};
pub use renewal::{CycleReport, RenewalEvent, RenewalEventHandler, RenewalOrchestrator};
pub use revocation::RevocationStatus;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent string for HTTP requests.
pub const USER_AGENT: &str = concat!("usg-cert-agent/", env!("CARGO_PKG_VERSION"));

/// Wire a production orchestrator from a loaded configuration.
///
/// # Errors
///
/// Returns an error if an HTTP client, a secret or the reload command
/// cannot be set up.
pub fn build_orchestrator(config: &AgentConfig) -> Result<RenewalOrchestrator> {
    let settings = config.orchestrator_settings();
    let crl_source = Arc::new(crl::HttpCrlSource::new()?);
    let enroller = Arc::new(config.est_enroller()?);
    let reloader = config.reloader()?;

    Ok(RenewalOrchestrator::new(
        settings, crl_source, enroller, reloader,
    ))
}
