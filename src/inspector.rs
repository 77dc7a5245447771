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

//! Certificate metadata inspection.
//!
//! Reads the managed certificate from disk (PEM or DER) and extracts the
//! identity, validity window and serial number used by the decision engine.
//!
//! # Example
//!
//! ```no_run
//! use usg_cert_agent::inspector::CertificateInspector;
//! use std::time::SystemTime;
//!
//! let inspector = CertificateInspector::new("/etc/agent/tls/cert.pem", 0o644);
//! let cert = inspector.inspect()?;
//! println!(
//!     "{} is {:.1}% through its lifetime",
//!     cert.subject,
//!     cert.lifetime_elapsed_percent(SystemTime::now())
//! );
//! # Ok::<(), usg_cert_agent::AgentError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::KeyPair;
use serde::Serialize;
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

use crate::crl::parser::serial_from_bytes;
use crate::error::{AgentError, Result};

/// Metadata of the certificate this agent manages.
///
/// Instances are snapshots: a renewal replaces the file on disk and the next
/// inspection yields a new value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedCertificate {
    /// Subject distinguished name.
    pub subject: String,
    /// Issuer distinguished name.
    pub issuer: String,
    /// Start of the validity window.
    pub not_before: SystemTime,
    /// End of the validity window.
    pub not_after: SystemTime,
    /// Serial number, normalized (lowercase hex, no separators).
    pub serial: String,
    /// Where the certificate is stored.
    pub path: PathBuf,
    /// Permission mode the file is expected to carry.
    pub required_mode: u32,
    /// Permission mode observed on disk, when the platform reports one.
    pub actual_mode: Option<u32>,
}

impl ManagedCertificate {
    /// Percentage of the validity window that has elapsed at `now`.
    ///
    /// Exceeds 100 once the certificate has expired and is negative before
    /// `not_before`. A zero-length window counts as fully elapsed.
    pub fn lifetime_elapsed_percent(&self, now: SystemTime) -> f64 {
        let total = signed_seconds(self.not_after, self.not_before);
        if total <= 0.0 {
            return 100.0;
        }
        let elapsed = signed_seconds(now, self.not_before);
        elapsed / total * 100.0
    }

    /// Whether `not_after` has passed.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.not_after
    }

    /// Time remaining until expiry, or `None` once expired.
    pub fn time_until_expiry(&self, now: SystemTime) -> Option<Duration> {
        self.not_after.duration_since(now).ok()
    }

    /// Whether the on-disk mode matches the required one.
    ///
    /// Platforms without Unix modes always match.
    pub fn mode_matches(&self) -> bool {
        self.actual_mode
            .map(|mode| mode == self.required_mode)
            .unwrap_or(true)
    }
}

/// Reads certificate metadata from a configured path.
#[derive(Debug, Clone)]
pub struct CertificateInspector {
    path: PathBuf,
    required_mode: u32,
    key_path: Option<PathBuf>,
}

impl CertificateInspector {
    /// Create an inspector for the certificate at `path`.
    pub fn new(path: impl Into<PathBuf>, required_mode: u32) -> Self {
        Self {
            path: path.into(),
            required_mode,
            key_path: None,
        }
    }

    /// Also require the private key at `key_path` to belong to the
    /// certificate. A missing or mismatched key makes the pair unreadable.
    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Path of the inspected certificate.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a file exists at the certificate path.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read and parse the certificate.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::CertificateUnreadable`] if the file is missing,
    /// does not contain a parsable X.509 certificate, or (with a key path)
    /// sits next to a private key that is not its own.
    pub fn inspect(&self) -> Result<ManagedCertificate> {
        let data = std::fs::read(&self.path)
            .map_err(|e| AgentError::certificate_unreadable(&self.path, e.to_string()))?;

        let der = certificate_der(&data)
            .ok_or_else(|| AgentError::certificate_unreadable(&self.path, "no certificate found"))?;

        let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
            AgentError::certificate_unreadable(&self.path, format!("invalid certificate: {e}"))
        })?;

        if let Some(key_path) = &self.key_path {
            let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
                AgentError::certificate_unreadable(
                    &self.path,
                    format!("cannot read private key {}: {e}", key_path.display()),
                )
            })?;
            key_matches(&cert, &key_pem)
                .map_err(|reason| AgentError::certificate_unreadable(&self.path, reason))?;
        }

        let validity = cert.validity();

        Ok(ManagedCertificate {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: asn1_to_system_time(&validity.not_before),
            not_after: asn1_to_system_time(&validity.not_after),
            serial: serial_from_bytes(cert.raw_serial()),
            path: self.path.clone(),
            required_mode: self.required_mode,
            actual_mode: file_mode(&self.path),
        })
    }
}

/// Extract DER bytes from either a PEM bundle (first `CERTIFICATE` block)
/// or raw DER input.
pub(crate) fn certificate_der(data: &[u8]) -> Option<Vec<u8>> {
    if !looks_like_pem(data) {
        return if data.is_empty() { None } else { Some(data.to_vec()) };
    }

    Pem::iter_from_buffer(data)
        .filter_map(|pem| pem.ok())
        .find(|pem| pem.label == "CERTIFICATE")
        .map(|pem| pem.contents)
}

/// Check that `key_pem` is the private half of `cert`'s public key.
pub(crate) fn key_matches(cert: &X509Certificate<'_>, key_pem: &str) -> std::result::Result<(), String> {
    let key = KeyPair::from_pem(key_pem).map_err(|e| format!("invalid private key: {e}"))?;
    let cert_key: &[u8] = &cert.public_key().subject_public_key.data;
    if key.public_key_raw() == cert_key {
        Ok(())
    } else {
        Err("private key does not match certificate".to_string())
    }
}

pub(crate) fn looks_like_pem(data: &[u8]) -> bool {
    data.windows(11).any(|w| w == b"-----BEGIN ")
}

/// Convert an ASN.1 time into a `SystemTime`, handling pre-epoch dates.
pub(crate) fn asn1_to_system_time(time: &ASN1Time) -> SystemTime {
    let ts = time.timestamp();
    if ts >= 0 {
        UNIX_EPOCH + Duration::from_secs(ts as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.unsigned_abs())
    }
}

/// `a - b` in seconds, negative when `a` precedes `b`.
pub(crate) fn signed_seconds(a: SystemTime, b: SystemTime) -> f64 {
    match a.duration_since(b) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}
