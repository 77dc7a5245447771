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

//! Atomic publication of certificate material.
//!
//! Every file is written to a temporary sibling, given its final permission
//! mode, flushed, and renamed over the destination. Readers see either the
//! old file or the new one, never a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::enroll::IssuedMaterial;
use crate::error::{AgentError, Result};
use crate::inspector::{certificate_der, key_matches, looks_like_pem};

/// Default mode for the certificate and chain files.
pub const DEFAULT_CERT_MODE: u32 = 0o644;

/// Default mode for the private key file.
pub const DEFAULT_KEY_MODE: u32 = 0o600;

/// Where issued material is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTargets {
    /// Certificate (PEM) destination.
    pub cert_path: PathBuf,
    /// Private key (PEM) destination.
    pub key_path: PathBuf,
    /// Optional CA chain (PEM) destination.
    pub chain_path: Option<PathBuf>,
    /// Mode for the certificate and chain files.
    pub cert_mode: u32,
    /// Mode for the key file.
    pub key_mode: u32,
}

/// What was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// SHA-256 fingerprint of the new certificate, colon-separated hex.
    pub fingerprint: String,
    /// Whether a chain file was written.
    pub chain_written: bool,
}

/// Write `data` to `path` atomically with the given Unix `mode`.
///
/// The parent directory is created when missing.
pub fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let staged = stage(path, data, mode)?;
    persist(staged, path)?;
    debug!("Wrote {} ({} bytes, mode {:o})", path.display(), data.len(), mode);
    Ok(())
}

/// Write `data` to a flushed temp file next to `path`.
fn stage(path: &Path, data: &[u8], mode: u32) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    std::fs::create_dir_all(dir).map_err(|e| {
        AgentError::publish(format!("Cannot create directory {}: {e}", dir.display()))
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".cert-agent-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| {
            AgentError::publish(format!("Cannot create temp file in {}: {e}", dir.display()))
        })?;

    tmp.write_all(data)
        .map_err(|e| AgentError::publish(format!("Write to temp file failed: {e}")))?;
    set_mode(tmp.as_file(), mode)?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| AgentError::publish(format!("Flush of temp file failed: {e}")))?;

    Ok(tmp)
}

fn persist(tmp: NamedTempFile, path: &Path) -> Result<()> {
    tmp.persist(path).map_err(|e| {
        AgentError::publish(format!("Rename onto {} failed: {}", path.display(), e.error))
    })?;
    Ok(())
}

/// Check that issued material is a parsable certificate with its own key.
///
/// Returns the certificate DER.
pub fn validate_material(material: &IssuedMaterial) -> Result<Vec<u8>> {
    let pem = material.certificate_pem.as_bytes();
    if !looks_like_pem(pem) {
        return Err(AgentError::publish("Issued certificate is not PEM"));
    }
    let der = certificate_der(pem)
        .ok_or_else(|| AgentError::publish("Issued material has no PEM certificate"))?;

    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| AgentError::publish(format!("Issued certificate does not parse: {e}")))?;
    key_matches(&cert, &material.private_key_pem)
        .map_err(|reason| AgentError::publish(format!("Issued material rejected: {reason}")))?;

    Ok(der)
}

/// Publish certificate, key and optional chain.
///
/// Nothing is written unless the material validates. All files are staged
/// before any rename. The key is renamed first and the certificate second;
/// if the certificate rename fails the previous key is put back, so the
/// pair on disk always belongs together.
pub fn publish_material(targets: &PublishTargets, material: &IssuedMaterial) -> Result<PublishReceipt> {
    let der = validate_material(material)?;

    let key_tmp = stage(
        &targets.key_path,
        material.private_key_pem.as_bytes(),
        targets.key_mode,
    )?;
    let cert_tmp = stage(
        &targets.cert_path,
        material.certificate_pem.as_bytes(),
        targets.cert_mode,
    )?;
    let chain_tmp = match (&targets.chain_path, &material.chain_pem) {
        (Some(chain_path), Some(chain_pem)) => Some((
            chain_path,
            stage(chain_path, chain_pem.as_bytes(), targets.cert_mode)?,
        )),
        _ => None,
    };

    let previous_key = std::fs::read(&targets.key_path).ok();
    persist(key_tmp, &targets.key_path)?;
    if let Err(e) = persist(cert_tmp, &targets.cert_path) {
        restore_key(targets, previous_key);
        return Err(e);
    }

    let mut chain_written = false;
    if let Some((chain_path, tmp)) = chain_tmp {
        match persist(tmp, chain_path) {
            Ok(()) => chain_written = true,
            Err(e) => warn!("Certificate and key published, chain was not: {}", e),
        }
    }

    let fingerprint = format_fingerprint(&Sha256::digest(&der));
    info!(
        cert = %targets.cert_path.display(),
        key = %targets.key_path.display(),
        %fingerprint,
        "Published certificate material"
    );

    Ok(PublishReceipt {
        fingerprint,
        chain_written,
    })
}

fn restore_key(targets: &PublishTargets, previous: Option<Vec<u8>>) {
    let restored = match previous {
        Some(bytes) => write_atomic(&targets.key_path, &bytes, targets.key_mode),
        None => std::fs::remove_file(&targets.key_path).map_err(AgentError::from),
    };
    match restored {
        Ok(()) => warn!("Certificate rename failed, previous key restored"),
        Err(e) => error!(
            key = %targets.key_path.display(),
            "Certificate rename failed and the previous key could not be restored: {}", e
        ),
    }
}

/// Format a digest as colon-separated uppercase hex.
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| AgentError::publish(format!("Cannot set mode {mode:o}: {e}")))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> Result<()> {
    Ok(())
}
