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

//! CRL parsing.
//!
//! Turns a cached CRL blob (DER or PEM) into the handful of fields the
//! revocation checker needs. Parsing never fails loudly: anything that is not
//! a well-formed CRL yields `None` and callers treat that as inconclusive.

use std::collections::HashSet;
use std::time::SystemTime;

use tracing::debug;
use x509_parser::pem::Pem;
use x509_parser::prelude::*;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::inspector::{asn1_to_system_time, looks_like_pem};

/// PEM label for CRLs (RFC 7468 Section 6).
const CRL_PEM_LABEL: &str = "X509 CRL";

/// Information extracted from a CRL.
#[derive(Debug, Clone, PartialEq)]
pub struct RevocationList {
    /// Issuer distinguished name.
    pub issuer: String,
    /// When this CRL was issued.
    pub this_update: SystemTime,
    /// When the issuer promises the next CRL. Diagnostic only.
    pub next_update: Option<SystemTime>,
    /// Revoked serial numbers, normalized.
    pub revoked_serials: HashSet<String>,
    /// Number of revocation entries in the list.
    pub revoked_count: usize,
}

impl RevocationList {
    /// Whether `serial` appears in the revoked set. The input is normalized
    /// first, so any hex spelling of the same number matches.
    pub fn contains_serial(&self, serial: &str) -> bool {
        self.revoked_serials.contains(&normalize_serial(serial))
    }
}

/// Parse a CRL blob.
///
/// Accepts DER or a PEM document with an `X509 CRL` block. Returns `None`
/// for empty, corrupted or non-CRL content.
pub fn parse_crl(data: &[u8]) -> Option<RevocationList> {
    if data.is_empty() {
        return None;
    }

    let der = if looks_like_pem(data) {
        Pem::iter_from_buffer(data)
            .filter_map(|pem| pem.ok())
            .find(|pem| pem.label == CRL_PEM_LABEL)?
            .contents
    } else {
        data.to_vec()
    };

    let (_, crl) = match CertificateRevocationList::from_der(&der) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("CRL blob did not parse: {}", e);
            return None;
        }
    };

    let mut revoked_serials = HashSet::new();
    let mut revoked_count = 0;
    for revoked in crl.iter_revoked_certificates() {
        revoked_serials.insert(serial_from_bytes(revoked.raw_serial()));
        revoked_count += 1;
    }

    Some(RevocationList {
        issuer: crl.issuer().to_string(),
        this_update: asn1_to_system_time(&crl.last_update()),
        next_update: crl.next_update().map(|t| asn1_to_system_time(&t)),
        revoked_serials,
        revoked_count,
    })
}

/// Normalize a serial number representation for comparison.
///
/// Drops separators (`:`, `-`, whitespace) and an optional `0x` prefix,
/// lowercases, and strips leading zeros so `00:0A:1B`, `0a-1b` and `A1B`
/// all compare equal.
pub fn normalize_serial(serial: &str) -> String {
    let cleaned: String = serial
        .chars()
        .filter(|c| !matches!(c, ':' | '-') && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    let digits = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    let trimmed = digits.trim_start_matches('0');

    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Render raw serial bytes as a normalized hex string.
pub(crate) fn serial_from_bytes(bytes: &[u8]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    normalize_serial(&hex)
}
