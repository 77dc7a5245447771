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

//! Certificate enrollment.
//!
//! The orchestrator asks an [`Enroller`] for new material and does not care
//! how it is obtained. [`EstEnroller`] is the bundled implementation: a
//! single RFC 7030 `simpleenroll` / `simplereenroll` exchange.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use usg_cert_agent::enroll::{
//!     EnrollmentKind, EnrollmentRequest, Enroller, EstEnroller, EstSettings, SubjectIdentity,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let enroller = EstEnroller::new(EstSettings {
//!     server_url: "https://est.example.com".parse()?,
//!     ca_label: None,
//!     username: Some("agent".to_string()),
//!     password: Some("secret".to_string()),
//!     ca_bundle_pem: None,
//!     timeout: Duration::from_secs(60),
//! });
//!
//! let request = EnrollmentRequest {
//!     kind: EnrollmentKind::Initial,
//!     identity: SubjectIdentity::new("edge-01.example.com"),
//!     current_cert_path: None,
//!     current_key_path: None,
//! };
//!
//! let issued = enroller.enroll(&request).await?;
//! println!("{}", issued.certificate_pem);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::pem::LineEnding;
use der::{Decode, Encode};
use rcgen::{CertificateParams, DnType, KeyPair};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;
use x509_parser::pem::Pem;

use crate::error::{AgentError, Result};
use crate::inspector::looks_like_pem;

/// RFC 7030 operation path segments.
pub mod operations {
    /// Initial enrollment.
    pub const SIMPLE_ENROLL: &str = "simpleenroll";
    /// Renewal of an existing certificate.
    pub const SIMPLE_REENROLL: &str = "simplereenroll";
}

/// Content type of a base64 PKCS#10 request body.
const CONTENT_TYPE_PKCS10: &str = "application/pkcs10";

/// Retry-After used when a pending response carries none.
const DEFAULT_RETRY_AFTER: u64 = 60;

/// Whether this is a first issuance or a renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentKind {
    /// No usable certificate exists yet.
    Initial,
    /// An existing certificate is being replaced.
    Renewal,
}

/// Subject details requested for the certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SubjectIdentity {
    /// Subject common name.
    pub common_name: String,
    /// Subject organization.
    pub organization: Option<String>,
    /// DNS subject alternative names.
    pub dns_names: Vec<String>,
}

impl SubjectIdentity {
    /// Identity with only a common name.
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }
}

/// What the orchestrator asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRequest {
    /// Initial or renewal.
    pub kind: EnrollmentKind,
    /// Subject to request.
    pub identity: SubjectIdentity,
    /// Current certificate, for renewal authentication.
    pub current_cert_path: Option<PathBuf>,
    /// Current private key, for renewal authentication.
    pub current_key_path: Option<PathBuf>,
}

/// Newly issued material, PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedMaterial {
    /// Issued certificate.
    pub certificate_pem: String,
    /// Private key matching the certificate.
    pub private_key_pem: String,
    /// Additional certificates returned by the issuer.
    pub chain_pem: Option<String>,
}

impl std::fmt::Debug for IssuedMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedMaterial")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"[REDACTED]")
            .field("chain_pem", &self.chain_pem)
            .finish()
    }
}

/// Obtains new certificate material.
#[async_trait]
pub trait Enroller: Send + Sync {
    /// Obtain a certificate and key for `request`.
    async fn enroll(&self, request: &EnrollmentRequest) -> Result<IssuedMaterial>;
}

/// EST server connection settings.
#[derive(Clone)]
pub struct EstSettings {
    /// Server base URL.
    pub server_url: Url,
    /// Optional CA label (`/.well-known/est/{label}/...`).
    pub ca_label: Option<String>,
    /// HTTP Basic username.
    pub username: Option<String>,
    /// HTTP Basic password.
    pub password: Option<String>,
    /// PEM trust anchors for the server; system roots when `None`.
    pub ca_bundle_pem: Option<Vec<u8>>,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for EstSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstSettings")
            .field("server_url", &self.server_url.as_str())
            .field("ca_label", &self.ca_label)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("ca_bundle_pem", &self.ca_bundle_pem.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl EstSettings {
    /// Build the URL for an EST operation.
    pub fn build_url(&self, operation: &str) -> Url {
        let mut url = self.server_url.clone();

        let path = if let Some(ref label) = self.ca_label {
            format!("/.well-known/est/{}/{}", label, operation)
        } else {
            format!("/.well-known/est/{}", operation)
        };

        url.set_path(&path);
        url
    }
}

/// [`Enroller`] that talks to an RFC 7030 EST server.
#[derive(Debug, Clone)]
pub struct EstEnroller {
    settings: EstSettings,
}

impl EstEnroller {
    /// Create an enroller for the given server.
    pub fn new(settings: EstSettings) -> Self {
        Self { settings }
    }

    /// Connection settings.
    pub fn settings(&self) -> &EstSettings {
        &self.settings
    }

    fn build_http_client(&self, identity_pem: Option<Vec<u8>>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.settings.timeout)
            .use_rustls_tls()
            .user_agent(crate::USER_AGENT)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);

        if let Some(ref bundle) = self.settings.ca_bundle_pem {
            let certs = reqwest::Certificate::from_pem_bundle(bundle)
                .map_err(|e| AgentError::enrollment(format!("Invalid CA bundle: {e}")))?;
            builder = builder.tls_built_in_root_certs(false);
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let Some(pem) = identity_pem {
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                AgentError::enrollment(format!("Failed to create client identity: {e}"))
            })?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| AgentError::enrollment(format!("Failed to build HTTP client: {e}")))
    }

    /// Add HTTP Basic auth header if configured.
    fn add_auth_header(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.settings.username, &self.settings.password) {
            (Some(username), Some(password)) => {
                let credentials = BASE64_STANDARD.encode(format!("{}:{}", username, password));
                request.header(AUTHORIZATION, format!("Basic {}", credentials))
            }
            _ => request,
        }
    }

    async fn post_csr(
        &self,
        client: &reqwest::Client,
        operation: &str,
        csr_der: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let url = self.settings.build_url(operation);
        debug!("POST {}", url);

        let request = client
            .post(url)
            .header(CONTENT_TYPE, CONTENT_TYPE_PKCS10)
            .body(BASE64_STANDARD.encode(csr_der));
        let response = self.add_auth_header(request).send().await?;

        if response.status() == StatusCode::ACCEPTED {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(AgentError::enrollment_pending(retry_after));
        }

        let status = response.status();
        if !status.is_success() {
            let message = if status == StatusCode::UNAUTHORIZED {
                let challenge = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown")
                    .to_string();
                format!("Authentication required: {challenge}")
            } else {
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string())
            };
            return Err(AgentError::server_error(status.as_u16(), message));
        }

        let body = response.bytes().await?;
        parse_issued_certificates(&body)
    }

    /// Read the current pair for TLS client authentication.
    fn current_identity(request: &EnrollmentRequest) -> Option<Vec<u8>> {
        let (cert_path, key_path) = match (&request.current_cert_path, &request.current_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return None,
        };

        match (std::fs::read(cert_path), std::fs::read(key_path)) {
            (Ok(mut pem), Ok(key)) => {
                pem.extend_from_slice(b"\n");
                pem.extend_from_slice(&key);
                Some(pem)
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Current certificate or key unavailable for client auth: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Enroller for EstEnroller {
    async fn enroll(&self, request: &EnrollmentRequest) -> Result<IssuedMaterial> {
        let (csr_der, key_pair) = build_csr(&request.identity)?;

        let (operation, identity) = match request.kind {
            EnrollmentKind::Initial => (operations::SIMPLE_ENROLL, None),
            EnrollmentKind::Renewal => match Self::current_identity(request) {
                Some(identity) => (operations::SIMPLE_REENROLL, Some(identity)),
                // Without the old pair the server cannot authenticate a re-enrollment.
                None => (operations::SIMPLE_ENROLL, None),
            },
        };

        info!(
            common_name = %request.identity.common_name,
            operation,
            "Requesting certificate"
        );

        let client = self.build_http_client(identity)?;
        let certs = self.post_csr(&client, operation, &csr_der).await?;

        let mut iter = certs.into_iter();
        let issued = iter
            .next()
            .ok_or_else(|| AgentError::cms_parsing("No certificate in enrollment response"))?;

        let certificate_pem = encode_certificate_pem(&issued)?;
        let chain = iter
            .map(|der| encode_certificate_pem(&der))
            .collect::<Result<Vec<_>>>()?;

        Ok(IssuedMaterial {
            certificate_pem,
            private_key_pem: key_pair.serialize_pem(),
            chain_pem: if chain.is_empty() {
                None
            } else {
                Some(chain.concat())
            },
        })
    }
}

/// Generate an ECDSA P-256 key pair and a PKCS#10 request for `identity`.
pub fn build_csr(identity: &SubjectIdentity) -> Result<(Vec<u8>, KeyPair)> {
    let mut params = CertificateParams::new(identity.dns_names.clone())
        .map_err(|e| AgentError::csr(format!("Invalid subject alternative name: {e}")))?;
    params
        .distinguished_name
        .push(DnType::CommonName, identity.common_name.as_str());
    if let Some(ref org) = identity.organization {
        params
            .distinguished_name
            .push(DnType::OrganizationName, org.as_str());
    }

    let key_pair = KeyPair::generate()
        .map_err(|e| AgentError::csr(format!("Failed to generate key pair: {e}")))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AgentError::csr(format!("Failed to serialize CSR: {e}")))?;

    Ok((csr.der().to_vec(), key_pair))
}

/// Extract DER certificates from an enrollment response body.
///
/// Accepts a base64 PKCS#7 certs-only message or a PEM certificate chain.
/// The issued certificate comes first.
pub fn parse_issued_certificates(body: &[u8]) -> Result<Vec<Vec<u8>>> {
    if looks_like_pem(body) {
        let certs: Vec<Vec<u8>> = Pem::iter_from_buffer(body)
            .filter_map(|pem| pem.ok())
            .filter(|pem| pem.label == "CERTIFICATE")
            .map(|pem| pem.contents)
            .collect();
        if certs.is_empty() {
            return Err(AgentError::cms_parsing("No certificate in PEM response"));
        }
        return Ok(certs);
    }

    let cleaned: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let der = BASE64_STANDARD
        .decode(&cleaned)
        .map_err(|e| AgentError::cms_parsing(format!("Invalid base64 body: {e}")))?;

    let content_info = ContentInfo::from_der(&der)
        .map_err(|e| AgentError::cms_parsing(format!("Failed to parse ContentInfo: {e}")))?;

    // 1.2.840.113549.1.7.2
    const SIGNED_DATA_OID: &str = "1.2.840.113549.1.7.2";
    let oid = content_info.content_type.to_string();
    if oid != SIGNED_DATA_OID {
        return Err(AgentError::cms_parsing(format!(
            "Expected SignedData OID, got {oid}"
        )));
    }

    let content = content_info
        .content
        .to_der()
        .map_err(|e| AgentError::cms_parsing(format!("Failed to encode content: {e}")))?;
    let signed_data = SignedData::from_der(&content)
        .map_err(|e| AgentError::cms_parsing(format!("Failed to parse SignedData: {e}")))?;

    let mut certs = Vec::new();
    if let Some(set) = &signed_data.certificates {
        for choice in set.0.iter() {
            let der = choice
                .to_der()
                .map_err(|e| AgentError::cms_parsing(format!("Failed to encode certificate: {e}")))?;
            match x509_cert::Certificate::from_der(&der) {
                Ok(_) => certs.push(der),
                Err(e) => warn!("Skipping non-X.509 certificate: {}", e),
            }
        }
    }

    if certs.is_empty() {
        return Err(AgentError::cms_parsing("No certificate in enrollment response"));
    }
    Ok(certs)
}

fn encode_certificate_pem(der: &[u8]) -> Result<String> {
    der::pem::encode_string("CERTIFICATE", LineEnding::LF, der)
        .map_err(|e| AgentError::cms_parsing(format!("Failed to encode certificate: {e}")))
}
