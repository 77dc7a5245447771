//! Integration test utilities and helpers
//!
//! This module provides a mock PKI server (CRL distribution point and EST
//! endpoints) plus certificate and CRL fixtures generated on the fly.

#![allow(dead_code)]

mod agent_test;
mod crl_test;

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;
use usg_cert_agent::enroll::{EstSettings, SubjectIdentity};
use usg_cert_agent::publish::{DEFAULT_CERT_MODE, DEFAULT_KEY_MODE, PublishTargets};
use usg_cert_agent::renewal::OrchestratorSettings;
use usg_cert_agent::revocation::RevocationSettings;
use base64::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Content types served by the mock
pub const CONTENT_TYPE_PKIX_CRL: &str = "application/pkix-crl";
pub const CONTENT_TYPE_PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Paths served by the mock
pub const PATH_CRL: &str = "/pki/issuing-ca.crl";
pub const PATH_SIMPLEENROLL: &str = "/.well-known/est/simpleenroll";
pub const PATH_SIMPLEREENROLL: &str = "/.well-known/est/simplereenroll";

/// Mock PKI server builder for integration tests
pub struct MockPkiServer {
    server: MockServer,
}

impl MockPkiServer {
    /// Create a new mock server
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Self { server }
    }

    /// Get the base URL of the mock server
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// URL of the CRL distribution point
    pub fn crl_url(&self) -> String {
        format!("{}{}", self.server.uri(), PATH_CRL)
    }

    /// Get a reference to the inner MockServer for custom mocking
    pub fn inner(&self) -> &MockServer {
        &self.server
    }

    /// Serve a CRL, expecting exactly `times` downloads
    pub async fn mock_crl(&self, der: &[u8], times: u64) {
        Mock::given(method("GET"))
            .and(path(PATH_CRL))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(der.to_vec())
                    .insert_header("Content-Type", CONTENT_TYPE_PKIX_CRL),
            )
            .expect(times)
            .mount(&self.server)
            .await;
    }

    /// Fail CRL downloads with `status`
    pub async fn mock_crl_error(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(PATH_CRL))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Issue `chain_pem` on the given EST operation path, expecting exactly
    /// `times` requests
    pub async fn mock_issue(&self, operation_path: &str, chain_pem: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path(operation_path))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(chain_pem)
                    .insert_header("Content-Type", CONTENT_TYPE_PEM_CHAIN),
            )
            .expect(times)
            .mount(&self.server)
            .await;
    }

    /// Sign whatever CSR is posted to `operation_path` with `ca`
    pub async fn mock_sign(
        &self,
        operation_path: &str,
        ca: &fixtures::TestCa,
        serial: &[u8],
        times: u64,
    ) {
        Mock::given(method("POST"))
            .and(path(operation_path))
            .respond_with(CsrSigner {
                ca: ca.clone(),
                serial: serial.to_vec(),
            })
            .expect(times)
            .mount(&self.server)
            .await;
    }

    /// Mock a pending enrollment response (HTTP 202)
    pub async fn mock_enroll_pending(&self, retry_after: u64) {
        Mock::given(method("POST"))
            .and(path(PATH_SIMPLEENROLL))
            .respond_with(
                ResponseTemplate::new(202).insert_header("Retry-After", retry_after.to_string()),
            )
            .mount(&self.server)
            .await;
    }

    /// Mock a server error response
    pub async fn mock_server_error(&self, operation_path: &str, status: u16, message: &str) {
        Mock::given(method("POST"))
            .and(path(operation_path))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_string(message)
                    .insert_header("Content-Type", "text/plain"),
            )
            .mount(&self.server)
            .await;
    }

    /// EST settings pointing at this server
    pub fn est_settings(&self) -> EstSettings {
        EstSettings {
            server_url: Url::parse(&self.url()).unwrap(),
            ca_label: None,
            username: None,
            password: None,
            ca_bundle_pem: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// CRL settings pointing at this server
    pub fn revocation_settings(&self, cache_path: &Path) -> RevocationSettings {
        RevocationSettings {
            url: self.crl_url(),
            cache_path: cache_path.to_path_buf(),
            max_age_hours: 24.0,
            timeout: Duration::from_secs(5),
            mismatch_warn_after: 3,
        }
    }
}

/// Orchestrator settings with all files under `dir`
pub fn orchestrator_settings(dir: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        identity: SubjectIdentity {
            common_name: "edge-01.example.com".to_string(),
            organization: None,
            dns_names: vec!["edge-01.example.com".to_string()],
        },
        targets: PublishTargets {
            cert_path: dir.join("tls/cert.pem"),
            key_path: dir.join("tls/key.pem"),
            chain_path: Some(dir.join("tls/chain.pem")),
            cert_mode: DEFAULT_CERT_MODE,
            key_mode: DEFAULT_KEY_MODE,
        },
        threshold: 0.75,
        check_interval: Duration::from_secs(60),
        error_backoff: Duration::from_secs(10),
        force_trigger_path: Some(dir.join("force-renew")),
        revocation: None,
    }
}

/// Write a certificate and key as the currently deployed pair
pub fn install_pair(settings: &OrchestratorSettings, cert_pem: &str, key_pem: &str) {
    let targets = &settings.targets;
    std::fs::create_dir_all(targets.cert_path.parent().unwrap()).unwrap();
    std::fs::write(&targets.cert_path, cert_pem).unwrap();
    std::fs::write(&targets.key_path, key_pem).unwrap();
}

/// Backdate a file's modification time
pub fn set_age(path: &Path, age: Duration) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::now() - age)
        .unwrap();
}

/// Answers an enrollment by signing the posted CSR, as an EST server does
struct CsrSigner {
    ca: fixtures::TestCa,
    serial: Vec<u8>,
}

impl Respond for CsrSigner {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: String = String::from_utf8_lossy(&request.body)
            .split_whitespace()
            .collect();
        let csr_der = match BASE64_STANDARD.decode(body) {
            Ok(der) => der,
            Err(_) => return ResponseTemplate::new(400),
        };

        ResponseTemplate::new(200)
            .set_body_string(self.ca.sign_csr(&csr_der, &self.serial))
            .insert_header("Content-Type", CONTENT_TYPE_PEM_CHAIN)
    }
}

pub fn cache_path(dir: &Path) -> PathBuf {
    dir.join("cache/issuing-ca.crl")
}

/// Test fixture helpers
pub mod fixtures {
    use std::sync::Arc;

    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
        CertificateSigningRequestParams, DnType, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose,
        RevocationReason, RevokedCertParams, SerialNumber,
    };
    use time::{Duration, OffsetDateTime};

    /// A throwaway issuing CA
    #[derive(Clone)]
    pub struct TestCa {
        pub cert: Arc<Certificate>,
        pub key: Arc<KeyPair>,
    }

    impl TestCa {
        pub fn new(common_name: &str) -> Self {
            let mut params = CertificateParams::default();
            params
                .distinguished_name
                .push(DnType::CommonName, common_name);
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ];

            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            Self {
                cert: Arc::new(cert),
                key: Arc::new(key),
            }
        }

        /// Issue a leaf whose validity window is `days` long and
        /// `elapsed` of the way through; returns `(cert_pem, key_pem)`.
        pub fn issue_at(&self, serial: &[u8], days: i64, elapsed: f64) -> (String, String) {
            let window = Duration::days(days);
            let not_before = OffsetDateTime::now_utc() - window * elapsed;
            self.issue(serial, not_before, not_before + window)
        }

        pub fn issue(
            &self,
            serial: &[u8],
            not_before: OffsetDateTime,
            not_after: OffsetDateTime,
        ) -> (String, String) {
            let mut params =
                CertificateParams::new(vec!["edge-01.example.com".to_string()]).unwrap();
            params
                .distinguished_name
                .push(DnType::CommonName, "edge-01.example.com");
            params.serial_number = Some(SerialNumber::from_slice(serial));
            params.not_before = not_before;
            params.not_after = not_after;

            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
            (cert.pem(), key.serialize_pem())
        }

        /// A fresh leaf followed by the CA certificate, as an EST server
        /// would answer in PEM
        pub fn issued_chain(&self, serial: &[u8]) -> String {
            let (leaf, _) = self.issue_at(serial, 90, 0.0);
            format!("{}{}", leaf, self.cert.pem())
        }

        /// Sign a DER CSR for 90 days; returns the leaf followed by the CA
        pub fn sign_csr(&self, csr_der: &[u8], serial: &[u8]) -> String {
            let mut request = CertificateSigningRequestParams::from_der(&csr_der.into()).unwrap();
            let now = OffsetDateTime::now_utc();
            request.params.serial_number = Some(SerialNumber::from_slice(serial));
            request.params.not_before = now - Duration::minutes(1);
            request.params.not_after = now + Duration::days(90);

            let leaf = request.signed_by(&self.cert, &self.key).unwrap();
            format!("{}{}", leaf.pem(), self.cert.pem())
        }

        /// DER CRL revoking `serials`
        pub fn crl(&self, serials: &[&[u8]]) -> Vec<u8> {
            let now = OffsetDateTime::now_utc();
            let revoked_certs = serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(serial),
                    revocation_time: now - Duration::hours(2),
                    reason_code: Some(RevocationReason::Superseded),
                    invalidity_date: None,
                })
                .collect();

            CertificateRevocationListParams {
                this_update: now - Duration::hours(1),
                next_update: now + Duration::days(7),
                crl_number: SerialNumber::from(7u64),
                issuing_distribution_point: None,
                revoked_certs,
                key_identifier_method: KeyIdMethod::Sha256,
            }
            .signed_by(&self.cert, &self.key)
            .unwrap()
            .der()
            .as_ref()
            .to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let mock_server = MockPkiServer::start().await;
        assert!(mock_server.url().starts_with("http://"));
        assert!(mock_server.crl_url().ends_with(PATH_CRL));
    }

    #[test]
    fn test_fixture_crl_parses() {
        let ca = fixtures::TestCa::new("Fixture CA");
        let crl = usg_cert_agent::crl::parse_crl(&ca.crl(&[&[0x05]])).unwrap();
        assert_eq!(crl.revoked_count, 1);
        assert!(crl.contains_serial("05"));
    }
}
