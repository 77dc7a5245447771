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

//! End-to-end renewal cycles against a mock PKI

use std::sync::Arc;
use std::time::Duration;

use usg_cert_agent::crl::HttpCrlSource;
use usg_cert_agent::reload::NoopReloader;
use usg_cert_agent::renewal::{OrchestratorSettings, RenewalOrchestrator};
use usg_cert_agent::{AgentError, CertificateInspector, RenewalDecision, RevocationStatus};

use super::fixtures::TestCa;
use super::{
    MockPkiServer, PATH_SIMPLEENROLL, PATH_SIMPLEREENROLL, cache_path, install_pair,
    orchestrator_settings, set_age,
};

fn orchestrator(mock: &MockPkiServer, settings: OrchestratorSettings) -> RenewalOrchestrator {
    RenewalOrchestrator::new(
        settings,
        Arc::new(HttpCrlSource::new().unwrap()),
        Arc::new(usg_cert_agent::EstEnroller::new(mock.est_settings())),
        Arc::new(NoopReloader),
    )
}

fn deployed_serial(settings: &OrchestratorSettings) -> String {
    CertificateInspector::new(&settings.targets.cert_path, settings.targets.cert_mode)
        .inspect()
        .unwrap()
        .serial
}

#[tokio::test]
async fn test_initial_issuance_then_steady_state() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    mock.mock_sign(PATH_SIMPLEENROLL, &ca, &[0x51], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let settings = orchestrator_settings(dir.path());
    let mut agent = orchestrator(&mock, settings.clone());

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(
        report.assessment.decision,
        RenewalDecision::InitialIssuanceRequired
    );
    let receipt = report.published.unwrap();
    assert!(receipt.chain_written);
    assert_eq!(deployed_serial(&settings), "51");
    assert!(settings.targets.key_path.is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&settings.targets.key_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // Fresh certificate, nothing more to do
    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.assessment.decision, RenewalDecision::NoActionNeeded);
    assert!(report.published.is_none());
}

#[tokio::test]
async fn test_threshold_renewal_replaces_pair() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    mock.mock_sign(PATH_SIMPLEREENROLL, &ca, &[0x61], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let settings = orchestrator_settings(dir.path());
    let (cert, key) = ca.issue_at(&[0x60], 100, 0.82);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings.clone());
    let report = agent.run_cycle().await.unwrap();

    assert_eq!(report.assessment.decision, RenewalDecision::ThresholdExceeded);
    let elapsed = report.assessment.elapsed_percent.unwrap();
    assert!((81.0..83.0).contains(&elapsed), "elapsed {elapsed}");
    assert_eq!(deployed_serial(&settings), "61");
    assert_ne!(std::fs::read_to_string(&settings.targets.key_path).unwrap(), key);
}

#[tokio::test]
async fn test_certificate_for_another_key_is_not_published() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    // A leaf issued for some other key pair, not the posted CSR
    mock.mock_issue(PATH_SIMPLEREENROLL, &ca.issued_chain(&[0x64]), 1)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let settings = orchestrator_settings(dir.path());
    let (cert, key) = ca.issue_at(&[0x65], 100, 0.9);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings.clone());
    let err = agent.run_cycle().await.unwrap_err();

    assert!(matches!(err, AgentError::Publish(_)));
    assert_eq!(deployed_serial(&settings), "65");
    assert_eq!(std::fs::read_to_string(&settings.targets.key_path).unwrap(), key);
}

#[tokio::test]
async fn test_expired_certificate_uses_simpleenroll() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    mock.mock_sign(PATH_SIMPLEENROLL, &ca, &[0x62], 1).await;
    mock.mock_issue(PATH_SIMPLEREENROLL, "unused", 0).await;

    let dir = tempfile::tempdir().unwrap();
    let settings = orchestrator_settings(dir.path());
    let (cert, key) = ca.issue_at(&[0x63], 30, 1.1);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings.clone());
    let report = agent.run_cycle().await.unwrap();

    assert_eq!(report.assessment.decision, RenewalDecision::ThresholdExceeded);
    assert!(report.assessment.elapsed_percent.unwrap() > 100.0);
    assert_eq!(deployed_serial(&settings), "62");
}

#[tokio::test]
async fn test_revoked_certificate_is_replaced() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    mock.mock_crl(&ca.crl(&[&[0x70]]), 1).await;
    // A revoked certificate cannot authenticate a re-enrollment
    mock.mock_sign(PATH_SIMPLEENROLL, &ca, &[0x71], 1).await;
    mock.mock_issue(PATH_SIMPLEREENROLL, "unused", 0).await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = orchestrator_settings(dir.path());
    settings.revocation = Some(mock.revocation_settings(&cache_path(dir.path())));
    let (cert, key) = ca.issue_at(&[0x70], 100, 0.1);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings.clone());
    let report = agent.run_cycle().await.unwrap();

    let revocation = report.assessment.revocation.as_ref().unwrap();
    assert_eq!(revocation.status, RevocationStatus::Revoked);
    assert!(revocation.refresh.updated);
    assert_eq!(report.assessment.decision, RenewalDecision::Revoked);
    assert_eq!(deployed_serial(&settings), "71");
    assert!(cache_path(dir.path()).is_file());
}

#[tokio::test]
async fn test_crl_outage_uses_last_known_list() {
    let mock = MockPkiServer::start().await;
    mock.mock_crl_error(500).await;
    mock.mock_issue(PATH_SIMPLEREENROLL, "unused", 0).await;

    let ca = TestCa::new("Issuing CA");
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_path(dir.path());
    let previous = ca.crl(&[&[0x7f]]);
    std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
    std::fs::write(&cache, &previous).unwrap();
    set_age(&cache, Duration::from_secs(30 * 3600));

    let mut settings = orchestrator_settings(dir.path());
    settings.revocation = Some(mock.revocation_settings(&cache));
    let (cert, key) = ca.issue_at(&[0x72], 100, 0.3);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings);
    let report = agent.run_cycle().await.unwrap();

    let revocation = report.assessment.revocation.as_ref().unwrap();
    assert_eq!(revocation.status, RevocationStatus::Valid);
    assert!(revocation.refresh.error.is_some());
    assert!(!revocation.refresh.downloaded);
    assert_eq!(report.assessment.decision, RenewalDecision::NoActionNeeded);
    assert_eq!(std::fs::read(&cache).unwrap(), previous);
}

#[tokio::test]
async fn test_foreign_crl_is_inconclusive() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    let other = TestCa::new("Some Other CA");
    mock.mock_crl(&other.crl(&[&[0x73]]), 1).await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = orchestrator_settings(dir.path());
    settings.revocation = Some(mock.revocation_settings(&cache_path(dir.path())));
    let (cert, key) = ca.issue_at(&[0x73], 100, 0.3);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings);
    let report = agent.run_cycle().await.unwrap();

    let revocation = report.assessment.revocation.as_ref().unwrap();
    assert_eq!(revocation.status, RevocationStatus::Unknown);
    assert_eq!(revocation.mismatch_streak, 1);
    assert_eq!(report.assessment.decision, RenewalDecision::NoActionNeeded);
}

#[tokio::test]
async fn test_force_trigger_renews_and_is_consumed() {
    let mock = MockPkiServer::start().await;
    let ca = TestCa::new("Issuing CA");
    mock.mock_sign(PATH_SIMPLEREENROLL, &ca, &[0x41], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let settings = orchestrator_settings(dir.path());
    let (cert, key) = ca.issue_at(&[0x40], 100, 0.05);
    install_pair(&settings, &cert, &key);
    let trigger = settings.force_trigger_path.clone().unwrap();
    std::fs::write(&trigger, b"").unwrap();

    let mut agent = orchestrator(&mock, settings.clone());
    let report = agent.run_cycle().await.unwrap();

    assert_eq!(report.assessment.decision, RenewalDecision::ForcedRenewal);
    assert!(!trigger.exists());
    assert_eq!(deployed_serial(&settings), "41");

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.assessment.decision, RenewalDecision::NoActionNeeded);
}

#[tokio::test]
async fn test_pending_enrollment_leaves_files_untouched() {
    let mock = MockPkiServer::start().await;
    mock.mock_enroll_pending(90).await;

    let dir = tempfile::tempdir().unwrap();
    let settings = orchestrator_settings(dir.path());

    let mut agent = orchestrator(&mock, settings.clone());
    let err = agent.run_cycle().await.unwrap_err();

    assert!(matches!(err, AgentError::EnrollmentPending { retry_after: 90 }));
    assert!(!settings.targets.cert_path.exists());
    assert!(!settings.targets.key_path.exists());
}

#[tokio::test]
async fn test_status_assessment_does_not_act() {
    let mock = MockPkiServer::start().await;
    mock.mock_issue(PATH_SIMPLEREENROLL, "unused", 0).await;
    mock.mock_crl(b"unused", 0).await;

    let ca = TestCa::new("Issuing CA");
    let dir = tempfile::tempdir().unwrap();
    let mut settings = orchestrator_settings(dir.path());
    settings.revocation = Some(mock.revocation_settings(&cache_path(dir.path())));
    let (cert, key) = ca.issue_at(&[0x4f], 100, 0.9);
    install_pair(&settings, &cert, &key);

    let mut agent = orchestrator(&mock, settings.clone());
    let assessment = agent.assess(false).await;

    assert_eq!(assessment.decision, RenewalDecision::ThresholdExceeded);
    let revocation = assessment.revocation.unwrap();
    assert_eq!(revocation.status, RevocationStatus::Unknown);
    assert_eq!(revocation.refresh.age_hours, -1.0);
    assert_eq!(deployed_serial(&settings), "4f");
}
