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

//! Periodic certificate renewal.
//!
//! The [`RenewalOrchestrator`] owns one managed certificate. Each cycle it
//! inspects the certificate, observes the force trigger, checks revocation,
//! asks the decision engine what to do and, when renewal is due, enrolls,
//! publishes and notifies the dependent service.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usg_cert_agent::config::ConfigLoader;
//! use usg_cert_agent::crl::HttpCrlSource;
//! use usg_cert_agent::reload::NoopReloader;
//! use usg_cert_agent::renewal::RenewalOrchestrator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//! let enroller = Arc::new(config.est_enroller()?);
//!
//! let mut orchestrator = RenewalOrchestrator::new(
//!     config.orchestrator_settings(),
//!     Arc::new(HttpCrlSource::new()?),
//!     enroller,
//!     Arc::new(NoopReloader),
//! );
//!
//! let report = orchestrator.run_cycle().await?;
//! println!("decision: {}", report.assessment.decision);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::crl::{CrlSource, RevocationCache};
use crate::decision::{CertificateState, DecisionInput, RenewalDecision, decide};
use crate::enroll::{EnrollmentKind, EnrollmentRequest, Enroller, SubjectIdentity};
use crate::error::Result;
use crate::inspector::{CertificateInspector, ManagedCertificate};
use crate::publish::{PublishReceipt, PublishTargets, publish_material};
use crate::reload::ReloadNotifier;
use crate::revocation::{RevocationCheckResult, RevocationChecker, RevocationSettings};
use crate::trigger::ForceTrigger;

/// Immutable runtime settings for one managed certificate.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Subject requested on enrollment.
    pub identity: SubjectIdentity,
    /// Certificate, key and chain destinations.
    pub targets: PublishTargets,
    /// Renewal threshold as a fraction of the validity window.
    pub threshold: f64,
    /// Sleep between successful cycles.
    pub check_interval: Duration,
    /// Sleep after a failed cycle. Shorter than `check_interval`.
    pub error_backoff: Duration,
    /// Sentinel file requesting renewal.
    pub force_trigger_path: Option<PathBuf>,
    /// CRL checking, `None` when disabled.
    pub revocation: Option<RevocationSettings>,
}

/// Events that occur during a renewal cycle.
#[derive(Debug, Clone)]
pub enum RenewalEvent {
    /// A cycle started.
    CycleStarted,

    /// The decision engine produced a result.
    Decision {
        /// The decision.
        decision: RenewalDecision,
        /// Lifetime elapsed, when a certificate is present.
        elapsed_percent: Option<f64>,
    },

    /// New material was published.
    RenewalSucceeded {
        /// Why renewal happened.
        decision: RenewalDecision,
        /// Fingerprint of the new certificate.
        fingerprint: String,
    },

    /// Enrollment or publication failed.
    RenewalFailed {
        /// Why renewal was attempted.
        decision: RenewalDecision,
        /// Error that occurred.
        error: String,
    },

    /// Revocation has stayed inconclusive for too many cycles.
    RevocationInconclusive {
        /// Why the status is unknown.
        reason: String,
        /// Consecutive inconclusive cycles.
        streak: u32,
    },

    /// The reload notification failed after publication.
    ReloadFailed {
        /// Error that occurred.
        error: String,
    },
}

/// Handler for renewal events.
///
/// Implement this trait to receive notifications about renewal events.
pub trait RenewalEventHandler: Send + Sync {
    /// Handle a renewal event.
    fn handle_event(&self, event: RenewalEvent);
}

/// Everything observed in one cycle and the resulting decision.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    /// Certificate state at the start of the cycle.
    pub certificate: CertificateState,
    /// Lifetime elapsed, when a certificate is present.
    pub elapsed_percent: Option<f64>,
    /// Whether the force trigger was present.
    pub force_requested: bool,
    /// Revocation check, when enabled and a certificate is present.
    pub revocation: Option<RevocationCheckResult>,
    /// Renewal threshold in percent.
    pub threshold_percent: f64,
    /// The decision.
    pub decision: RenewalDecision,
    /// When the assessment was made.
    pub evaluated_at: SystemTime,
}

/// Result of a completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// What was observed and decided.
    pub assessment: Assessment,
    /// What was published, when renewal happened.
    pub published: Option<PublishReceipt>,
    /// Reload failure after a successful publication.
    pub reload_error: Option<String>,
}

/// Drives the renewal loop for one managed certificate.
pub struct RenewalOrchestrator {
    settings: OrchestratorSettings,
    inspector: CertificateInspector,
    revocation: Option<RevocationChecker>,
    trigger: Option<ForceTrigger>,
    enroller: Arc<dyn Enroller>,
    reloader: Arc<dyn ReloadNotifier>,
    event_handler: Option<Arc<dyn RenewalEventHandler>>,
}

impl std::fmt::Debug for RenewalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalOrchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RenewalOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        settings: OrchestratorSettings,
        crl_source: Arc<dyn CrlSource>,
        enroller: Arc<dyn Enroller>,
        reloader: Arc<dyn ReloadNotifier>,
    ) -> Self {
        let inspector = CertificateInspector::new(
            settings.targets.cert_path.clone(),
            settings.targets.cert_mode,
        )
        .with_key_path(settings.targets.key_path.clone());
        let revocation = settings
            .revocation
            .clone()
            .map(|r| RevocationChecker::new(RevocationCache::new(crl_source), r));
        let trigger = settings.force_trigger_path.clone().map(ForceTrigger::new);

        Self {
            settings,
            inspector,
            revocation,
            trigger,
            enroller,
            reloader,
            event_handler: None,
        }
    }

    /// Register a handler for renewal events.
    pub fn with_event_handler(mut self, handler: Arc<dyn RenewalEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Runtime settings.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Observe the current state and decide, without enrolling.
    ///
    /// With `refresh_crl` the CRL cache is refreshed when stale, exactly as a
    /// cycle would. Without it the cache is only read.
    pub async fn assess(&mut self, refresh_crl: bool) -> Assessment {
        let now = SystemTime::now();

        let certificate = if !self.inspector.exists() {
            CertificateState::Absent
        } else {
            match self.inspector.inspect() {
                Ok(cert) => CertificateState::Present(cert),
                Err(e) => {
                    warn!("{}", e);
                    CertificateState::Unreadable(e.to_string())
                }
            }
        };

        let force_requested = self
            .trigger
            .as_ref()
            .map(|t| t.is_requested())
            .unwrap_or(false);

        let revocation = match (certificate.certificate(), self.revocation.as_mut()) {
            (Some(cert), Some(checker)) if refresh_crl => Some(checker.check(cert).await),
            (Some(cert), Some(checker)) => Some(checker.check_cached(cert)),
            _ => None,
        };

        let elapsed_percent = certificate
            .certificate()
            .map(|c| c.lifetime_elapsed_percent(now));

        let decision = decide(&DecisionInput {
            certificate: certificate.clone(),
            force_requested,
            revocation: revocation.as_ref().map(|r| r.status),
            threshold: self.settings.threshold,
            now,
        });

        Assessment {
            certificate,
            elapsed_percent,
            force_requested,
            revocation,
            threshold_percent: self.settings.threshold * 100.0,
            decision,
            evaluated_at: now,
        }
    }

    /// Run one full cycle.
    ///
    /// # Errors
    ///
    /// Returns the enrollment or publication error that ended the cycle.
    /// A reload failure is reported in the [`CycleReport`] instead.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.emit(RenewalEvent::CycleStarted);

        let assessment = self.assess(true).await;
        let decision = assessment.decision;

        if let Some(result) = &assessment.revocation {
            if result.standing_warning {
                self.emit(RenewalEvent::RevocationInconclusive {
                    reason: result.reason.clone().unwrap_or_default(),
                    streak: result.mismatch_streak,
                });
            }
        }

        if let Some(cert) = assessment.certificate.certificate() {
            if !cert.mode_matches() {
                warn!(
                    path = %cert.path.display(),
                    required = %format!("{:o}", cert.required_mode),
                    actual = ?cert.actual_mode.map(|m| format!("{m:o}")),
                    "Certificate file permissions differ from the configured mode"
                );
            }
        }

        info!(
            decision = %decision,
            elapsed_percent = ?assessment.elapsed_percent,
            revocation = ?assessment.revocation.as_ref().map(|r| r.status),
            force_requested = assessment.force_requested,
            "Renewal decision"
        );
        self.emit(RenewalEvent::Decision {
            decision,
            elapsed_percent: assessment.elapsed_percent,
        });

        if !decision.requires_renewal() {
            return Ok(CycleReport {
                assessment,
                published: None,
                reload_error: None,
            });
        }

        let kind = enrollment_kind(
            decision,
            assessment.certificate.certificate(),
            assessment.evaluated_at,
        );
        let outcome = self.renew(decision, kind).await;

        if decision == RenewalDecision::ForcedRenewal
            || (assessment.force_requested && outcome.is_ok())
        {
            self.consume_trigger();
        }

        let receipt = match outcome {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(decision = %decision, "Renewal failed: {}", e);
                self.emit(RenewalEvent::RenewalFailed {
                    decision,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        self.emit(RenewalEvent::RenewalSucceeded {
            decision,
            fingerprint: receipt.fingerprint.clone(),
        });

        let reload_error = match self.reloader.notify().await {
            Ok(()) => None,
            Err(e) => {
                error!("Reload notification failed, new certificate is published: {}", e);
                self.emit(RenewalEvent::ReloadFailed {
                    error: e.to_string(),
                });
                Some(e.to_string())
            }
        };

        Ok(CycleReport {
            assessment,
            published: Some(receipt),
            reload_error,
        })
    }

    /// Run cycles forever.
    pub async fn run(&mut self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run cycles until `shutdown` resolves.
    ///
    /// The first cycle starts immediately. `shutdown` is only observed
    /// between cycles; a running cycle always completes.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            cert = %self.settings.targets.cert_path.display(),
            interval_secs = self.settings.check_interval.as_secs(),
            "Renewal loop starting"
        );

        loop {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    debug!(decision = %report.assessment.decision, "Cycle complete");
                    self.settings.check_interval
                }
                Err(e) => {
                    error!("Renewal cycle failed: {}", e);
                    self.backoff_for(&e)
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Renewal loop stopped");
    }

    async fn renew(&self, decision: RenewalDecision, kind: EnrollmentKind) -> Result<PublishReceipt> {
        let targets = &self.settings.targets;

        let request = EnrollmentRequest {
            kind,
            identity: self.settings.identity.clone(),
            current_cert_path: (kind == EnrollmentKind::Renewal).then(|| targets.cert_path.clone()),
            current_key_path: (kind == EnrollmentKind::Renewal).then(|| targets.key_path.clone()),
        };

        info!(decision = %decision, kind = ?kind, "Starting enrollment");
        let material = self.enroller.enroll(&request).await?;
        publish_material(targets, &material)
    }

    fn backoff_for(&self, error: &crate::error::AgentError) -> Duration {
        let backoff = self.settings.error_backoff;
        match error.retry_after() {
            Some(secs) => Duration::from_secs(secs)
                .min(self.settings.check_interval)
                .max(backoff),
            None => backoff,
        }
    }

    fn consume_trigger(&self) {
        if let Some(trigger) = &self.trigger {
            if let Err(e) = trigger.consume() {
                warn!("{}", e);
            }
        }
    }

    fn emit(&self, event: RenewalEvent) {
        if let Some(handler) = &self.event_handler {
            handler.handle_event(event);
        }
    }
}

/// Pick the EST operation for a renewal decision.
///
/// A revoked or expired certificate cannot authenticate a re-enrollment,
/// so those start over with a fresh enrollment.
pub fn enrollment_kind(
    decision: RenewalDecision,
    certificate: Option<&ManagedCertificate>,
    now: SystemTime,
) -> EnrollmentKind {
    if decision.is_initial() || decision == RenewalDecision::Revoked {
        return EnrollmentKind::Initial;
    }
    match certificate {
        Some(cert) if !cert.is_expired(now) => EnrollmentKind::Renewal,
        _ => EnrollmentKind::Initial,
    }
}
