//! Certificate revocation checking against a cached CRL.
//!
//! Every check first gives the [`RevocationCache`] a chance to refresh, then
//! evaluates the managed certificate against whatever CRL is on disk. A
//! failed refresh never blocks the check: the last known good cache is used.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usg_cert_agent::crl::{HttpCrlSource, RevocationCache};
//! use usg_cert_agent::inspector::CertificateInspector;
//! use usg_cert_agent::revocation::{RevocationChecker, RevocationSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RevocationCache::new(Arc::new(HttpCrlSource::new()?));
//! let mut checker = RevocationChecker::new(
//!     cache,
//!     RevocationSettings {
//!         url: "http://ca.example.com/ca.crl".to_string(),
//!         cache_path: "/var/lib/cert-agent/ca.crl".into(),
//!         max_age_hours: 24.0,
//!         timeout: Duration::from_secs(10),
//!         mismatch_warn_after: 3,
//!     },
//! );
//!
//! let cert = CertificateInspector::new("/etc/agent/cert.pem", 0o644).inspect()?;
//! let result = checker.check(&cert).await;
//!
//! if result.status.is_revoked() {
//!     println!("Certificate has been revoked!");
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crl::{RefreshOutcome, RevocationCache};
use crate::inspector::ManagedCertificate;

/// Certificate revocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationStatus {
    /// Certificate is valid (not revoked).
    Valid,

    /// Certificate has been revoked.
    Revoked,

    /// Revocation status could not be determined.
    Unknown,
}

impl RevocationStatus {
    /// Check if the certificate is revoked.
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked)
    }

    /// Check if the certificate is valid.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Check if the status is unknown.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Where the CRL lives and how fresh it must be.
#[derive(Debug, Clone, PartialEq)]
pub struct RevocationSettings {
    /// CRL distribution URL.
    pub url: String,
    /// Local cache file.
    pub cache_path: PathBuf,
    /// Maximum cache age before a refresh is attempted.
    pub max_age_hours: f64,
    /// Download timeout.
    pub timeout: Duration,
    /// Consecutive issuer mismatches before a standing warning is raised.
    /// Zero disables the warning.
    pub mismatch_warn_after: u32,
}

/// Detailed revocation check result.
#[derive(Debug, Clone, Serialize)]
pub struct RevocationCheckResult {
    /// Overall revocation status.
    pub status: RevocationStatus,

    /// What the cache refresh did this cycle.
    pub refresh: RefreshOutcome,

    /// Issuer of the cached CRL, when one was parsed.
    pub crl_issuer: Option<String>,

    /// Why the status is unknown.
    pub reason: Option<String>,

    /// Consecutive checks that ended in an issuer mismatch.
    pub mismatch_streak: u32,

    /// The mismatch streak has reached the warning threshold.
    pub standing_warning: bool,
}

/// Certificate revocation checker.
#[derive(Debug)]
pub struct RevocationChecker {
    cache: RevocationCache,
    settings: RevocationSettings,
    mismatch_streak: u32,
}

impl RevocationChecker {
    /// Create a new revocation checker.
    pub fn new(cache: RevocationCache, settings: RevocationSettings) -> Self {
        Self {
            cache,
            settings,
            mismatch_streak: 0,
        }
    }

    /// The settings this checker was built with.
    pub fn settings(&self) -> &RevocationSettings {
        &self.settings
    }

    /// Current run of consecutive issuer mismatches.
    pub fn mismatch_streak(&self) -> u32 {
        self.mismatch_streak
    }

    /// Refresh the cache if needed and check `cert` against it.
    ///
    /// Never fails; anything that prevents a conclusive answer yields
    /// [`RevocationStatus::Unknown`].
    pub async fn check(&mut self, cert: &ManagedCertificate) -> RevocationCheckResult {
        let refresh = self
            .cache
            .refresh_if_stale(
                &self.settings.url,
                &self.settings.cache_path,
                self.settings.max_age_hours,
                self.settings.timeout,
            )
            .await;

        if let Some(error) = &refresh.error {
            warn!(
                cache = %self.settings.cache_path.display(),
                "Checking revocation against last known CRL: {}", error
            );
        }

        let verdict = self.evaluate(cert);
        match verdict {
            Verdict::Mismatch { .. } => {
                self.mismatch_streak = self.mismatch_streak.saturating_add(1);
            }
            Verdict::Conclusive { .. } => self.mismatch_streak = 0,
            Verdict::Unavailable(_) => {}
        }

        let result = self.result(verdict, refresh);
        match (&result.reason, result.standing_warning) {
            (Some(reason), true) => warn!(
                streak = result.mismatch_streak,
                "Revocation status has been unknown for {} consecutive cycles: {}",
                result.mismatch_streak,
                reason
            ),
            (Some(reason), false) => info!("Revocation status unknown: {}", reason),
            (None, _) if result.status.is_revoked() => warn!(
                serial = %cert.serial,
                issuer = ?result.crl_issuer,
                "Certificate serial is listed in the CRL"
            ),
            (None, _) => debug!(serial = %cert.serial, "Certificate serial not in CRL"),
        }
        result
    }

    /// Check `cert` against the cache as it is, without downloading and
    /// without touching the mismatch streak.
    pub fn check_cached(&self, cert: &ManagedCertificate) -> RevocationCheckResult {
        let freshness =
            RevocationCache::freshness(&self.settings.cache_path, self.settings.max_age_hours);
        let verdict = self.evaluate(cert);
        let revoked_count = match &verdict {
            Verdict::Mismatch { revoked_count, .. } | Verdict::Conclusive { revoked_count, .. } => {
                Some(*revoked_count)
            }
            Verdict::Unavailable(_) => None,
        };

        self.result(
            verdict,
            RefreshOutcome {
                downloaded: false,
                updated: false,
                age_hours: freshness.age_hours,
                revoked_count,
                error: None,
            },
        )
    }

    fn evaluate(&self, cert: &ManagedCertificate) -> Verdict {
        let Some(cached) = RevocationCache::load(&self.settings.cache_path) else {
            return Verdict::Unavailable("no CRL cached".to_string());
        };
        let Some(crl) = cached.parse() else {
            return Verdict::Unavailable("cached CRL could not be parsed".to_string());
        };

        if crl.issuer != cert.issuer {
            return Verdict::Mismatch {
                reason: format!(
                    "CRL issuer '{}' does not match certificate issuer '{}'",
                    crl.issuer, cert.issuer
                ),
                issuer: crl.issuer,
                revoked_count: crl.revoked_count,
            };
        }

        let status = if crl.contains_serial(&cert.serial) {
            RevocationStatus::Revoked
        } else {
            RevocationStatus::Valid
        };

        Verdict::Conclusive {
            status,
            issuer: crl.issuer,
            revoked_count: crl.revoked_count,
        }
    }

    fn result(&self, verdict: Verdict, refresh: RefreshOutcome) -> RevocationCheckResult {
        let threshold = self.settings.mismatch_warn_after;
        let streak = self.mismatch_streak;

        let (status, crl_issuer, reason) = match verdict {
            Verdict::Unavailable(reason) => (RevocationStatus::Unknown, None, Some(reason)),
            Verdict::Mismatch { issuer, reason, .. } => {
                (RevocationStatus::Unknown, Some(issuer), Some(reason))
            }
            Verdict::Conclusive { status, issuer, .. } => (status, Some(issuer), None),
        };

        RevocationCheckResult {
            status,
            refresh,
            crl_issuer,
            reason,
            mismatch_streak: streak,
            standing_warning: status.is_unknown() && threshold > 0 && streak >= threshold,
        }
    }
}

enum Verdict {
    Unavailable(String),
    Mismatch {
        issuer: String,
        reason: String,
        revoked_count: usize,
    },
    Conclusive {
        status: RevocationStatus,
        issuer: String,
        revoked_count: usize,
    },
}
