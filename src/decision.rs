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

//! Renewal decision engine.
//!
//! [`decide`] is a pure function over a snapshot of everything the agent
//! observed in one cycle. Rules are evaluated in priority order and the
//! first match wins:
//!
//! 1. No usable certificate: [`RenewalDecision::InitialIssuanceRequired`]
//! 2. Operator forced renewal: [`RenewalDecision::ForcedRenewal`]
//! 3. Conclusively revoked: [`RenewalDecision::Revoked`]
//! 4. Lifetime threshold reached: [`RenewalDecision::ThresholdExceeded`]
//! 5. Otherwise: [`RenewalDecision::NoActionNeeded`]
//!
//! An unknown revocation status never escalates on its own.

use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

use crate::inspector::ManagedCertificate;
use crate::revocation::RevocationStatus;

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalDecision {
    /// Keep the current certificate.
    NoActionNeeded,
    /// There is no usable certificate yet.
    InitialIssuanceRequired,
    /// The configured fraction of the validity window has elapsed.
    ThresholdExceeded,
    /// The certificate's serial is on the issuer's CRL.
    Revoked,
    /// An operator requested renewal.
    ForcedRenewal,
}

impl RenewalDecision {
    /// Whether this decision calls for enrollment.
    pub fn requires_renewal(&self) -> bool {
        !matches!(self, Self::NoActionNeeded)
    }

    /// Whether enrollment should start from scratch rather than renew
    /// the existing pair.
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::InitialIssuanceRequired)
    }

    /// Stable label for logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoActionNeeded => "no_action_needed",
            Self::InitialIssuanceRequired => "initial_issuance_required",
            Self::ThresholdExceeded => "threshold_exceeded",
            Self::Revoked => "revoked",
            Self::ForcedRenewal => "forced_renewal",
        }
    }
}

impl fmt::Display for RenewalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the inspector found at the certificate path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum CertificateState {
    /// Nothing at the path.
    Absent,
    /// A file exists but could not be parsed.
    Unreadable(String),
    /// A parsed certificate.
    Present(ManagedCertificate),
}

impl CertificateState {
    /// The parsed certificate, if any.
    pub fn certificate(&self) -> Option<&ManagedCertificate> {
        match self {
            Self::Present(cert) => Some(cert),
            _ => None,
        }
    }
}

/// Snapshot the engine decides on.
#[derive(Debug, Clone)]
pub struct DecisionInput {
    /// Certificate state.
    pub certificate: CertificateState,
    /// An operator trigger is pending.
    pub force_requested: bool,
    /// Revocation status, or `None` when checking is disabled.
    pub revocation: Option<RevocationStatus>,
    /// Renewal threshold as a fraction of the validity window.
    pub threshold: f64,
    /// Evaluation time.
    pub now: SystemTime,
}

/// Evaluate the decision rules.
pub fn decide(input: &DecisionInput) -> RenewalDecision {
    let cert = match &input.certificate {
        CertificateState::Absent | CertificateState::Unreadable(_) => {
            return RenewalDecision::InitialIssuanceRequired;
        }
        CertificateState::Present(cert) => cert,
    };

    if input.force_requested {
        return RenewalDecision::ForcedRenewal;
    }

    if input.revocation == Some(RevocationStatus::Revoked) {
        return RenewalDecision::Revoked;
    }

    if cert.lifetime_elapsed_percent(input.now) >= input.threshold * 100.0 {
        return RenewalDecision::ThresholdExceeded;
    }

    RenewalDecision::NoActionNeeded
}
