//! Error types for the certificate agent.
//!
//! This module defines all error types that can occur while inspecting,
//! checking, enrolling and publishing certificates.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`AgentError`].
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration is missing, invalid or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The managed certificate is missing or could not be parsed.
    #[error("Certificate unreadable at {}: {reason}", path.display())]
    CertificateUnreadable {
        /// Path of the certificate file.
        path: PathBuf,
        /// Why the certificate could not be read.
        reason: String,
    },

    /// CRL download failed.
    #[error("CRL fetch failed: {0}")]
    CrlFetch(String),

    /// CRL download timed out.
    #[error("CRL fetch timed out after {0} seconds")]
    CrlTimeout(u64),

    /// CRL body exceeds the configured size limit.
    #[error("CRL too large: {0} bytes (limit {1} bytes)")]
    CrlTooLarge(usize, usize),

    /// URL is malformed or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Enrollment collaborator failed to produce new material.
    #[error("Enrollment error: {0}")]
    Enrollment(String),

    /// Enrollment server returned an error response.
    #[error("Server error {status}: {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Error message from server.
        message: String,
    },

    /// Enrollment request is pending manual approval (HTTP 202).
    #[error("Enrollment pending, retry after {retry_after} seconds")]
    EnrollmentPending {
        /// Number of seconds to wait before retrying.
        retry_after: u64,
    },

    /// Failed to parse CMS/PKCS#7 structure.
    #[error("CMS/PKCS#7 parsing error: {0}")]
    CmsParsing(String),

    /// Failed to generate a key pair or CSR.
    #[error("CSR error: {0}")]
    Csr(String),

    /// Writing certificate material to disk failed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Service reload notification failed.
    #[error("Reload error: {0}")]
    Reload(String),

    /// HTTP request or response error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a certificate unreadable error.
    pub fn certificate_unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CertificateUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a CRL fetch error with the given message.
    pub fn crl_fetch(msg: impl Into<String>) -> Self {
        Self::CrlFetch(msg.into())
    }

    /// Create an invalid URL error.
    pub fn invalid_url(msg: impl Into<String>) -> Self {
        Self::InvalidUrl(msg.into())
    }

    /// Create an enrollment error with the given message.
    pub fn enrollment(msg: impl Into<String>) -> Self {
        Self::Enrollment(msg.into())
    }

    /// Create a server error with status and message.
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Create an enrollment pending error.
    pub fn enrollment_pending(retry_after: u64) -> Self {
        Self::EnrollmentPending { retry_after }
    }

    /// Create a CMS parsing error with the given message.
    pub fn cms_parsing(msg: impl Into<String>) -> Self {
        Self::CmsParsing(msg.into())
    }

    /// Create a CSR error with the given message.
    pub fn csr(msg: impl Into<String>) -> Self {
        Self::Csr(msg.into())
    }

    /// Create a publish error with the given message.
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a reload error with the given message.
    pub fn reload(msg: impl Into<String>) -> Self {
        Self::Reload(msg.into())
    }

    /// Returns true if the failure is expected to clear up on its own
    /// (network trouble, pending approval).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CrlFetch(_)
                | Self::CrlTimeout(_)
                | Self::Http(_)
                | Self::EnrollmentPending { .. }
        ) || matches!(self, Self::ServerError { status, .. } if *status >= 500)
    }

    /// Returns the retry-after value if this is an EnrollmentPending error.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::EnrollmentPending { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
