//! Error taxonomy for startup failures
//!
//! Both error kinds here are fatal: they fire during the sequential startup
//! phase, before any listener socket is bound. Per-request conditions (host
//! mismatch, client cancellation, upstream failures) are handled locally in
//! the serving path and never surface through these types.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems detected before startup completes
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The click-tracking custom domain is the anchor of host admission and
    /// routing; without it the proxy would forward arbitrary hosts.
    #[error("click-tracking custom domain is required but was not set; only client requests matching this domain are routed upstream")]
    MissingCustomDomain,

    #[error("invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Fatal certificate acquisition failures (TLS-enabled deployments)
#[derive(Debug, Error)]
pub enum CertificateLoadError {
    #[error("certificate file not found: {0}")]
    CertFileNotFound(PathBuf),

    #[error("key file not found: {0}")]
    KeyFileNotFound(PathBuf),

    /// Raised when every loading strategy has been tried; carries the
    /// underlying failure message of each attempt.
    #[error("both certificate loading strategies failed; primary: {primary}; fallback: {fallback}")]
    AllStrategiesFailed { primary: String, fallback: String },

    /// Individual persistence fallbacks are non-fatal; only running out of
    /// them is.
    #[error("all key persistence fallbacks failed: {attempts}")]
    PersistenceExhausted { attempts: String },

    #[error("certificate loaded but no private key is associated")]
    MissingPrivateKey,

    #[error("private key is not usable for TLS: {0}")]
    InvalidKey(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("failed to load PFX container: {0}")]
    Pfx(String),

    #[error("failed to generate development certificate: {0}")]
    DevCertificate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
