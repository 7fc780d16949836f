//! Proxy settings
//!
//! All semantic configuration keys in one place: the custom domain, the
//! tracked path segments, the TLS certificate source and ports, the health
//! window size, and the deep-link manifest files. Settings can be loaded
//! from a JSON file or assembled from CLI flags; either way `validate()`
//! runs before startup continues.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_max_health_samples() -> usize {
    10
}

fn default_https_port() -> u16 {
    8443
}

fn default_http_port() -> u16 {
    8080
}

fn default_redirect_http() -> bool {
    true
}

/// Where the TLS server certificate comes from.
///
/// Exactly one variant is active. `None` falls back to an implicitly
/// generated self-signed development certificate and is unsuitable for
/// production.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CertificateSource {
    Pem {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    Pfx {
        path: PathBuf,
        /// Name of the environment variable holding the container password.
        #[serde(default)]
        password_env: Option<String>,
    },
    #[default]
    None,
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub certificate: CertificateSource,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Answer plain-HTTP requests with a 308 redirect to the HTTPS port.
    #[serde(default = "default_redirect_http")]
    pub redirect_http: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            certificate: CertificateSource::None,
            https_port: default_https_port(),
            http_port: default_http_port(),
            redirect_http: default_redirect_http(),
        }
    }
}

/// Platform deep-link manifest files served from `/.well-known/`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeepLinkSettings {
    #[serde(default)]
    pub apple_app_site_association: Option<PathBuf>,
    #[serde(default)]
    pub android_asset_links: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// The click-tracking custom domain. Required; requests for any other
    /// host are rejected with a 404.
    pub custom_domain: String,
    /// Ordered tracked path segments; each becomes the route prefix
    /// `/<segment>`.
    #[serde(default)]
    pub tracked_paths: Vec<String>,
    /// Capacity of the upstream health sample window.
    #[serde(default = "default_max_health_samples")]
    pub max_health_samples: usize,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub deep_links: DeepLinkSettings,
    /// Dump inbound request headers at info level (noisy; debugging aid).
    #[serde(default)]
    pub log_request_headers: bool,
    /// Log subject/issuer/validity/key details for every certificate
    /// candidate during acquisition.
    #[serde(default)]
    pub verbose_certificate_log: bool,
    /// Override for the user-scoped directory used to persist key material.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Fail fast on configuration that cannot produce a working proxy.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.custom_domain.trim().is_empty() {
            return Err(ConfigurationError::MissingCustomDomain);
        }

        if self.max_health_samples == 0 {
            return Err(ConfigurationError::Invalid {
                key: "max_health_samples".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        for segment in &self.tracked_paths {
            if segment.is_empty() || segment.contains('/') {
                return Err(ConfigurationError::Invalid {
                    key: "tracked_paths".to_string(),
                    message: format!(
                        "'{segment}' is not a single path segment (no slashes, non-empty)"
                    ),
                });
            }
        }

        Ok(())
    }
}
