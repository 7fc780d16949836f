//! ClickProxy - a TLS-terminating reverse proxy for email click-tracking
//! custom domains
//!
//! Accepts HTTPS traffic for exactly one customer-facing domain, forwards a
//! whitelisted set of path prefixes to the click-tracking upstream, rejects
//! everything else, and tracks upstream health:
//! - Certificate acquisition with a multi-strategy fallback chain
//! - Immutable host-restricted routing table with revision ids
//! - Exact host-header admission control
//! - Bounded-window upstream health tracking with a JSON probe

pub mod certificate;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod routing;

pub use certificate::{CertificateBundle, CertificateProvider, KeyPersistence};
pub use config::{CertificateSource, DeepLinkSettings, Settings, TlsSettings};
pub use error::{CertificateLoadError, ConfigurationError};
pub use health::{HealthTracker, TrackingPolicy};
pub use proxy::ProxyServer;
pub use routing::{RouteTableBuilder, RoutingTable, SharedRoutingTable};
