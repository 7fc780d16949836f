//! ClickProxy - Main entry point
//!
//! Startup is single-threaded and strictly sequential: logging, settings
//! validation, certificate acquisition, routing table construction, and
//! only then the listeners. A failure in any step aborts before a single
//! connection is accepted.

use anyhow::{bail, Result};
use clap::Parser;
use clickproxy::{
    CertificateProvider, CertificateSource, DeepLinkSettings, HealthTracker, ProxyServer,
    RouteTableBuilder, Settings, SharedRoutingTable, TlsSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// ClickProxy - TLS-terminating reverse proxy for a click-tracking custom domain
#[derive(Parser, Debug)]
#[command(name = "clickproxy")]
#[command(version = "1.0.0")]
#[command(about = "TLS-terminating reverse proxy for email click-tracking custom domains")]
struct Args {
    /// Optional JSON settings file; flags below override its domain/paths
    #[arg(long, env = "CLICKPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// The click-tracking custom domain (required unless set in the config file)
    #[arg(long, env = "CLICKPROXY_DOMAIN")]
    domain: Option<String>,

    /// Tracked path segments, comma separated (e.g. "track-click,track-open")
    #[arg(long, env = "CLICKPROXY_PATHS", value_delimiter = ',')]
    paths: Vec<String>,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Enable the TLS listener
    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    tls: bool,

    /// Redirect plain HTTP to HTTPS (only meaningful with --tls)
    #[arg(long, env = "REDIRECT_HTTP", default_value = "true")]
    redirect_http: bool,

    /// PEM certificate file (paired with --key-file)
    #[arg(long, env = "TLS_CERT_FILE", requires = "key_file")]
    cert_file: Option<PathBuf>,

    /// PEM private key file (paired with --cert-file)
    #[arg(long, env = "TLS_KEY_FILE", requires = "cert_file")]
    key_file: Option<PathBuf>,

    /// PKCS#12 (PFX) certificate container
    #[arg(long, env = "TLS_PFX_FILE", conflicts_with = "cert_file")]
    pfx_file: Option<PathBuf>,

    /// Name of the environment variable holding the PFX password
    #[arg(long, env = "TLS_PFX_PASSWORD_ENV", requires = "pfx_file")]
    pfx_password_env: Option<String>,

    /// Maximum retained upstream health samples
    #[arg(long, env = "MAX_HEALTH_SAMPLES", default_value = "10")]
    max_health_samples: usize,

    /// Apple App Site Association manifest file
    #[arg(long, env = "AASA_FILE")]
    aasa_file: Option<PathBuf>,

    /// Android Asset Links manifest file
    #[arg(long, env = "ASSETLINKS_FILE")]
    assetlinks_file: Option<PathBuf>,

    /// Dump inbound request headers (debugging aid)
    #[arg(long, env = "LOG_REQUEST_HEADERS")]
    log_request_headers: bool,

    /// Log subject/issuer/validity details for every certificate candidate
    #[arg(long, env = "VERBOSE_CERT_LOG")]
    verbose_cert_log: bool,

    /// Directory for persisted key material (defaults to the user data dir)
    #[arg(long, env = "CLICKPROXY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run in production mode (ports 80/443, TLS on)
    #[arg(long)]
    production: bool,
}

fn certificate_source(args: &Args) -> Result<CertificateSource> {
    if let Some(path) = &args.pfx_file {
        return Ok(CertificateSource::Pfx {
            path: path.clone(),
            password_env: args.pfx_password_env.clone(),
        });
    }
    match (&args.cert_file, &args.key_file) {
        (Some(cert_path), Some(key_path)) => Ok(CertificateSource::Pem {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }),
        (None, None) => Ok(CertificateSource::None),
        _ => bail!("--cert-file and --key-file must be given together"),
    }
}

fn build_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings {
            custom_domain: String::new(),
            tracked_paths: Vec::new(),
            max_health_samples: args.max_health_samples,
            tls: TlsSettings {
                enabled: args.tls,
                certificate: certificate_source(args)?,
                https_port: args.https_port,
                http_port: args.http_port,
                redirect_http: args.redirect_http,
            },
            deep_links: DeepLinkSettings {
                apple_app_site_association: args.aasa_file.clone(),
                android_asset_links: args.assetlinks_file.clone(),
            },
            log_request_headers: args.log_request_headers,
            verbose_certificate_log: args.verbose_cert_log,
            state_dir: args.state_dir.clone(),
        },
    };

    // The two operational keys can always be overridden from the CLI.
    if let Some(domain) = &args.domain {
        settings.custom_domain = domain.clone();
    }
    if !args.paths.is_empty() {
        settings.tracked_paths = args.paths.clone();
    }

    if args.production {
        settings.tls.enabled = true;
        settings.tls.http_port = 80;
        settings.tls.https_port = 443;
    }

    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    clickproxy::logging::init(&args.log_level);

    let settings = build_settings(&args)?;
    settings.validate()?;

    info!("starting ClickProxy v1.0.0");
    info!("click-tracking domain: {}", settings.custom_domain);
    info!("tracked paths: {:?}", settings.tracked_paths);

    // Certificate first, routing table second, listeners last. Nothing is
    // served until all three are ready.
    let bundle = if settings.tls.enabled {
        let provider = CertificateProvider::new(settings.tls.certificate.clone())
            .with_state_dir(settings.state_dir.clone())
            .with_verbose_diagnostics(settings.verbose_certificate_log);
        Some(provider.acquire()?)
    } else {
        None
    };

    let table = RouteTableBuilder::new(
        settings.tracked_paths.clone(),
        settings.custom_domain.clone(),
    )?
    .build();
    info!(
        "routing table revision {} with {} route(s)",
        table.revision(),
        table.rules().len()
    );
    let shared_table = Arc::new(SharedRoutingTable::new(table));

    let tracker = Arc::new(HealthTracker::new(settings.max_health_samples));

    let server = Arc::new(ProxyServer::new(
        &settings,
        shared_table,
        bundle.as_ref(),
        tracker,
    )?);

    info!("ClickProxy started successfully");
    server.run().await
}
