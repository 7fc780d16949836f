//! Request admission pipeline
//!
//! Inbound requests pass through an explicit ordered list of stages before
//! anything is forwarded: host guard, deep-link manifest serving, optional
//! request-header logging, and (plain-HTTP listener only) the HTTPS
//! redirect. Each stage either lets the request continue or terminates it
//! with a response. The order is fixed and testable; health tracking is not
//! a stage here because it observes the completed response after the
//! forward step.

use crate::config::DeepLinkSettings;
use crate::routing::host_without_port;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use http::request::Parts;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HOST, LOCATION, USER_AGENT};
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use tracing::{error, info, warn};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Decision of a single pipeline stage.
pub enum StageOutcome {
    /// Hand the request to the next stage (and eventually the forwarder).
    Continue,
    /// Stop here and answer the client directly.
    Terminate(Response<ResponseBody>),
}

/// One named admission stage.
pub trait RequestStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, parts: &Parts, remote_addr: SocketAddr) -> StageOutcome;
}

/// Fixed-order composition of stages; the first Terminate wins.
pub struct Pipeline {
    stages: Vec<Box<dyn RequestStage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn RequestStage>>) -> Self {
        Self { stages }
    }

    /// The standard stage order. The redirect stage is only present on the
    /// plain-HTTP listener (`redirect_to_https_port`).
    pub fn standard(
        allowed_host: &str,
        manifests: DeepLinkManifests,
        log_request_headers: bool,
        redirect_to_https_port: Option<u16>,
    ) -> Self {
        let mut stages: Vec<Box<dyn RequestStage>> = vec![
            Box::new(HostGuard::new(allowed_host)),
            Box::new(manifests),
        ];
        if log_request_headers {
            stages.push(Box::new(RequestHeaderLogging));
        }
        if let Some(https_port) = redirect_to_https_port {
            stages.push(Box::new(HttpsRedirect { https_port }));
        }
        Self::new(stages)
    }

    pub fn run(&self, parts: &Parts, remote_addr: SocketAddr) -> StageOutcome {
        for stage in &self.stages {
            if let StageOutcome::Terminate(response) = stage.apply(parts, remote_addr) {
                return StageOutcome::Terminate(response);
            }
        }
        StageOutcome::Continue
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}

/// Exact host admission: the sole defense against serving as an open relay.
///
/// Host mismatches usually mean scanner probing or misrouted DNS, so they
/// are logged at error severity with enough context to investigate.
pub struct HostGuard {
    allowed_host: String,
}

impl HostGuard {
    pub fn new(allowed_host: &str) -> Self {
        Self {
            allowed_host: allowed_host.to_string(),
        }
    }
}

impl RequestStage for HostGuard {
    fn name(&self) -> &'static str {
        "host guard"
    }

    fn apply(&self, parts: &Parts, remote_addr: SocketAddr) -> StageOutcome {
        let observed = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let hostname = host_without_port(observed);

        if hostname.eq_ignore_ascii_case(&self.allowed_host) {
            return StageOutcome::Continue;
        }

        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        error!(
            "rejected request for invalid host '{}' (expected '{}'); path: {}, method: {}, user agent: {}, remote: {}",
            hostname,
            self.allowed_host,
            parts.uri.path(),
            parts.method,
            user_agent,
            remote_addr
        );

        StageOutcome::Terminate(text_response(
            StatusCode::NOT_FOUND,
            &format!("Host '{hostname}' not found"),
        ))
    }
}

/// Serves the iOS Universal Links and Android App Links manifests from
/// content preloaded at startup.
#[derive(Clone)]
pub struct DeepLinkManifests {
    apple_app_site_association: Option<String>,
    android_asset_links: Option<String>,
}

impl DeepLinkManifests {
    pub fn load(settings: &DeepLinkSettings) -> Self {
        Self {
            apple_app_site_association: settings
                .apple_app_site_association
                .as_deref()
                .and_then(|path| read_manifest(path, "apple-app-site-association")),
            android_asset_links: settings
                .android_asset_links
                .as_deref()
                .and_then(|path| read_manifest(path, "assetlinks.json")),
        }
    }

    /// Construct from in-memory content.
    pub fn from_content(aasa: Option<String>, asset_links: Option<String>) -> Self {
        Self {
            apple_app_site_association: aasa,
            android_asset_links: asset_links,
        }
    }

    fn serve(content: &Option<String>, which: &str) -> StageOutcome {
        match content {
            Some(body) => {
                info!("serving {} manifest", which);
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/json")
                    .header(CACHE_CONTROL, "max-age=3600")
                    .body(full_body(Bytes::from(body.clone())))
                    .unwrap();
                StageOutcome::Terminate(response)
            }
            None => {
                warn!("{} manifest requested but not configured", which);
                StageOutcome::Terminate(text_response(StatusCode::NOT_FOUND, "Not Found"))
            }
        }
    }
}

impl RequestStage for DeepLinkManifests {
    fn name(&self) -> &'static str {
        "deep-link manifests"
    }

    fn apply(&self, parts: &Parts, _remote_addr: SocketAddr) -> StageOutcome {
        match parts.uri.path() {
            "/.well-known/apple-app-site-association" | "/apple-app-site-association" => {
                Self::serve(&self.apple_app_site_association, "apple-app-site-association")
            }
            "/.well-known/assetlinks.json" => {
                Self::serve(&self.android_asset_links, "assetlinks.json")
            }
            _ => StageOutcome::Continue,
        }
    }
}

fn read_manifest(path: &std::path::Path, which: &str) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) if !content.is_empty() => Some(content),
        Ok(_) => {
            warn!("{} file {:?} is empty", which, path);
            None
        }
        Err(e) => {
            warn!("{} file {:?} could not be read: {}", which, path, e);
            None
        }
    }
}

/// Dumps every inbound header. Noisy; only wired in when explicitly
/// enabled.
pub struct RequestHeaderLogging;

impl RequestStage for RequestHeaderLogging {
    fn name(&self) -> &'static str {
        "request header logging"
    }

    fn apply(&self, parts: &Parts, _remote_addr: SocketAddr) -> StageOutcome {
        let headers: Vec<String> = parts
            .headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
            .collect();
        info!(
            "request headers: {} {} [{}]",
            parts.method,
            parts.uri.path(),
            headers.join(", ")
        );
        StageOutcome::Continue
    }
}

/// Permanent-redirects plain HTTP to the HTTPS listener.
pub struct HttpsRedirect {
    pub https_port: u16,
}

impl RequestStage for HttpsRedirect {
    fn name(&self) -> &'static str {
        "https redirect"
    }

    fn apply(&self, parts: &Parts, _remote_addr: SocketAddr) -> StageOutcome {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let hostname = host_without_port(host);
        let authority = if self.https_port == 443 {
            hostname.to_string()
        } else {
            format!("{hostname}:{}", self.https_port)
        };
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let location = format!("https://{authority}{path_and_query}");
        StageOutcome::Terminate(redirect_response(&location))
    }
}

// ---- response helpers ---------------------------------------------------

pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn text_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

pub fn json_response(status: StatusCode, body: String) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(body)))
        .unwrap()
}

pub fn redirect_response(location: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(LOCATION, location)
        .body(empty_body())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, Request};

    fn make_parts(method: Method, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _body) = builder.body(()).unwrap().into_parts();
        parts
    }

    fn remote() -> SocketAddr {
        "203.0.113.9:51000".parse().unwrap()
    }

    #[test]
    fn test_host_guard_accepts_exact_host() {
        let guard = HostGuard::new("links.example.com");
        let parts = make_parts(
            Method::GET,
            "/track-click/x",
            &[("host", "links.example.com")],
        );
        assert!(matches!(guard.apply(&parts, remote()), StageOutcome::Continue));
    }

    #[test]
    fn test_host_guard_ignores_case_and_port() {
        let guard = HostGuard::new("links.example.com");
        let parts = make_parts(
            Method::GET,
            "/track-click/x",
            &[("host", "LINKS.Example.Com:443")],
        );
        assert!(matches!(guard.apply(&parts, remote()), StageOutcome::Continue));
    }

    #[test]
    fn test_host_guard_rejects_foreign_host_with_404() {
        let guard = HostGuard::new("links.example.com");
        let parts = make_parts(Method::GET, "/track-click/x", &[("host", "evil.example.net")]);

        match guard.apply(&parts, remote()) {
            StageOutcome::Terminate(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND)
            }
            StageOutcome::Continue => panic!("foreign host must not pass the guard"),
        }
    }

    #[test]
    fn test_host_guard_rejects_missing_host_header() {
        let guard = HostGuard::new("links.example.com");
        let parts = make_parts(Method::GET, "/track-click/x", &[]);
        assert!(matches!(
            guard.apply(&parts, remote()),
            StageOutcome::Terminate(_)
        ));
    }

    #[test]
    fn test_pipeline_stage_order() {
        let pipeline = Pipeline::standard(
            "links.example.com",
            DeepLinkManifests::from_content(None, None),
            true,
            Some(8443),
        );
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "host guard",
                "deep-link manifests",
                "request header logging",
                "https redirect"
            ]
        );
    }

    #[test]
    fn test_pipeline_short_circuits_on_host_mismatch() {
        // With the redirect stage present, a bad host must still get the
        // guard's 404, not a redirect.
        let pipeline = Pipeline::standard(
            "links.example.com",
            DeepLinkManifests::from_content(None, None),
            false,
            Some(8443),
        );
        let parts = make_parts(Method::GET, "/track-click/x", &[("host", "evil.example.net")]);

        match pipeline.run(&parts, remote()) {
            StageOutcome::Terminate(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND)
            }
            StageOutcome::Continue => panic!("expected termination"),
        }
    }

    #[test]
    fn test_redirect_preserves_path_and_query() {
        let stage = HttpsRedirect { https_port: 8443 };
        let parts = make_parts(
            Method::GET,
            "/track-click/abc?u=1",
            &[("host", "links.example.com:8080")],
        );

        match stage.apply(&parts, remote()) {
            StageOutcome::Terminate(response) => {
                assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
                assert_eq!(
                    response.headers().get(LOCATION).unwrap(),
                    "https://links.example.com:8443/track-click/abc?u=1"
                );
            }
            StageOutcome::Continue => panic!("redirect stage must terminate"),
        }
    }

    #[test]
    fn test_redirect_elides_default_port() {
        let stage = HttpsRedirect { https_port: 443 };
        let parts = make_parts(Method::GET, "/x", &[("host", "links.example.com")]);

        match stage.apply(&parts, remote()) {
            StageOutcome::Terminate(response) => {
                assert_eq!(
                    response.headers().get(LOCATION).unwrap(),
                    "https://links.example.com/x"
                );
            }
            StageOutcome::Continue => panic!("redirect stage must terminate"),
        }
    }

    #[test]
    fn test_manifests_serve_configured_content() {
        let manifests = DeepLinkManifests::from_content(
            Some(r#"{"applinks":{}}"#.to_string()),
            None,
        );
        let parts = make_parts(
            Method::GET,
            "/.well-known/apple-app-site-association",
            &[("host", "links.example.com")],
        );

        match manifests.apply(&parts, remote()) {
            StageOutcome::Terminate(response) => {
                assert_eq!(response.status(), StatusCode::OK);
                assert_eq!(
                    response.headers().get(CACHE_CONTROL).unwrap(),
                    "max-age=3600"
                );
                assert_eq!(
                    response.headers().get(CONTENT_TYPE).unwrap(),
                    "application/json"
                );
            }
            StageOutcome::Continue => panic!("manifest path must be handled"),
        }
    }

    #[test]
    fn test_manifests_404_when_unconfigured() {
        let manifests = DeepLinkManifests::from_content(None, None);
        let parts = make_parts(
            Method::GET,
            "/.well-known/assetlinks.json",
            &[("host", "links.example.com")],
        );

        match manifests.apply(&parts, remote()) {
            StageOutcome::Terminate(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND)
            }
            StageOutcome::Continue => panic!("manifest path must be handled"),
        }
    }

    #[test]
    fn test_manifests_pass_through_other_paths() {
        let manifests = DeepLinkManifests::from_content(Some("{}".to_string()), None);
        let parts = make_parts(
            Method::GET,
            "/track-click/x",
            &[("host", "links.example.com")],
        );
        assert!(matches!(
            manifests.apply(&parts, remote()),
            StageOutcome::Continue
        ));
    }

    #[test]
    fn test_manifests_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let aasa = dir.path().join("apple-app-site-association.json");
        std::fs::write(&aasa, r#"{"applinks":{"details":[]}}"#).unwrap();

        let manifests = DeepLinkManifests::load(&DeepLinkSettings {
            apple_app_site_association: Some(aasa),
            android_asset_links: Some(dir.path().join("missing.json")),
        });

        assert!(manifests.apple_app_site_association.is_some());
        assert!(manifests.android_asset_links.is_none());
    }
}
