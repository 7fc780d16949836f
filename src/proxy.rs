//! Proxy server
//!
//! Owns the listener sockets and the per-request flow: admission pipeline,
//! route matching, forwarding to the single upstream, health recording, and
//! the health probe endpoint. The server only exists once startup has
//! produced a certificate bundle and a routing table; nothing is accepted
//! before then.

use crate::certificate::CertificateBundle;
use crate::config::Settings;
use crate::health::{evaluate_probe, HealthTracker, TrackingPolicy, HEALTH_PROBE_PATH, HEALTH_SERVICE_TAG};
use crate::middleware::{
    empty_body, full_body, json_response, text_response, DeepLinkManifests, Pipeline,
    ResponseBody, StageOutcome,
};
use crate::routing::{ClusterDestination, SharedRoutingTable};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use http::request::Parts;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// TLS-terminating reverse proxy for one click-tracking domain
pub struct ProxyServer {
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    tls_config: Option<Arc<ServerConfig>>,
    table: Arc<SharedRoutingTable>,
    tracker: Arc<HealthTracker>,
    policy: TrackingPolicy,
    http_pipeline: Pipeline,
    https_pipeline: Pipeline,
}

impl ProxyServer {
    /// Wire the server from the startup artifacts. `bundle` must be present
    /// when TLS is enabled.
    pub fn new(
        settings: &Settings,
        table: Arc<SharedRoutingTable>,
        bundle: Option<&CertificateBundle>,
        tracker: Arc<HealthTracker>,
    ) -> Result<Self> {
        let tls_enabled = settings.tls.enabled;
        let tls_config = match (tls_enabled, bundle) {
            (true, Some(bundle)) => Some(bundle.server_config()),
            (true, None) => {
                return Err(anyhow!(
                    "TLS is enabled but no certificate bundle was provided"
                ))
            }
            (false, _) => None,
        };

        let manifests = DeepLinkManifests::load(&settings.deep_links);
        let redirect_port = if tls_enabled && settings.tls.redirect_http {
            Some(settings.tls.https_port)
        } else {
            None
        };

        // The redirect stage only belongs on the plain listener; TLS
        // connections are already where the redirect would send them.
        let http_pipeline = Pipeline::standard(
            &settings.custom_domain,
            manifests.clone(),
            settings.log_request_headers,
            redirect_port,
        );
        let https_pipeline = Pipeline::standard(
            &settings.custom_domain,
            manifests,
            settings.log_request_headers,
            None,
        );

        let http_addr: SocketAddr = format!("0.0.0.0:{}", settings.tls.http_port)
            .parse()
            .context("invalid HTTP listen address")?;
        let https_addr = if tls_enabled {
            Some(
                format!("0.0.0.0:{}", settings.tls.https_port)
                    .parse()
                    .context("invalid HTTPS listen address")?,
            )
        } else {
            None
        };

        Ok(Self {
            http_addr,
            https_addr,
            tls_config,
            table,
            tracker,
            policy: TrackingPolicy::new(&settings.custom_domain, &settings.tracked_paths),
            http_pipeline,
            https_pipeline,
        })
    }

    /// Run the accept loops until failure.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "proxy serving routing table revision {}",
            self.table.load().revision()
        );

        if self.tls_config.is_some() {
            tokio::try_join!(
                Arc::clone(&self).run_plain(),
                Arc::clone(&self).run_tls()
            )?;
            Ok(())
        } else {
            self.run_plain().await
        }
    }

    async fn run_plain(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.http_addr).await?;
        info!("HTTP server listening on {}", self.http_addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req, remote_addr, false).await }
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(io, service)
                    .await
                {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn run_tls(self: Arc<Self>) -> Result<()> {
        let (Some(addr), Some(tls_config)) = (self.https_addr, self.tls_config.clone()) else {
            return Ok(());
        };

        let acceptor = TlsAcceptor::from(tls_config);
        let listener = TcpListener::bind(addr).await?;
        info!("HTTPS server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", remote_addr, e);
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req, remote_addr, true).await }
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(io, service)
                    .await
                {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        tls: bool,
    ) -> Result<Response<ResponseBody>, Infallible> {
        match self.process_request(req, remote_addr, tls).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("request error: {:#}", e);
                Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                ))
            }
        }
    }

    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        tls: bool,
    ) -> Result<Response<ResponseBody>> {
        let (parts, body) = req.into_parts();
        debug!(
            "{} {} from {}",
            parts.method,
            parts.uri.path(),
            remote_addr
        );

        let pipeline = if tls {
            &self.https_pipeline
        } else {
            &self.http_pipeline
        };
        if let StageOutcome::Terminate(response) = pipeline.run(&parts, remote_addr) {
            return Ok(response);
        }

        if parts.method == Method::GET && parts.uri.path() == HEALTH_PROBE_PATH {
            return Ok(self.health_probe_response());
        }

        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let table = self.table.load();
        let Some((rule, destination)) =
            table.match_route(&parts.method, host.as_deref(), parts.uri.path())
        else {
            debug!(
                "no route for {} {} (host {:?})",
                parts.method,
                parts.uri.path(),
                host
            );
            return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
        };
        debug!("matched route {}", rule.route_id);

        // A failing body read means the client went away mid-request; that
        // traffic must never reach the health window.
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("client disconnected before request completed: {}", e);
                return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
            }
        };

        let response = match self
            .forward(&parts, body_bytes, destination, remote_addr, tls)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("upstream request failed: {:#}", e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        };

        if self
            .policy
            .should_record(&parts.method, host.as_deref(), parts.uri.path())
        {
            self.tracker.record(response.status().as_u16());
            info!(
                "upstream response: {} for {} {}",
                response.status(),
                parts.method,
                parts.uri.path()
            );
        }

        Ok(response)
    }

    /// Forward to the upstream destination. The original Host header is
    /// always passed through unmodified: the upstream relies on it to
    /// resolve the click-tracking custom domain.
    async fn forward(
        &self,
        parts: &Parts,
        body: Bytes,
        destination: &ClusterDestination,
        remote_addr: SocketAddr,
        tls: bool,
    ) -> Result<Response<ResponseBody>> {
        let upstream = &destination.address;
        if upstream.scheme() != "http" {
            return Err(anyhow!(
                "unsupported upstream scheme '{}' for {}",
                upstream.scheme(),
                destination.id
            ));
        }
        let upstream_host = upstream
            .host_str()
            .ok_or_else(|| anyhow!("upstream address has no host"))?;
        let upstream_port = upstream.port_or_known_default().unwrap_or(80);

        let addr = format!("{upstream_host}:{upstream_port}");
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to upstream {addr}"))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("upstream handshake failed")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection error: {}", e);
            }
        });

        // Everything after the matched prefix is forwarded verbatim.
        let uri: Uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .context("invalid request path")?;

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .version(Version::HTTP_11);

        for (name, value) in parts.headers.iter() {
            if name != HOST {
                builder = builder.header(name, value);
            }
        }
        if let Some(host) = parts.headers.get(HOST) {
            builder = builder.header(HOST, host);
            builder = builder.header("X-Forwarded-Host", host);
        }
        builder = builder.header("X-Forwarded-For", remote_addr.ip().to_string());
        builder = builder.header("X-Forwarded-Proto", if tls { "https" } else { "http" });

        let upstream_req = builder
            .body(Full::new(body))
            .context("failed to build upstream request")?;

        let response = sender
            .send_request(upstream_req)
            .await
            .context("failed to send request to upstream")?;

        let (response_parts, response_body) = response.into_parts();
        let response_bytes = response_body
            .collect()
            .await
            .context("failed to read upstream response body")?
            .to_bytes();

        let mut builder = Response::builder().status(response_parts.status);
        for (name, value) in response_parts.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = if response_bytes.is_empty() {
            builder.body(empty_body())
        } else {
            builder.body(full_body(response_bytes))
        }
        .context("failed to build response")?;

        Ok(response)
    }

    /// Evaluate the health probe. 200 while healthy, 503 otherwise; the
    /// endpoint itself never fails.
    fn health_probe_response(&self) -> Response<ResponseBody> {
        let report = evaluate_probe(&self.tracker, HEALTH_SERVICE_TAG);
        let status = if report.is_healthy() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string());
        json_response(status, body)
    }
}
