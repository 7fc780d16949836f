//! Host-restricted routing table
//!
//! One GET-only route per tracked path segment, all pinned to the single
//! configured custom domain and the single fixed upstream cluster. The
//! table is immutable once built; a rebuild produces a brand-new table with
//! a fresh revision id, and `SharedRoutingTable` swaps tables atomically
//! while notifying subscribers. In this proxy the swap happens exactly once
//! at startup, but the type supports replacement so a future reload path
//! does not need a redesign.

use crate::error::ConfigurationError;
use arc_swap::ArcSwap;
use hyper::Method;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;
use uuid::Uuid;

/// All forwarded traffic goes to this one destination.
pub const UPSTREAM_ADDRESS: &str = "http://sendgrid.net/";

/// Cluster id shared by every route rule.
pub const UPSTREAM_CLUSTER_ID: &str = "sendgrid";

/// Return the hostname portion of a Host header value, stripping any port.
/// IPv6 literals keep their brackets.
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    }
}

/// Segment-boundary prefix match: `/track-click` matches `/track-click` and
/// `/track-click/abc` but not `/track-clicks`.
pub fn path_matches_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// A single immutable routing rule
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub route_id: String,
    pub path_prefix: String,
    pub methods: Vec<Method>,
    pub host: String,
    pub cluster_id: String,
}

impl RouteRule {
    /// True when method, host (case-insensitive, port ignored) and path
    /// prefix all match.
    pub fn matches(&self, method: &Method, host: Option<&str>, path: &str) -> bool {
        let Some(host) = host else {
            return false;
        };

        self.methods.contains(method)
            && host_without_port(host).eq_ignore_ascii_case(&self.host)
            && path_matches_prefix(path, &self.path_prefix)
    }
}

/// The fixed upstream a cluster of rules forwards to
#[derive(Debug, Clone)]
pub struct ClusterDestination {
    pub id: String,
    pub address: Url,
}

/// Immutable snapshot of the proxy's routing configuration
#[derive(Debug)]
pub struct RoutingTable {
    rules: Vec<RouteRule>,
    clusters: HashMap<String, ClusterDestination>,
    revision: Uuid,
}

impl RoutingTable {
    pub fn revision(&self) -> Uuid {
        self.revision
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn cluster(&self, id: &str) -> Option<&ClusterDestination> {
        self.clusters.get(id)
    }

    /// First rule (in configuration order) matching the request, with its
    /// destination. A rule referencing an unknown cluster never matches.
    pub fn match_route(
        &self,
        method: &Method,
        host: Option<&str>,
        path: &str,
    ) -> Option<(&RouteRule, &ClusterDestination)> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(method, host, path))
            .find_map(|rule| self.clusters.get(&rule.cluster_id).map(|dest| (rule, dest)))
    }
}

/// Builds a [`RoutingTable`] from the tracked path segments and the
/// required custom domain. Pure: the same inputs always produce the same
/// rules (only the revision id differs between builds).
#[derive(Debug, Clone)]
pub struct RouteTableBuilder {
    segments: Vec<String>,
    domain: String,
    upstream: Url,
}

impl RouteTableBuilder {
    /// Fails fast when the custom domain is empty: without it every rule
    /// would be unanchored and the proxy an open relay.
    pub fn new(segments: Vec<String>, domain: String) -> Result<Self, ConfigurationError> {
        if domain.trim().is_empty() {
            return Err(ConfigurationError::MissingCustomDomain);
        }

        let upstream = Url::parse(UPSTREAM_ADDRESS).map_err(|e| ConfigurationError::Invalid {
            key: "upstream".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            segments,
            domain,
            upstream,
        })
    }

    /// Point the cluster at a different upstream. Used by tests; production
    /// always forwards to [`UPSTREAM_ADDRESS`].
    pub fn with_upstream(mut self, upstream: Url) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn build(&self) -> RoutingTable {
        let rules = self
            .segments
            .iter()
            .map(|segment| RouteRule {
                route_id: format!("{UPSTREAM_CLUSTER_ID}-{segment}"),
                path_prefix: format!("/{segment}"),
                methods: vec![Method::GET],
                host: self.domain.clone(),
                cluster_id: UPSTREAM_CLUSTER_ID.to_string(),
            })
            .collect();

        let destination = ClusterDestination {
            id: UPSTREAM_CLUSTER_ID.to_string(),
            address: self.upstream.clone(),
        };

        let mut clusters = HashMap::new();
        clusters.insert(destination.id.clone(), destination);

        RoutingTable {
            rules,
            clusters,
            revision: Uuid::new_v4(),
        }
    }
}

/// Atomically replaceable handle to the current routing table.
///
/// Readers take lock-free snapshots; `replace` swaps in a new table and
/// signals its revision to subscribers.
pub struct SharedRoutingTable {
    current: ArcSwap<RoutingTable>,
    changed: watch::Sender<Uuid>,
}

impl SharedRoutingTable {
    pub fn new(table: RoutingTable) -> Self {
        let (changed, _) = watch::channel(table.revision());
        Self {
            current: ArcSwap::from_pointee(table),
            changed,
        }
    }

    /// Snapshot of the current table.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Swap in a new table and notify subscribers of the new revision.
    pub fn replace(&self, table: RoutingTable) {
        let revision = table.revision();
        self.current.store(Arc::new(table));
        let _ = self.changed.send(revision);
    }

    /// Receiver that yields the revision of each newly installed table.
    pub fn subscribe(&self) -> watch::Receiver<Uuid> {
        self.changed.subscribe()
    }
}
