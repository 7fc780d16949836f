//! Upstream health tracking
//!
//! A bounded FIFO window of recent upstream status codes, recorded once per
//! completed forwarded request that passes the tracking gate. A single code
//! >= 400 anywhere in the retained window marks the upstream unhealthy;
//! there is deliberately no smoothing or ratio threshold.

use crate::routing::{host_without_port, path_matches_prefix};
use hyper::Method;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::error;

/// Path of the health probe endpoint.
pub const HEALTH_PROBE_PATH: &str = "/health/sendgrid";

/// Service tag reported by the probe.
pub const HEALTH_SERVICE_TAG: &str = "sendgrid";

/// Snapshot of the derived health state
#[derive(Debug, Clone)]
pub struct HealthState {
    pub healthy: bool,
    pub recent_codes: Vec<u16>,
    pub message: String,
}

/// Bounded-window recorder of upstream response codes.
///
/// Insert-and-evict and snapshot reads share one critical section so the
/// size accounting never races and a reader never observes a partially
/// evicted queue.
pub struct HealthTracker {
    samples: Mutex<VecDeque<u16>>,
    capacity: usize,
}

impl HealthTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record one completed upstream response, evicting the oldest samples
    /// once the window is over capacity.
    pub fn record(&self, status_code: u16) {
        let mut samples = self.samples.lock();
        samples.push_back(status_code);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Derive the current health state from the retained window.
    pub fn status(&self) -> HealthState {
        let samples = self.samples.lock();
        let recent_codes: Vec<u16> = samples.iter().copied().collect();
        drop(samples);

        if recent_codes.is_empty() {
            return HealthState {
                healthy: true,
                recent_codes,
                message: "no recent requests".to_string(),
            };
        }

        let error_codes: Vec<u16> = recent_codes.iter().copied().filter(|c| *c >= 400).collect();
        if error_codes.is_empty() {
            let message = format!("all {} recent requests successful", recent_codes.len());
            return HealthState {
                healthy: true,
                recent_codes,
                message,
            };
        }

        let message = format!(
            "found {} error responses out of {} recent requests: {:?}",
            error_codes.len(),
            recent_codes.len(),
            error_codes
        );
        HealthState {
            healthy: false,
            recent_codes,
            message,
        }
    }
}

/// Gate deciding which completed responses feed the tracker.
///
/// Only successful proxy traffic counts: GET requests for the proxy's own
/// host on a tracked path prefix. Everything else, including cancelled
/// requests (which never reach the record step), stays out of the window.
#[derive(Debug, Clone)]
pub struct TrackingPolicy {
    host: String,
    prefixes: Vec<String>,
}

impl TrackingPolicy {
    pub fn new(domain: &str, segments: &[String]) -> Self {
        Self {
            host: domain.to_string(),
            prefixes: segments.iter().map(|s| format!("/{s}")).collect(),
        }
    }

    pub fn should_record(&self, method: &Method, host: Option<&str>, path: &str) -> bool {
        let Some(host) = host else {
            return false;
        };

        method == Method::GET
            && host_without_port(host).eq_ignore_ascii_case(&self.host)
            && self
                .prefixes
                .iter()
                .any(|prefix| path_matches_prefix(path, prefix))
    }
}

/// JSON probe report: `{status, service, checks, duration}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub checks: Vec<CheckEntry>,
    /// Total evaluation time in seconds.
    pub duration: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckEntry {
    pub name: String,
    pub status: String,
    pub description: String,
    pub data: CheckData,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckData {
    pub recent_status_codes: Vec<u16>,
    pub request_count: usize,
    pub error_count: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "Healthy"
    }
}

fn status_label(healthy: bool) -> String {
    let label = if healthy { "Healthy" } else { "Unhealthy" };
    label.to_string()
}

/// Evaluate the probe. A faulting check is reported as an Unhealthy entry
/// rather than propagated, so the probe endpoint itself never breaks.
pub fn evaluate_probe(tracker: &HealthTracker, service: &str) -> HealthReport {
    let started = Instant::now();

    let entry = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| tracker.status())) {
        Ok(state) => {
            let error_count = state.recent_codes.iter().filter(|c| **c >= 400).count();
            CheckEntry {
                name: service.to_string(),
                status: status_label(state.healthy),
                description: state.message,
                data: CheckData {
                    request_count: state.recent_codes.len(),
                    error_count,
                    recent_status_codes: state.recent_codes,
                },
            }
        }
        Err(_) => {
            error!("health check evaluation failed");
            CheckEntry {
                name: service.to_string(),
                status: status_label(false),
                description: "health check evaluation failed".to_string(),
                data: CheckData::default(),
            }
        }
    };

    let healthy = entry.status == "Healthy";
    HealthReport {
        status: status_label(healthy),
        service: service.to_string(),
        checks: vec![entry],
        duration: started.elapsed().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_window_is_healthy() {
        let tracker = HealthTracker::new(10);
        let state = tracker.status();

        assert!(state.healthy);
        assert!(state.recent_codes.is_empty());
        assert_eq!(state.message, "no recent requests");
    }

    #[test]
    fn test_single_error_flips_unhealthy() {
        let tracker = HealthTracker::new(3);
        tracker.record(200);
        tracker.record(200);
        tracker.record(500);

        let state = tracker.status();
        assert!(!state.healthy);
        assert_eq!(state.recent_codes, vec![200, 200, 500]);
        assert!(state.message.contains("1 error responses out of 3"));
    }

    #[test]
    fn test_all_successes_are_healthy() {
        let tracker = HealthTracker::new(5);
        tracker.record(200);
        tracker.record(302);

        let state = tracker.status();
        assert!(state.healthy);
        assert_eq!(state.message, "all 2 recent requests successful");
    }

    #[test]
    fn test_window_evicts_oldest_in_arrival_order() {
        let tracker = HealthTracker::new(3);
        for code in [500, 200, 201, 202] {
            tracker.record(code);
        }

        let state = tracker.status();
        // The 500 fell out of the window, so the tracker recovered
        assert!(state.healthy);
        assert_eq!(state.recent_codes, vec![200, 201, 202]);
    }

    #[test]
    fn test_retains_min_of_capacity_and_total() {
        let tracker = HealthTracker::new(10);
        tracker.record(200);
        tracker.record(404);
        assert_eq!(tracker.status().recent_codes.len(), 2);

        for _ in 0..20 {
            tracker.record(200);
        }
        assert_eq!(tracker.status().recent_codes.len(), 10);
    }

    #[test]
    fn test_client_error_counts_as_error() {
        let tracker = HealthTracker::new(5);
        tracker.record(403);
        assert!(!tracker.status().healthy);
    }

    #[test]
    fn test_concurrent_recording_never_overflows() {
        let tracker = Arc::new(HealthTracker::new(10));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    tracker.record(200);
                    let state = tracker.status();
                    assert!(state.recent_codes.len() <= 10);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.status().recent_codes.len(), 10);
    }

    #[test]
    fn test_tracking_policy_gate() {
        let policy = TrackingPolicy::new(
            "links.example.com",
            &["track-click".to_string(), "track-open".to_string()],
        );

        assert!(policy.should_record(
            &Method::GET,
            Some("links.example.com"),
            "/track-click/abc"
        ));
        // Host match ignores case and port
        assert!(policy.should_record(
            &Method::GET,
            Some("LINKS.EXAMPLE.COM:443"),
            "/track-open"
        ));

        assert!(!policy.should_record(
            &Method::POST,
            Some("links.example.com"),
            "/track-click/abc"
        ));
        assert!(!policy.should_record(&Method::GET, Some("other.com"), "/track-click/abc"));
        assert!(!policy.should_record(&Method::GET, Some("links.example.com"), "/health/sendgrid"));
        assert!(!policy.should_record(&Method::GET, None, "/track-click/abc"));
    }

    #[test]
    fn test_probe_report_shape() {
        let tracker = HealthTracker::new(3);
        tracker.record(200);
        tracker.record(502);

        let report = evaluate_probe(&tracker, HEALTH_SERVICE_TAG);
        assert!(!report.is_healthy());
        assert_eq!(report.status, "Unhealthy");
        assert_eq!(report.service, "sendgrid");
        assert_eq!(report.checks.len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["checks"][0]["name"], "sendgrid");
        assert_eq!(json["checks"][0]["data"]["recentStatusCodes"][1], 502);
        assert_eq!(json["checks"][0]["data"]["requestCount"], 2);
        assert_eq!(json["checks"][0]["data"]["errorCount"], 1);
        assert!(json["duration"].is_number());
    }

    #[test]
    fn test_probe_healthy_when_untouched() {
        let tracker = HealthTracker::new(3);
        let report = evaluate_probe(&tracker, HEALTH_SERVICE_TAG);

        assert!(report.is_healthy());
        assert_eq!(report.checks[0].description, "no recent requests");
        assert_eq!(report.checks[0].data.request_count, 0);
    }
}
