//! Metrics instrumentation for controller-db.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The parent daemon is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `controller_db_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `objtype`: network, member, delete_network, delete_member
//! - `transport`: pgsql, redis, pubsub
//! - `status`: success, error, skipped

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one commit-queue item processed by a worker.
pub fn record_commit(objtype: &'static str, status: &'static str) {
    counter!(
        "controller_db_commits_total",
        "objtype" => objtype,
        "status" => status
    )
    .increment(1);
}

/// Record commit latency (borrow-to-fanout).
pub fn record_commit_latency(objtype: &'static str, duration: Duration) {
    histogram!(
        "controller_db_commit_seconds",
        "objtype" => objtype
    )
    .record(duration.as_secs_f64());
}

/// Record one change notification received from a listener transport.
pub fn record_notification(transport: &'static str, kind: &'static str, status: &'static str) {
    counter!(
        "controller_db_notifications_total",
        "transport" => transport,
        "kind" => kind,
        "status" => status
    )
    .increment(1);
}

/// Record one change published to the outbound bus.
pub fn record_published_change(kind: &'static str, status: &'static str) {
    counter!(
        "controller_db_published_changes_total",
        "kind" => kind,
        "status" => status
    )
    .increment(1);
}

/// Set the cached record counts after bulk init or a commit.
pub fn set_network_count(count: usize) {
    gauge!("controller_db_networks").set(count as f64);
}

pub fn set_member_count(count: usize) {
    gauge!("controller_db_members").set(count as f64);
}

/// Set the current commit-queue depth.
pub fn set_commit_queue_depth(depth: usize) {
    gauge!("controller_db_commit_queue_depth").set(depth as f64);
}

/// Record one node liveness check-in.
pub fn record_node_checkin() {
    counter!("controller_db_node_checkins_total").increment(1);
}

/// Record one liveness flush with the number of entries delivered to the sink.
pub fn record_status_flush(sink: &'static str, entries: usize, duration: Duration) {
    counter!(
        "controller_db_status_flushes_total",
        "sink" => sink
    )
    .increment(1);
    histogram!(
        "controller_db_status_flush_entries",
        "sink" => sink
    )
    .record(entries as f64);
    histogram!(
        "controller_db_status_flush_seconds",
        "sink" => sink
    )
    .record(duration.as_secs_f64());
}

/// Record a heartbeat upsert outcome.
pub fn record_heartbeat(status: &'static str) {
    counter!(
        "controller_db_heartbeats_total",
        "status" => status
    )
    .increment(1);
}

/// Record an SSO auth-info lookup.
pub fn record_sso_lookup(status: &'static str) {
    counter!(
        "controller_db_sso_lookups_total",
        "status" => status
    )
    .increment(1);
}

/// Record a new-member side-effect notification handed to the outbound hook.
pub fn record_member_joined_notify() {
    counter!("controller_db_member_joined_notifications_total").increment(1);
}

/// Record bulk-init phase duration.
pub fn record_init_phase(phase: &'static str, rows: u64, duration: Duration) {
    histogram!(
        "controller_db_init_phase_seconds",
        "phase" => phase
    )
    .record(duration.as_secs_f64());
    counter!(
        "controller_db_init_rows_total",
        "phase" => phase
    )
    .increment(rows);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the recording API compiles and doesn't panic without an
    // installed recorder.

    #[test]
    fn test_commit_metrics() {
        record_commit("network", "success");
        record_commit("member", "error");
        record_commit("delete_network", "success");
        record_commit_latency("member", Duration::from_millis(3));
    }

    #[test]
    fn test_notification_metrics() {
        record_notification("pgsql", "network", "success");
        record_notification("redis", "member", "malformed");
        record_notification("pubsub", "member", "error");
    }

    #[test]
    fn test_gauges() {
        set_network_count(2);
        set_member_count(4);
        set_commit_queue_depth(17);
    }

    #[test]
    fn test_status_metrics() {
        record_node_checkin();
        record_status_flush("redis", 120, Duration::from_millis(9));
        record_heartbeat("success");
    }

    #[test]
    fn test_misc_counters() {
        record_sso_lookup("empty");
        record_member_joined_notify();
        record_published_change("network", "success");
        record_init_phase("networks", 2, Duration::from_millis(40));
    }
}
