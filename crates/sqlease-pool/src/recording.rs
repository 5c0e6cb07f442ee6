// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lease metrics.
//!
//! Recorded through the metrics facade; without an installed recorder every
//! call is a no-op. `owner` is `"reader"` or `"writer"`.

use std::time::Duration;

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register metric descriptions. Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!("sqlease_leases_acquired_total", "Leases issued");
    describe_counter!(
        "sqlease_lease_timeouts_total",
        "Acquisitions that gave up after the acquire timeout"
    );
    describe_counter!(
        "sqlease_connections_created_total",
        "Physical connections opened"
    );
    describe_counter!(
        "sqlease_connections_destroyed_total",
        "Physical connections closed"
    );
    describe_counter!(
        "sqlease_connections_invalidated_total",
        "Connections destroyed because a holder marked them invalid"
    );
    describe_gauge!("sqlease_leases_active", "Leases currently outstanding");
    describe_histogram!(
        "sqlease_lease_wait_seconds",
        "Time spent waiting for a lease"
    );
}

pub fn record_lease_acquired(owner: &'static str, waited: Duration) {
    metrics::counter!("sqlease_leases_acquired_total", "owner" => owner).increment(1);
    metrics::histogram!("sqlease_lease_wait_seconds", "owner" => owner).record(waited.as_secs_f64());
}

pub fn record_timeout(owner: &'static str) {
    metrics::counter!("sqlease_lease_timeouts_total", "owner" => owner).increment(1);
}

pub fn record_created(owner: &'static str) {
    metrics::counter!("sqlease_connections_created_total", "owner" => owner).increment(1);
}

pub fn record_destroyed(owner: &'static str, invalidated: bool) {
    metrics::counter!("sqlease_connections_destroyed_total", "owner" => owner).increment(1);
    if invalidated {
        metrics::counter!("sqlease_connections_invalidated_total", "owner" => owner).increment(1);
    }
}

pub fn set_active_leases(owner: &'static str, count: usize) {
    metrics::gauge!("sqlease_leases_active", "owner" => owner).set(count as f64);
}
