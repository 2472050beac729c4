//! Prometheus Metrics
//!
//! Defines and initializes all Prometheus metrics for the fleetmount server.
//!
//! Metrics tracked:
//! - `fleetmount_contexts_active` - gauge of live topology contexts
//! - `fleetmount_mastership_changes_total` - counter of gained/lost mastership
//! - `fleetmount_singleton_registration_failures_total` - counter of failed candidate registrations
//! - `fleetmount_mounts_active` - gauge of local mount points by role
//! - `fleetmount_mount_registrations_total` - counter of mount registrations by role
//! - `fleetmount_schema_resolutions_total` - counter of schema resolutions by outcome
//! - `fleetmount_proxy_asks_total` - counter of proxy asks by request and outcome
//! - `fleetmount_proxy_ask_duration_seconds` - histogram of proxy ask latency

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// State containing the Prometheus handle for metrics export
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

/// Install the Prometheus recorder and describe every metric.
pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_metric_descriptions();

    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    // Topology
    describe_gauge!(
        "fleetmount_contexts_active",
        "Number of live topology contexts on this member"
    );
    describe_counter!(
        "fleetmount_mastership_changes_total",
        "Total number of mastership gains and losses"
    );
    describe_counter!(
        "fleetmount_singleton_registration_failures_total",
        "Total number of failed cluster singleton registration attempts"
    );

    // Mounts
    describe_gauge!(
        "fleetmount_mounts_active",
        "Number of local mount points by role"
    );
    describe_counter!(
        "fleetmount_mount_registrations_total",
        "Total number of mount point registrations by role"
    );
    describe_counter!(
        "fleetmount_schema_resolutions_total",
        "Total number of slave schema resolutions by outcome"
    );

    // Proxies
    describe_counter!(
        "fleetmount_proxy_asks_total",
        "Total number of asks sent to master actors"
    );
    describe_histogram!(
        "fleetmount_proxy_ask_duration_seconds",
        "Round-trip duration of asks sent to master actors"
    );
}

/// Update the live topology context gauge
pub fn set_contexts_active(count: usize) {
    gauge!("fleetmount_contexts_active").set(count as f64);
}

/// Record a mastership transition (`gained` or `lost`)
pub fn record_mastership_change(transition: &str) {
    counter!(
        "fleetmount_mastership_changes_total",
        "transition" => transition.to_string()
    )
    .increment(1);
}

/// Record a failed singleton registration attempt
pub fn record_registration_failure() {
    counter!("fleetmount_singleton_registration_failures_total").increment(1);
}

/// Record a mount registration
pub fn record_mount_registered(role: &str) {
    counter!("fleetmount_mount_registrations_total", "role" => role.to_string()).increment(1);
    gauge!("fleetmount_mounts_active", "role" => role.to_string()).increment(1.0);
}

/// Record a mount unregistration
pub fn record_mount_unregistered(role: &str) {
    gauge!("fleetmount_mounts_active", "role" => role.to_string()).decrement(1.0);
}

/// Record the outcome of a schema resolution (`resolved`, `retried`, `failed`, `stale`)
pub fn record_schema_resolution(outcome: &str) {
    counter!(
        "fleetmount_schema_resolutions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one ask sent to a master actor
pub fn record_proxy_ask(request: &str, outcome: &str, duration: Duration) {
    counter!(
        "fleetmount_proxy_asks_total",
        "request" => request.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "fleetmount_proxy_ask_duration_seconds",
        "request" => request.to_string()
    )
    .record(duration.as_secs_f64());
}
