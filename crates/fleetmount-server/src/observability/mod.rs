//! Observability Module
//!
//! - `metrics`: Prometheus metrics for contexts, mounts and proxy asks
//! - `events`: Structured event logging with consistent fields
//! - `tracing`: Subscriber setup with optional OpenTelemetry export
//! - `supervision`: Retry policies for reconnects and mount requests

pub mod events;
pub mod metrics;
pub mod supervision;
pub mod tracing;

pub use metrics::{init_metrics, MetricsState};
pub use supervision::{RetryPolicy, RetryTracker};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};
