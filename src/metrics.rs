//! Transmission metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless
//! `init_metrics` installed the Prometheus recorder.

use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Install the Prometheus exporter listening on `addr`. Idempotent.
pub fn init_metrics(addr: &str) {
    INIT.call_once(|| {
        let addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("Invalid metrics addr '{}': {}; metrics disabled", addr, e);
                return;
            }
        };
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    });
}

pub mod transmission {
    /// Outcome label: processed, rejected, retryable, reconciled.
    pub fn attempt_finished(outcome: &'static str) {
        ::metrics::counter!("dte_transmissions_total", "outcome" => outcome).increment(1);
    }

    pub fn signing_performed() {
        ::metrics::counter!("dte_signatures_total").increment(1);
    }

    pub fn authority_call(operation: &'static str, duration_secs: f64) {
        ::metrics::histogram!("dte_authority_call_duration_seconds", "operation" => operation)
            .record(duration_secs);
    }

    pub fn in_flight_wait() {
        ::metrics::counter!("dte_in_flight_waits_total").increment(1);
    }

    pub fn annulment_finished(success: bool) {
        let outcome = if success { "annulled" } else { "failed" };
        ::metrics::counter!("dte_annulments_total", "outcome" => outcome).increment(1);
    }
}

pub mod queue {
    pub fn job_enqueued() {
        ::metrics::counter!("dte_jobs_enqueued_total").increment(1);
    }

    pub fn job_completed() {
        ::metrics::counter!("dte_jobs_completed_total").increment(1);
    }

    pub fn job_retried() {
        ::metrics::counter!("dte_jobs_retried_total").increment(1);
    }

    pub fn job_failed() {
        ::metrics::counter!("dte_jobs_failed_total").increment(1);
    }
}
