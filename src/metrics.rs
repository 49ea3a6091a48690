//! Prometheus metrics exposition server.
//!
//! This module provides an HTTP server that exposes logmailer metrics
//! in Prometheus format on a configurable port.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How often the uptime gauge is refreshed.
pub const UPTIME_REFRESH: Duration = Duration::from_secs(15);

/// Register all metric descriptions for Prometheus.
///
/// Called once after the recorder is installed; descriptions become the
/// HELP text of each metric.
pub fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Counters
    describe_counter!(
        "logmailer_events_total",
        "Total number of log events appended to the buffer"
    );
    describe_counter!(
        "logmailer_triggers_total",
        "Total number of events that triggered a send"
    );
    describe_counter!(
        "logmailer_triggers_suppressed_total",
        "Total number of triggering events suppressed by the rate limit"
    );
    describe_counter!(
        "logmailer_triggers_coalesced_total",
        "Total number of triggers folded into an already pending send"
    );
    describe_counter!(
        "logmailer_sends_total",
        "Total number of completed send attempts, by outcome"
    );
    describe_counter!(
        "logmailer_parse_errors_total",
        "Total number of input lines that could not be parsed"
    );

    // Gauges
    describe_gauge!(
        "logmailer_buffer_size",
        "Current number of events held in the cyclic buffer"
    );
    describe_gauge!(
        "logmailer_pending_sends",
        "Current number of sends waiting for the dispatch worker"
    );
    describe_gauge!(
        "logmailer_uptime_seconds",
        "Time in seconds since logmailer started"
    );
    describe_gauge!(
        "logmailer_build_info",
        "Build information with version label (always 1)"
    );

    // Histograms
    describe_histogram!(
        "logmailer_send_duration_seconds",
        "Time spent composing and delivering one message"
    );
}

/// Prometheus exposition endpoint serving `/metrics`.
pub struct MetricsServer {
    port: u16,
    /// Fired once the recorder is installed; metrics emitted before that
    /// are lost.
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsServer {
    /// Port 0 lets the OS pick one.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ready_tx: None,
        }
    }

    pub fn with_ready_signal(port: u16, ready_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            port,
            ready_tx: Some(ready_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install the global recorder and serve until `cancel` fires.
    ///
    /// While serving, `logmailer_uptime_seconds` is refreshed every
    /// [`UPTIME_REFRESH`].
    ///
    /// # Errors
    /// Returns an error if the exporter cannot be installed, for instance
    /// when the port is taken or a recorder already exists.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let started = Instant::now();

        // one recorder per process
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
        register_metric_descriptions();

        if let Some(tx) = self.ready_tx {
            let _ = tx.send(());
        }
        info!(port = self.port, "Metrics server started on /metrics");

        let mut refresh = tokio::time::interval(UPTIME_REFRESH);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {
                    metrics::gauge!("logmailer_uptime_seconds").set(started.elapsed().as_secs_f64());
                }
            }
        }

        info!("Metrics server shutting down");
        Ok(())
    }
}

/// Initialize all known metrics to their default values.
///
/// Called right after the recorder is installed so every metric shows up
/// in `/metrics` before the first event.
pub fn initialize_metrics() {
    use metrics::{counter, gauge};

    gauge!("logmailer_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    gauge!("logmailer_uptime_seconds").set(0.0);
    gauge!("logmailer_buffer_size").set(0.0);
    gauge!("logmailer_pending_sends").set(0.0);

    counter!("logmailer_events_total").absolute(0);
    counter!("logmailer_triggers_total").absolute(0);
    counter!("logmailer_triggers_suppressed_total").absolute(0);
    counter!("logmailer_triggers_coalesced_total").absolute(0);
    counter!("logmailer_sends_total", "outcome" => "success").absolute(0);
    counter!("logmailer_sends_total", "outcome" => "failure").absolute(0);
    counter!("logmailer_parse_errors_total", "error_type" => "no_match").absolute(0);

    tracing::debug!("Metrics initialized to zero");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    static TEST_PORT: OnceLock<u16> = OnceLock::new();

    fn get_test_port() -> u16 {
        *TEST_PORT.get_or_init(|| {
            let port = portpicker::pick_unused_port().expect("No free port");

            let cancel = CancellationToken::new();
            let server = MetricsServer::new(port);

            std::thread::spawn(move || {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let _ = server.run(cancel).await;
                });
            });

            std::thread::sleep(Duration::from_millis(500));

            port
        })
    }

    #[tokio::test]
    async fn metrics_server_starts_and_responds() {
        let port = get_test_port();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://127.0.0.1:{}/metrics", port))
            .send()
            .await
            .expect("Request should succeed");

        assert!(resp.status().is_success(), "Should return 200 OK");
    }

    #[tokio::test]
    async fn metrics_format_is_valid_prometheus() {
        let port = get_test_port();

        metrics::counter!("logmailer_sends_total", "outcome" => "success").increment(1);

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://127.0.0.1:{}/metrics", port))
            .send()
            .await
            .expect("Request should succeed");

        let body = resp.text().await.expect("Should have body");

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let first_char = line.chars().next().unwrap_or(' ');
            assert!(
                first_char == '#' || first_char.is_alphabetic() || first_char == '_',
                "Invalid Prometheus line: {}",
                line
            );
        }
    }

    #[tokio::test]
    async fn metrics_incremented_appear_in_output() {
        let port = get_test_port();

        metrics::counter!("logmailer_sends_total", "outcome" => "failure").increment(42);
        metrics::counter!("logmailer_triggers_coalesced_total").increment(10);
        metrics::gauge!("logmailer_buffer_size").set(5.0);

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://127.0.0.1:{}/metrics", port))
            .send()
            .await
            .expect("Request should succeed");

        let body = resp.text().await.expect("Should have body");

        assert!(
            body.contains("logmailer_sends_total"),
            "Should contain sends metric. Body: {}",
            body
        );
        assert!(
            body.contains("outcome=\"failure\""),
            "Should contain outcome label. Body: {}",
            body
        );
        assert!(body.contains("logmailer_triggers_coalesced_total"));
        assert!(body.contains("logmailer_uptime_seconds"));
    }

    #[test]
    fn new_creates_server_with_port() {
        let server = MetricsServer::new(9090);
        assert_eq!(server.port(), 9090);
    }

    #[test]
    fn new_with_port_zero_allowed() {
        let server = MetricsServer::new(0);
        assert_eq!(server.port(), 0);
    }
}
