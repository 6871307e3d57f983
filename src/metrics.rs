//! Prometheus metrics HTTP server.
//!
//! Exposes feed statistics in Prometheus text format via HTTP endpoint.

use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::stats::FeedStats;

/// Start the Prometheus metrics HTTP server.
///
/// Runs until the process exits and serves metrics at `/metrics`.
/// Returns an error if the server fails to bind to the port.
pub async fn start_metrics_server(
    port: u16,
    stats: Arc<FeedStats>,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(stats);

    let listener = TcpListener::bind(addr).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(stats): State<Arc<FeedStats>>) -> impl IntoResponse {
    let output = format_prometheus_metrics(&stats);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Append one un-labelled metric with its help and type lines.
fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
    let _ = writeln!(output, "{} {}", name, value);
}

/// Format statistics as Prometheus text format.
fn format_prometheus_metrics(stats: &FeedStats) -> String {
    let summary = stats.summary();
    let mut output = String::with_capacity(2048);

    push_metric(
        &mut output,
        "shake_uptime_seconds",
        "gauge",
        "Time since the stream started",
        format!("{:.3}", summary.elapsed_secs),
    );
    push_metric(
        &mut output,
        "shake_datagrams_total",
        "counter",
        "Datagrams received from the packet source",
        summary.datagrams_received,
    );
    push_metric(
        &mut output,
        "shake_bytes_received_total",
        "counter",
        "Total bytes of raw datagrams",
        summary.bytes_received,
    );
    push_metric(
        &mut output,
        "shake_parse_failures_total",
        "counter",
        "Datagrams that failed to parse",
        summary.parse_failures,
    );
    push_metric(
        &mut output,
        "shake_packets_filtered_total",
        "counter",
        "Packets dropped by the channel filter",
        summary.packets_filtered,
    );
    push_metric(
        &mut output,
        "shake_timestamp_rejections_total",
        "counter",
        "Packets rejected for an implausible start time",
        summary.timestamp_rejections,
    );
    push_metric(
        &mut output,
        "shake_attach_failures_total",
        "counter",
        "Segments without a matching calibration response",
        summary.attach_failures,
    );
    push_metric(
        &mut output,
        "shake_segments_per_second",
        "gauge",
        "Current segment rate",
        format!("{:.3}", summary.segments_per_second),
    );

    // Segments by channel
    output.push_str("# HELP shake_segments_total Segments built per channel\n");
    output.push_str("# TYPE shake_segments_total counter\n");
    let mut channels: Vec<_> = summary.segments_by_channel.iter().collect();
    channels.sort();
    for (channel, count) in channels {
        let _ = writeln!(output, "shake_segments_total{{channel=\"{}\"}} {}", channel, count);
    }
    if summary.segments_by_channel.is_empty() {
        let _ = writeln!(output, "shake_segments_total {}", summary.segments_built);
    }

    if let Some(ref latency) = summary.latency_ms {
        output.push_str("# HELP shake_packet_latency_ms Delay from first sample to arrival\n");
        output.push_str("# TYPE shake_packet_latency_ms summary\n");
        let _ = writeln!(output, "shake_packet_latency_ms{{quantile=\"0.5\"}} {}", latency.p50);
        let _ = writeln!(output, "shake_packet_latency_ms{{quantile=\"0.9\"}} {}", latency.p90);
        let _ = writeln!(output, "shake_packet_latency_ms{{quantile=\"0.99\"}} {}", latency.p99);
        let _ = writeln!(output, "shake_packet_latency_ms_count {}", summary.segments_built);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_before_any_datagram() {
        let stats = FeedStats::new();
        let output = format_prometheus_metrics(&stats);

        assert!(output.contains("shake_uptime_seconds"));
        assert!(output.contains("shake_parse_failures_total 0"));
        assert!(output.contains("shake_segments_total 0"));
        assert!(!output.contains("shake_packet_latency_ms"));
    }

    #[test]
    fn test_metrics_after_feed_activity() {
        let stats = FeedStats::new();

        stats.record_datagram(100);
        stats.record_segment("EHZ");
        stats.record_latency(chrono::Utc::now());

        let output = format_prometheus_metrics(&stats);

        assert!(output.contains("shake_datagrams_total 1"));
        assert!(output.contains("shake_bytes_received_total 100"));
        assert!(output.contains("shake_segments_total{channel=\"EHZ\"} 1"));
        assert!(output.contains("shake_packet_latency_ms_count 1"));
    }

    #[test]
    fn test_every_sample_line_is_name_value() {
        let stats = FeedStats::new();
        stats.record_segment("ENE");
        let output = format_prometheus_metrics(&stats);

        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            assert!(parts.len() >= 2, "Invalid metric line: {}", line);
        }
    }
}
