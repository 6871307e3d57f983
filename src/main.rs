//! shake-stream CLI - Stream Raspberry Shake packets into per-channel series.

use anyhow::Result;
use clap::Parser;
use shake_stream::{
    Config, FeedStats, GapFill, HttpInventoryFetcher, MergeOptions, OverlapPolicy, PacketSource,
    ReplaySource, SeriesCollection, Session, SessionError, SourceError, StreamAccumulator,
    StreamError, TraceBuilder, UdpSource, calibration, metrics::start_metrics_server,
    session::ChannelSelection,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// shake-stream - Assemble Raspberry Shake UDP packets into gap-aware series
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "SHAKE_CONFIG")]
    config: Option<PathBuf>,

    /// UDP port to listen on
    #[arg(short, long, env = "SHAKE_PORT")]
    port: Option<u16>,

    /// Network code
    #[arg(short, long, env = "SHAKE_NETWORK")]
    network: Option<String>,

    /// Station code (Z0000 = none, skips inventory)
    #[arg(short, long, env = "SHAKE_STATION")]
    station: Option<String>,

    /// Receive and fetch timeout in seconds
    #[arg(short, long, env = "SHAKE_TIMEOUT")]
    timeout: Option<u64>,

    /// Channels to keep: "all" or a comma-separated list
    #[arg(short, long, env = "SHAKE_CHANNELS")]
    channels: Option<ChannelSelection>,

    /// Gap fill: masked, latest, interpolate, or an integer
    #[arg(long, env = "SHAKE_FILL")]
    fill: Option<GapFill>,

    /// Overlap policy: mask or later
    #[arg(long, env = "SHAKE_OVERLAP")]
    overlap: Option<OverlapPolicy>,

    /// Seconds of data to keep per channel (0 = unlimited)
    #[arg(long, env = "SHAKE_RETENTION")]
    retention: Option<u64>,

    /// Widest gap in seconds to bridge when merging
    #[arg(long, env = "SHAKE_MAX_GAP")]
    max_gap: Option<u64>,

    /// Replay newline-separated datagrams from a file instead of listening
    #[arg(long, env = "SHAKE_REPLAY")]
    replay: Option<PathBuf>,

    /// Print a report every N seconds
    #[arg(long, env = "SHAKE_STATS_INTERVAL")]
    stats_interval: Option<u64>,

    /// Serve Prometheus metrics
    #[arg(long, env = "SHAKE_METRICS")]
    metrics: bool,

    /// Port for the metrics endpoint
    #[arg(long, env = "SHAKE_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Print the final statistics as JSON
    #[arg(long, env = "SHAKE_JSON")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SHAKE_LOG_LEVEL")]
    log_level: String,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "SHAKE_MAX_RUNTIME")]
    max_runtime: u64,
}

impl Args {
    /// Overlay command-line values on the file configuration.
    fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref network) = self.network {
            config.network = network.clone();
        }
        if let Some(ref station) = self.station {
            config.station = station.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(ref channels) = self.channels {
            config.channels = channels.clone();
        }
        if let Some(fill) = self.fill {
            config.fill = fill;
        }
        if let Some(overlap) = self.overlap {
            config.overlap = overlap;
        }
        if let Some(retention) = self.retention {
            config.retention = retention;
        }
        if let Some(max_gap) = self.max_gap {
            config.max_gap = max_gap;
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval = interval;
        }
        if self.metrics {
            config.metrics_enabled = true;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match args.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let config = args.apply(config);

    info!("shake-stream starting...");
    info!("Station: {}.{}", config.network, config.station);

    match args.replay {
        Some(ref path) => {
            let source = ReplaySource::from_file(path).await?;
            run(source, config, &args, true).await
        }
        None => {
            let timeout = Duration::from_secs(config.timeout);
            let source = UdpSource::bind(config.port, timeout).await?;
            run(source, config, &args, false).await
        }
    }
}

/// Whether `result` is the clean end of a finite source.
fn is_end_of_input<T>(result: &Result<T, StreamError>, finite: bool) -> bool {
    finite && matches!(result, Err(StreamError::Source(SourceError::Closed)))
}

/// Establish the session and stream until shutdown or feed loss.
///
/// With a `finite` source, running out of packets ends the stream normally.
async fn run<S: PacketSource>(
    mut source: S,
    config: Config,
    args: &Args,
    finite: bool,
) -> Result<()> {
    let session = match Session::establish(&mut source, config.session_params()).await {
        Ok(session) => session,
        Err(e @ SessionError::UnknownChannel { .. }) => {
            error!("ERROR: {}", e);
            std::process::exit(e.exit_code());
        }
        Err(e) => return Err(e.into()),
    };

    let fetcher = HttpInventoryFetcher::new(
        config.inventory_host.as_str(),
        Duration::from_secs(config.timeout),
    )?;
    let inventory = calibration::resolve(session.network(), session.station(), &fetcher).await;
    let session = Arc::new(session.with_inventory(inventory));

    let stats = Arc::new(FeedStats::new());

    if config.metrics_enabled {
        let stats_clone = Arc::clone(&stats);
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, stats_clone).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    // Create shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx_clone.send(true);
        }
    });

    // Optional max runtime
    if args.max_runtime > 0 {
        let shutdown_tx_clone = shutdown_tx.clone();
        let max_runtime = args.max_runtime;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(max_runtime)).await;
            info!("Max runtime reached");
            let _ = shutdown_tx_clone.send(true);
        });
    }

    let options = config.merge_options();
    let builder = TraceBuilder::new(source, session, Arc::clone(&stats))
        .with_max_jump(options.max_gap);
    let mut accumulator = StreamAccumulator::new(builder);
    if config.retention > 0 {
        accumulator = accumulator.with_retention(Duration::from_secs(config.retention));
    }

    let report_interval = Duration::from_secs(config.stats_interval.max(1));
    let mut last_report = Instant::now();

    let init = accumulator.init_series().await;
    if is_end_of_input(&init, finite) {
        info!("Replay ended before any segment was built");
        println!("{}", stats.summary());
        return Ok(());
    }
    let mut collection = init?;
    let mut outcome = Ok(());

    // Main accumulation loop
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            result = accumulator.accumulate(&mut collection, &options) => {
                if is_end_of_input(&result, finite) {
                    info!("Replay finished");
                    break;
                }
                if let Err(e) = result {
                    error!("Feed lost: {}", e);
                    outcome = Err(e.into());
                    break;
                }
            }
        }

        if last_report.elapsed() >= report_interval {
            print_series(&collection, &options);
            println!("{}", stats.summary());
            last_report = Instant::now();
        }
    }

    // Print final statistics
    println!("\n\nFINAL STATE");
    print_series(&collection, &options);
    let summary = stats.summary();
    if args.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Could not serialize statistics: {}", e),
        }
    } else {
        println!("{}", summary);
    }

    outcome
}

/// Print one line per channel series.
fn print_series(collection: &SeriesCollection, options: &MergeOptions) {
    println!(
        "\n{} series (overlap: {}, fill: {})",
        collection.len(),
        options.overlap,
        options.fill
    );
    for series in collection.series() {
        println!(
            "  {} | {} - {} | {} Hz | {} samples | {} gap(s){}",
            series.id(),
            series.start().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            series.end().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            series.sampling_rate(),
            series.len(),
            series.gaps().len(),
            if series.response().is_some() {
                " | calibrated"
            } else {
                ""
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "shake-stream",
            "--station",
            "R0000",
            "--channels",
            "EHZ,ENE",
            "--fill",
            "latest",
            "--metrics",
        ]);
        let config = args.apply(Config::default());

        assert_eq!(config.station, "R0000");
        assert_eq!(
            config.channels,
            ChannelSelection::Only(vec!["EHZ".into(), "ENE".into()])
        );
        assert_eq!(config.fill, GapFill::Latest);
        assert!(config.metrics_enabled);
        // Untouched values keep the config's defaults.
        assert_eq!(config.port, 8888);
        assert_eq!(config.overlap, OverlapPolicy::MaskConflicts);
    }

    #[test]
    fn test_max_gap_flows_into_merge_options() {
        let args = Args::parse_from(["shake-stream", "--max-gap", "120"]);
        let config = args.apply(Config::default());
        assert_eq!(config.merge_options().max_gap, Duration::from_secs(120));
    }

    #[test]
    fn test_closed_replay_is_end_of_input() {
        let closed: Result<(), StreamError> = Err(SourceError::Closed.into());
        assert!(is_end_of_input(&closed, true));
        // A live feed that closes is still a failure.
        assert!(!is_end_of_input(&closed, false));

        let timeout: Result<(), StreamError> =
            Err(SourceError::Timeout(Duration::from_secs(10)).into());
        assert!(!is_end_of_input(&timeout, true));
        assert!(!is_end_of_input(&Ok::<(), StreamError>(()), true));
    }

    #[test]
    fn test_args_reject_bad_fill() {
        assert!(Args::try_parse_from(["shake-stream", "--fill", "sometimes"]).is_err());
    }
}
