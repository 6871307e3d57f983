//! shake-stream - assemble Raspberry Shake UDP packets into per-channel seismic series.
//!
//! This crate provides:
//! - A nom-based parser validating raw datagrams into typed packets
//! - Session discovery of channels, transmission interval and sampling rate
//! - A trace builder and stream accumulator that merge packets into one
//!   gap-aware series per channel
//! - Best-effort calibration from FDSN StationXML inventories
//! - Statistics tracking with HDR histograms and a Prometheus endpoint
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use shake_stream::{
//!     FeedStats, MergeOptions, Session, SessionParams, StreamAccumulator, TraceBuilder,
//!     UdpSource,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut source = UdpSource::bind(8888, Duration::from_secs(10)).await?;
//! let session = Session::establish(&mut source, SessionParams::default()).await?;
//!
//! let builder = TraceBuilder::new(source, Arc::new(session), Arc::new(FeedStats::new()));
//! let mut accumulator = StreamAccumulator::new(builder);
//!
//! let mut collection = accumulator.init_series().await?;
//! loop {
//!     accumulator.accumulate(&mut collection, &MergeOptions::default()).await?;
//!     for series in collection.series() {
//!         println!("{}: {} samples", series.id(), series.len());
//!     }
//! }
//! # }
//! ```

pub mod accumulator;
pub mod builder;
pub mod calibration;
pub mod collection;
pub mod config;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod packet;
pub mod samples;
pub mod segment;
pub mod session;
pub mod source;
pub mod stats;

pub use accumulator::StreamAccumulator;
pub use builder::TraceBuilder;
pub use calibration::{ChannelResponse, HttpInventoryFetcher, Inventory, InventoryFetcher};
pub use collection::SeriesCollection;
pub use config::Config;
pub use error::{ErrorKind, StreamError};
pub use merge::{GapFill, MergeOptions, OverlapPolicy};
pub use packet::{Packet, PacketError, parse_packet};
pub use samples::MaskedSamples;
pub use segment::{ChannelSeries, Gap, Segment, StreamId};
pub use session::{ChannelSelection, Session, SessionError, SessionParams};
pub use source::{PacketSource, ReplaySource, SourceError, UdpSource};
pub use stats::{FeedStats, StatsSummary};
