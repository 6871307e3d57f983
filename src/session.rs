//! Session configuration and feed discovery.
//!
//! A session is established once per process. The first packets on the feed
//! tell us which channels the instrument sends, how often it transmits and
//! at what sampling rate; the caller's channel selection is then checked
//! against what was discovered.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calibration::Inventory;
use crate::packet::Packet;
use crate::segment::{StreamId, seconds_between};
use crate::source::{PacketSource, SourceError};

/// Station code meaning "no station configured".
pub const DEFAULT_STATION: &str = "Z0000";

/// Network code Raspberry Shakes report under.
pub const DEFAULT_NETWORK: &str = "AM";

/// Location code stamped on every segment.
pub const LOCATION_CODE: &str = "00";

/// Errors while establishing a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(
        "Channel {requested} not in channel list. Available channels are: {}",
        available.join(", ")
    )]
    UnknownChannel {
        requested: String,
        available: Vec<String>,
    },

    #[error("Packet source failed during channel discovery: {0}")]
    Source(#[from] SourceError),
}

impl SessionError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::UnknownChannel { .. } => 2,
            SessionError::Source(_) => 1,
        }
    }
}

/// Which channels a session keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelSelection {
    /// Every channel the instrument sends.
    #[default]
    All,

    /// Only these channel codes.
    Only(Vec<String>),
}

impl ChannelSelection {
    /// Build a selection from explicit channel codes. Codes are uppercased;
    /// a single `all` entry selects everything.
    pub fn from_list<I, S>(channels: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels: Vec<String> = channels
            .into_iter()
            .map(|c| c.as_ref().trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();

        match channels.as_slice() {
            [] => Err("empty channel selection".to_string()),
            [only] if only == "ALL" => Ok(Self::All),
            _ => Ok(Self::Only(channels)),
        }
    }
}

impl FromStr for ChannelSelection {
    type Err = String;

    /// `all`, or a comma-separated list such as `EHZ,ENE`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_list(s.split(','))
    }
}

/// Caller-supplied session parameters.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub network: String,
    pub station: String,
    pub channels: ChannelSelection,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            station: DEFAULT_STATION.to_string(),
            channels: ChannelSelection::All,
        }
    }
}

/// What the first packets revealed about the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    /// Every channel seen, sorted.
    pub channels: Vec<String>,

    /// Time between two packets of the same channel, in milliseconds.
    pub transmission_interval_ms: u64,

    /// Samples per second.
    pub sampling_rate: f64,

    /// Start time of the packet that ended discovery.
    pub reference_time: Option<DateTime<Utc>>,
}

/// Read packets until a channel repeats, deriving channels and timing.
///
/// Datagrams that fail to parse are skipped. Every packet read here is
/// consumed; none of them become segments.
pub async fn discover<S: PacketSource>(source: &mut S) -> Result<Discovery, SessionError> {
    let mut first_seen: HashMap<String, (DateTime<Utc>, usize)> = HashMap::new();

    loop {
        let datagram = source.recv().await?;
        let packet = match Packet::from_bytes(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Skipping packet during discovery: {}", e);
                continue;
            }
        };

        let seen = first_seen.get(&packet.channel).copied();
        let Some((first_time, sample_count)) = seen else {
            first_seen.insert(packet.channel, (packet.timestamp, packet.samples.len()));
            continue;
        };

        let interval_ms = (seconds_between(first_time, packet.timestamp) * 1000.0).round();
        if interval_ms < 1.0 {
            warn!(
                "Channel {} repeated without advancing in time, continuing discovery",
                packet.channel
            );
            first_seen.insert(packet.channel, (packet.timestamp, packet.samples.len()));
            continue;
        }

        let transmission_interval_ms = interval_ms as u64;
        let sampling_rate = (sample_count as f64 * 1000.0 / interval_ms).round().max(1.0);

        let mut channels: Vec<String> = first_seen.into_keys().collect();
        channels.sort();

        info!("Transmission every: {} ms", transmission_interval_ms);
        info!(
            "Got data with sampling rate {} Hz (calculated from channel {})",
            sampling_rate, packet.channel
        );
        info!("Found {} channel(s): {:?}", channels.len(), channels);

        return Ok(Discovery {
            channels,
            transmission_interval_ms,
            sampling_rate,
            reference_time: Some(packet.timestamp),
        });
    }
}

/// Immutable configuration shared by the trace builder and accumulator.
#[derive(Debug, Clone)]
pub struct Session {
    network: String,
    station: String,
    location: String,
    transmission_interval_ms: u64,
    sampling_rate: f64,
    reference_time: Option<DateTime<Utc>>,
    discovered: Vec<String>,
    channels: Vec<String>,
    inventory: Option<Arc<Inventory>>,
}

impl Session {
    /// Discover the feed and apply the channel selection.
    pub async fn establish<S: PacketSource>(
        source: &mut S,
        params: SessionParams,
    ) -> Result<Self, SessionError> {
        let discovery = discover(source).await?;
        Self::from_discovery(params, discovery)
    }

    /// Apply the channel selection in `params` to a completed discovery.
    pub fn from_discovery(params: SessionParams, discovery: Discovery) -> Result<Self, SessionError> {
        let channels = match params.channels {
            ChannelSelection::All => discovery.channels.clone(),
            ChannelSelection::Only(requested) => {
                for channel in &requested {
                    if !discovery.channels.contains(channel) {
                        return Err(SessionError::UnknownChannel {
                            requested: channel.clone(),
                            available: discovery.channels,
                        });
                    }
                }
                requested
            }
        };
        info!("Using channels {:?}", channels);

        Ok(Self {
            network: params.network,
            station: params.station,
            location: LOCATION_CODE.to_string(),
            transmission_interval_ms: discovery.transmission_interval_ms,
            sampling_rate: discovery.sampling_rate,
            reference_time: discovery.reference_time,
            discovered: discovery.channels,
            channels,
            inventory: None,
        })
    }

    /// Record the outcome of calibration resolution.
    pub fn with_inventory(mut self, inventory: Option<Arc<Inventory>>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn transmission_interval_ms(&self) -> u64 {
        self.transmission_interval_ms
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Feed time at the end of discovery, if known.
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.reference_time
    }

    /// Every channel the feed carries.
    pub fn discovered_channels(&self) -> &[String] {
        &self.discovered
    }

    /// Channels this session keeps.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn inventory(&self) -> Option<&Arc<Inventory>> {
        self.inventory.as_ref()
    }

    /// Whether packets for `channel` are kept.
    pub fn accepts(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// Full stream identifier for `channel`.
    pub fn stream_id(&self, channel: &str) -> StreamId {
        StreamId::new(&self.network, &self.station, &self.location, channel)
    }
}
