//! Trace builder: one packet in, at most one segment out.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::merge::DEFAULT_MAX_GAP;
use crate::packet::{Packet, PacketError, looks_like_packet};
use crate::segment::{Segment, seconds_between};
use crate::session::Session;
use crate::source::PacketSource;
use crate::stats::FeedStats;

/// Pulls packets from a source and turns them into [`Segment`]s.
pub struct TraceBuilder<S> {
    source: S,
    session: Arc<Session>,
    stats: Arc<FeedStats>,
    max_jump: Duration,
    // Latest start time accepted so far.
    feed_time: Option<DateTime<Utc>>,
}

impl<S: PacketSource> TraceBuilder<S> {
    pub fn new(source: S, session: Arc<Session>, stats: Arc<FeedStats>) -> Self {
        let feed_time = session.reference_time();
        Self {
            source,
            session,
            stats,
            max_jump: DEFAULT_MAX_GAP,
            feed_time,
        }
    }

    /// Reject packets starting more than `max_jump` away from the feed's
    /// latest accepted start time.
    pub fn with_max_jump(mut self, max_jump: Duration) -> Self {
        self.max_jump = max_jump;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }

    /// Build a segment from the next packet.
    ///
    /// Returns `Ok(None)` when the packet belongs to a channel outside the
    /// session's selection; the caller should simply ask again. A packet
    /// that fails to parse yields a transient [`StreamError::Packet`], one
    /// whose start time is implausibly far from the feed a transient
    /// [`StreamError::ImplausibleTimestamp`], and a failing source a fatal
    /// [`StreamError::Source`].
    pub async fn build_segment(&mut self) -> Result<Option<Segment>, StreamError> {
        let datagram = self.source.recv().await?;
        self.stats.record_datagram(datagram.len());

        if !looks_like_packet(&datagram) {
            self.stats.record_parse_failure();
            return Err(PacketError::InvalidFormat("not a data packet".to_string()).into());
        }

        let packet = Packet::from_bytes(&datagram).inspect_err(|_| {
            self.stats.record_parse_failure();
        })?;

        if !self.session.accepts(&packet.channel) {
            self.stats.record_filtered();
            debug!("Dropping packet for unselected channel {}", packet.channel);
            return Ok(None);
        }

        if let Some(reference) = self.feed_time
            && seconds_between(reference, packet.timestamp).abs() > self.max_jump.as_secs_f64()
        {
            self.stats.record_timestamp_rejection();
            return Err(StreamError::ImplausibleTimestamp {
                channel: packet.channel,
                timestamp: packet.timestamp,
                reference,
            });
        }
        self.feed_time = Some(
            self.feed_time
                .map_or(packet.timestamp, |t| t.max(packet.timestamp)),
        );

        self.stats.record_latency(packet.timestamp);

        let id = self.session.stream_id(&packet.channel);
        let mut segment = Segment::new(
            id,
            packet.timestamp,
            self.session.sampling_rate(),
            packet.samples,
        );

        if let Some(inventory) = self.session.inventory() {
            match inventory.attach(segment.id(), segment.start()) {
                Ok(response) => segment = segment.with_response(response),
                Err(e) => {
                    self.stats.record_attach_failure();
                    warn!(
                        "Error attaching inventory response: {}. Are you sure you set the station name correctly?",
                        e
                    );
                    warn!(
                        "This could indicate a mismatch in the number of data channels between the inventory ({}) and the stream ({})",
                        inventory.channel_count(self.session.network(), self.session.station()),
                        self.session.discovered_channels().len()
                    );
                }
            }
        }

        self.stats.record_segment(&segment.id().channel);
        debug!(
            "Built segment {} starting {} with {} samples",
            segment.id(),
            segment.start(),
            segment.len()
        );

        Ok(Some(segment))
    }
}
