//! Stream accumulator: keeps a [`SeriesCollection`] growing, one segment at a time.
//!
//! Malformed packets and packets for unselected channels never reach the
//! caller: the accumulator simply pulls the next packet. Only a failing
//! packet source ends a call with an error.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::builder::TraceBuilder;
use crate::collection::SeriesCollection;
use crate::error::StreamError;
use crate::merge::MergeOptions;
use crate::segment::{Segment, StreamId};
use crate::source::PacketSource;

pub struct StreamAccumulator<S> {
    builder: TraceBuilder<S>,
    retention: Option<Duration>,
}

impl<S: PacketSource> StreamAccumulator<S> {
    pub fn new(builder: TraceBuilder<S>) -> Self {
        Self {
            builder,
            retention: None,
        }
    }

    /// Keep only the most recent `window` of data after each merge.
    pub fn with_retention(mut self, window: Duration) -> Self {
        self.retention = Some(window);
        self
    }

    pub fn builder(&self) -> &TraceBuilder<S> {
        &self.builder
    }

    /// Pull packets until one becomes a segment.
    async fn next_segment(&mut self) -> Result<Segment, StreamError> {
        let mut skipped = 0u64;
        loop {
            match self.builder.build_segment().await {
                Ok(Some(segment)) => {
                    if skipped > 0 {
                        debug!("Recovered after {} rejected packet(s)", skipped);
                    }
                    return Ok(segment);
                }
                Ok(None) => {}
                Err(e @ StreamError::ImplausibleTimestamp { .. }) => {
                    skipped += 1;
                    warn!("Discarding packet: {}", e);
                }
                Err(e) if e.is_transient() => {
                    skipped += 1;
                    debug!("Discarding packet: {}", e);
                }
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Start a new collection holding the first good segment from the feed.
    pub async fn init_series(&mut self) -> Result<SeriesCollection, StreamError> {
        info!("Initializing series collection");

        let segment = self.next_segment().await?;
        let mut collection = SeriesCollection::new();
        collection.push(segment);

        if let Some(inventory) = self.builder.session().inventory() {
            info!("Attaching inventory response");
            for e in collection.attach_inventory(Arc::clone(inventory)) {
                warn!("Series left uncalibrated: {}", e);
            }
        }

        Ok(collection)
    }

    /// Append the next good segment and merge down to one series per channel.
    ///
    /// `options` is passed through to the merge unchanged. Returns the
    /// stream the new segment belongs to.
    pub async fn accumulate(
        &mut self,
        collection: &mut SeriesCollection,
        options: &MergeOptions,
    ) -> Result<StreamId, StreamError> {
        let segment = self.next_segment().await?;
        let id = segment.id().clone();

        collection.push(segment);
        for e in collection.merge(options) {
            warn!("Discarding segment: {}", e);
        }

        if let Some(window) = self.retention {
            collection.trim(window);
        }

        Ok(id)
    }
}
