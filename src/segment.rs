//! Waveform segments and per-channel series.
//!
//! A [`Segment`] is built from exactly one packet and never changes after
//! construction. A [`ChannelSeries`] starts life as a segment and grows as
//! later segments for the same [`StreamId`] are merged into it.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::calibration::ChannelResponse;
use crate::samples::MaskedSamples;

/// SEED-style identifier of one data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl StreamId {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// Offset of sample `index` from the first sample.
pub(crate) fn sample_offset(index: usize, sampling_rate: f64) -> TimeDelta {
    TimeDelta::microseconds((index as f64 * 1e6 / sampling_rate).round() as i64)
}

/// Signed number of seconds from `from` to `to`.
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// One packet's worth of waveform data.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    id: StreamId,
    start: DateTime<Utc>,
    sampling_rate: f64,
    samples: MaskedSamples,
    response: Option<Arc<ChannelResponse>>,
}

impl Segment {
    pub fn new(
        id: StreamId,
        start: DateTime<Utc>,
        sampling_rate: f64,
        samples: impl Into<MaskedSamples>,
    ) -> Self {
        Self {
            id,
            start,
            sampling_rate,
            samples: samples.into(),
            response: None,
        }
    }

    /// Attach a calibration response.
    pub fn with_response(mut self, response: Arc<ChannelResponse>) -> Self {
        self.response = Some(response);
        self
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Time of the last sample.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + sample_offset(self.samples.len().saturating_sub(1), self.sampling_rate)
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn samples(&self) -> &MaskedSamples {
        &self.samples
    }

    pub fn response(&self) -> Option<&Arc<ChannelResponse>> {
        self.response.as_ref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A stretch of a series with no received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Time of the first missing sample.
    pub start: DateTime<Utc>,

    /// Time of the last missing sample.
    pub end: DateTime<Utc>,

    /// Number of missing samples.
    pub samples: usize,
}

/// The merged time series for one channel.
///
/// Samples lie on a uniform grid starting at [`ChannelSeries::start`], so
/// their timestamps are strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSeries {
    pub(crate) id: StreamId,
    pub(crate) start: DateTime<Utc>,
    pub(crate) sampling_rate: f64,
    pub(crate) samples: MaskedSamples,
    pub(crate) response: Option<Arc<ChannelResponse>>,
}

impl From<Segment> for ChannelSeries {
    fn from(segment: Segment) -> Self {
        Self {
            id: segment.id,
            start: segment.start,
            sampling_rate: segment.sampling_rate,
            samples: segment.samples,
            response: segment.response,
        }
    }
}

impl ChannelSeries {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Time of the last sample.
    pub fn end(&self) -> DateTime<Utc> {
        self.sample_time(self.samples.len().saturating_sub(1))
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn samples(&self) -> &MaskedSamples {
        &self.samples
    }

    pub fn response(&self) -> Option<&Arc<ChannelResponse>> {
        self.response.as_ref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time of sample `index`.
    pub fn sample_time(&self, index: usize) -> DateTime<Utc> {
        self.start + sample_offset(index, self.sampling_rate)
    }

    /// Timestamps of every sample, in order.
    pub fn times(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.samples.len()).map(|i| self.sample_time(i))
    }

    /// Whether `time` falls within the series.
    pub fn covers(&self, time: DateTime<Utc>) -> bool {
        !self.is_empty() && time >= self.start && time <= self.end()
    }

    /// Stretches without received data, whether masked or gap-filled.
    pub fn gaps(&self) -> Vec<Gap> {
        self.samples
            .missing_runs()
            .into_iter()
            .map(|run| Gap {
                start: self.sample_time(run.start),
                end: self.sample_time(run.end - 1),
                samples: run.len(),
            })
            .collect()
    }

    /// Samples converted to physical units with the attached response.
    ///
    /// Returns `None` if the series has no calibration.
    pub fn physical_samples(&self) -> Option<Vec<Option<f64>>> {
        let response = self.response.as_ref()?;
        Some(
            self.samples
                .iter()
                .map(|v| v.map(|count| response.to_physical(count)))
                .collect(),
        )
    }

    pub(crate) fn set_response(&mut self, response: Arc<ChannelResponse>) {
        self.response = Some(response);
    }

    /// Drop every sample earlier than `cutoff`.
    pub(crate) fn trim_before(&mut self, cutoff: DateTime<Utc>) {
        if cutoff <= self.start {
            return;
        }
        let elapsed = seconds_between(self.start, cutoff) * self.sampling_rate;
        let count = (elapsed - 1e-6).ceil().max(0.0) as usize;
        let count = count.min(self.samples.len());

        self.start = self.sample_time(count);
        self.samples.drain_front(count);
    }
}
