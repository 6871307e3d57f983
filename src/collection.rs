//! The per-channel series collection.
//!
//! Segments are appended as-is and only combined when [`SeriesCollection::merge`]
//! runs. After a merge the collection holds at most one series per stream,
//! ordered by stream id.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::calibration::{AttachError, Inventory};
use crate::merge::{MergeError, MergeOptions, check_compatible, merge_series};
use crate::segment::{ChannelSeries, Segment, StreamId};

#[derive(Debug, Clone, Default)]
pub struct SeriesCollection {
    series: Vec<ChannelSeries>,
    inventory: Option<Arc<Inventory>>,
}

impl SeriesCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment as its own series. Call [`merge`](Self::merge) to
    /// fold it into the existing series for its channel.
    pub fn push(&mut self, segment: Segment) {
        let mut series = ChannelSeries::from(segment);
        if series.response.is_none()
            && let Some(inventory) = &self.inventory
            && let Ok(response) = inventory.attach(&series.id, series.start)
        {
            series.set_response(response);
        }
        self.series.push(series);
    }

    /// Merge every group of same-stream series into one.
    ///
    /// The first series held for a stream is the reference. A later series
    /// whose sampling rate disagrees with it, or that lies further from it
    /// than [`MergeOptions::max_gap`], is discarded; the discarded series are
    /// reported back.
    pub fn merge(&mut self, options: &MergeOptions) -> Vec<MergeError> {
        let mut groups: BTreeMap<StreamId, Vec<ChannelSeries>> = BTreeMap::new();
        for series in self.series.drain(..) {
            groups.entry(series.id.clone()).or_default().push(series);
        }

        let mut rejected = Vec::new();
        for parts in groups.into_values() {
            let mut parts = parts.into_iter();
            let Some(reference) = parts.next() else {
                continue;
            };

            let mut accepted = vec![];
            for part in parts {
                match check_compatible(&reference, &part, options) {
                    Ok(()) => accepted.push(part),
                    Err(e) => rejected.push(e),
                }
            }
            accepted.insert(0, reference);

            match merge_series(accepted, options) {
                Ok(Some(merged)) => self.series.push(merged),
                Ok(None) => {}
                Err(e) => rejected.push(e),
            }
        }

        rejected
    }

    /// Attach calibration to every series that lacks it and remember the
    /// inventory for later appends. Returns the series that found no match.
    pub fn attach_inventory(&mut self, inventory: Arc<Inventory>) -> Vec<AttachError> {
        let mut failures = Vec::new();
        for series in self.series.iter_mut().filter(|s| s.response.is_none()) {
            match inventory.attach(&series.id, series.start) {
                Ok(response) => series.set_response(response),
                Err(e) => failures.push(e),
            }
        }
        self.inventory = Some(inventory);
        failures
    }

    /// Keep only the last `window` of data in every series, measured back
    /// from that series' own latest sample.
    pub fn trim(&mut self, window: Duration) {
        let Ok(window) = TimeDelta::from_std(window) else {
            return;
        };

        for series in self.series.iter_mut().filter(|s| !s.is_empty()) {
            if let Some(cutoff) = series.end().checked_sub_signed(window) {
                series.trim_before(cutoff);
            }
        }
        self.series.retain(|s| !s.is_empty());
    }

    /// Time of the latest sample in any series.
    pub fn latest_end(&self) -> Option<DateTime<Utc>> {
        self.series
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.end())
            .max()
    }

    pub fn series(&self) -> &[ChannelSeries] {
        &self.series
    }

    pub fn get(&self, id: &StreamId) -> Option<&ChannelSeries> {
        self.series.iter().find(|s| &s.id == id)
    }

    /// First series for `channel`, whatever its network and station.
    pub fn channel(&self, channel: &str) -> Option<&ChannelSeries> {
        self.series.iter().find(|s| s.id.channel == channel)
    }

    pub fn inventory(&self) -> Option<&Arc<Inventory>> {
        self.inventory.as_ref()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Samples held across all series, masked ones included.
    pub fn total_samples(&self) -> usize {
        self.series.iter().map(|s| s.len()).sum()
    }

    pub fn into_series(self) -> Vec<ChannelSeries> {
        self.series
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::tests::STATION_XML;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_582_315_130, 0).unwrap()
    }

    fn segment(channel: &str, offset_ms: i64, samples: Vec<i32>) -> Segment {
        Segment::new(
            StreamId::new("AM", "R0000", "00", channel),
            t0() + TimeDelta::milliseconds(offset_ms),
            100.0,
            samples,
        )
    }

    #[test]
    fn test_merge_one_series_per_channel() {
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, vec![1, 2]));
        collection.push(segment("ENE", 0, vec![7, 8]));
        collection.push(segment("EHZ", 20, vec![3, 4]));
        collection.push(segment("ENE", 20, vec![9]));

        assert!(collection.merge(&MergeOptions::default()).is_empty());

        assert_eq!(collection.len(), 2);
        assert_eq!(collection.total_samples(), 7);
        assert_eq!(
            collection.channel("EHZ").unwrap().samples().filled(0),
            vec![1, 2, 3, 4]
        );
        assert_eq!(collection.series()[1].id().channel, "ENE");
    }

    #[test]
    fn test_merge_rejects_rate_mismatch() {
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, vec![1, 2]));
        collection.push(Segment::new(
            StreamId::new("AM", "R0000", "00", "EHZ"),
            t0(),
            50.0,
            vec![5],
        ));

        let rejected = collection.merge(&MergeOptions::default());
        assert_eq!(rejected.len(), 1);
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.series()[0].sampling_rate(), 100.0);
    }

    #[test]
    fn test_trim_to_window() {
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, (0..100).collect()));
        collection.push(segment("ENE", 0, vec![1, 2, 3]));
        collection.merge(&MergeOptions::default());

        collection.trim(Duration::from_millis(500));

        let ehz = collection.channel("EHZ").unwrap();
        assert_eq!(ehz.start(), t0() + TimeDelta::milliseconds(490));
        assert_eq!(ehz.end(), t0() + TimeDelta::milliseconds(990));
        // ENE is measured against its own end, so a channel that lags
        // behind keeps its data.
        assert_eq!(collection.channel("ENE").unwrap().len(), 3);
        assert_eq!(
            collection.latest_end(),
            Some(t0() + TimeDelta::milliseconds(990))
        );
    }

    #[test]
    fn test_far_future_segment_is_rejected_without_touching_others() {
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, vec![1, 2, 3, 4]));
        collection.push(segment("ENE", 0, vec![7, 8]));
        collection.merge(&MergeOptions::default());

        collection.push(Segment::new(
            StreamId::new("AM", "R0000", "00", "EHZ"),
            DateTime::from_timestamp(9_999_999_999, 0).unwrap(),
            100.0,
            vec![5],
        ));
        let rejected = collection.merge(&MergeOptions::default());
        collection.trim(Duration::from_secs(60));

        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0], MergeError::GapTooLarge { .. }));
        assert_eq!(
            collection.channel("EHZ").unwrap().samples().filled(0),
            vec![1, 2, 3, 4]
        );
        assert_eq!(collection.channel("EHZ").unwrap().start(), t0());
        assert_eq!(collection.channel("ENE").unwrap().len(), 2);
    }

    #[test]
    fn test_epoch_zero_segment_is_rejected() {
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, vec![1, 2]));
        collection.push(Segment::new(
            StreamId::new("AM", "R0000", "00", "EHZ"),
            DateTime::UNIX_EPOCH,
            100.0,
            vec![9],
        ));

        let rejected = collection.merge(&MergeOptions::default());
        assert_eq!(rejected.len(), 1);
        assert_eq!(collection.channel("EHZ").unwrap().start(), t0());
        assert_eq!(collection.total_samples(), 2);
    }

    #[test]
    fn test_trim_empty_collection() {
        let mut collection = SeriesCollection::new();
        collection.trim(Duration::from_secs(1));
        assert!(collection.is_empty());
    }

    #[test]
    fn test_attach_inventory() {
        let inventory = Arc::new(Inventory::from_station_xml(STATION_XML).unwrap());
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, vec![1]));
        collection.push(segment("ENE", 0, vec![1]));

        let failures = collection.attach_inventory(inventory);
        assert_eq!(failures.len(), 1);
        assert!(collection.channel("EHZ").unwrap().response().is_some());
        assert!(collection.channel("ENE").unwrap().response().is_none());

        // Later appends pick up calibration from the stored inventory.
        collection.push(segment("EHZ", 10, vec![2]));
        assert!(collection.series()[2].response().is_some());
        assert!(collection.inventory().is_some());
    }

    #[test]
    fn test_physical_samples_after_attach() {
        let inventory = Arc::new(Inventory::from_station_xml(STATION_XML).unwrap());
        let mut collection = SeriesCollection::new();
        collection.push(segment("EHZ", 0, vec![399650000, 0]));
        collection.attach_inventory(inventory);

        let physical = collection.channel("EHZ").unwrap().physical_samples().unwrap();
        assert_eq!(physical, vec![Some(1.0), Some(0.0)]);
    }
}
