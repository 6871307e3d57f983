//! Merging same-channel series into one contiguous series.
//!
//! Two series are laid on the sample grid of the earlier one. Positions only
//! one of them covers are copied, positions both cover are resolved with the
//! [`OverlapPolicy`], and positions neither covers form a gap that is left
//! masked or filled according to [`GapFill`]. Series further apart than
//! [`MergeOptions::max_gap`] are refused rather than bridged.

use serde::Deserialize;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::samples::{MaskedSamples, runs};
use crate::segment::{ChannelSeries, StreamId, seconds_between};

/// Relative tolerance when comparing sampling rates.
const RATE_TOLERANCE: f64 = 1e-6;

/// How to resolve samples that two series both cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum OverlapPolicy {
    /// Keep agreeing samples once and mask disagreeing ones.
    #[default]
    #[serde(rename = "mask")]
    MaskConflicts,

    /// The later series overwrites the earlier one.
    #[serde(rename = "later")]
    PreferLater,
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mask" => Ok(Self::MaskConflicts),
            "later" => Ok(Self::PreferLater),
            other => Err(format!("unknown overlap policy: {}", other)),
        }
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaskConflicts => write!(f, "mask"),
            Self::PreferLater => write!(f, "later"),
        }
    }
}

/// What to put in positions between two non-touching series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GapFill {
    /// Leave the gap masked.
    #[default]
    Masked,

    /// Fill with a constant count.
    Value(i32),

    /// Repeat the last valid sample before the gap.
    Latest,

    /// Linear interpolation between the samples bordering the gap.
    Interpolate,
}

impl FromStr for GapFill {
    type Err = String;

    /// Accepts `masked`, `latest`, `interpolate` or an integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "masked" | "none" => Ok(Self::Masked),
            "latest" => Ok(Self::Latest),
            "interpolate" => Ok(Self::Interpolate),
            _ => s
                .parse::<i32>()
                .map(Self::Value)
                .map_err(|_| format!("invalid gap fill: {}", s)),
        }
    }
}

impl fmt::Display for GapFill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Masked => write!(f, "masked"),
            Self::Value(v) => write!(f, "{}", v),
            Self::Latest => write!(f, "latest"),
            Self::Interpolate => write!(f, "interpolate"),
        }
    }
}

/// Default for [`MergeOptions::max_gap`].
pub const DEFAULT_MAX_GAP: Duration = Duration::from_secs(24 * 60 * 60);

/// Options forwarded to every merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub overlap: OverlapPolicy,
    pub fill: GapFill,

    /// Widest gap a merge will bridge. Series further apart are not merged.
    pub max_gap: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            overlap: OverlapPolicy::default(),
            fill: GapFill::default(),
            max_gap: DEFAULT_MAX_GAP,
        }
    }
}

impl MergeOptions {
    pub fn with_fill(mut self, fill: GapFill) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_max_gap(mut self, max_gap: Duration) -> Self {
        self.max_gap = max_gap;
        self
    }
}

/// Reasons two series cannot be merged.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Cannot merge {left} with {right}: different streams")]
    IdMismatch { left: StreamId, right: StreamId },

    #[error("Cannot merge {id}: sampling rate {found} Hz differs from {expected} Hz")]
    RateMismatch {
        id: StreamId,
        expected: f64,
        found: f64,
    },

    #[error("Cannot merge {id}: {gap_secs:.3}s gap exceeds the {max_secs:.0}s limit")]
    GapTooLarge {
        id: StreamId,
        gap_secs: f64,
        max_secs: f64,
    },
}

/// Whether two sampling rates are equal within tolerance.
fn same_rate(a: f64, b: f64) -> bool {
    (a - b).abs() <= RATE_TOLERANCE * a.abs().max(b.abs())
}

/// Seconds of missing samples between two series; zero when they touch or
/// overlap.
pub(crate) fn span_gap(a: &ChannelSeries, b: &ChannelSeries) -> f64 {
    let (first, second) = if a.start <= b.start { (a, b) } else { (b, a) };
    let step = 1.0 / first.sampling_rate;
    (seconds_between(first.end(), second.start) - step).max(0.0)
}

/// Check that `candidate` may be merged with `reference`.
pub(crate) fn check_compatible(
    reference: &ChannelSeries,
    candidate: &ChannelSeries,
    options: &MergeOptions,
) -> Result<(), MergeError> {
    if reference.id != candidate.id {
        return Err(MergeError::IdMismatch {
            left: reference.id.clone(),
            right: candidate.id.clone(),
        });
    }
    if !same_rate(reference.sampling_rate, candidate.sampling_rate) {
        return Err(MergeError::RateMismatch {
            id: candidate.id.clone(),
            expected: reference.sampling_rate,
            found: candidate.sampling_rate,
        });
    }

    let gap_secs = span_gap(reference, candidate);
    let max_secs = options.max_gap.as_secs_f64();
    if gap_secs > max_secs {
        return Err(MergeError::GapTooLarge {
            id: candidate.id.clone(),
            gap_secs,
            max_secs,
        });
    }

    Ok(())
}

/// Merge any number of series of the same stream into one.
///
/// Returns `None` for an empty input.
pub fn merge_series(
    mut parts: Vec<ChannelSeries>,
    options: &MergeOptions,
) -> Result<Option<ChannelSeries>, MergeError> {
    parts.sort_by_key(|s| s.start);

    let mut parts = parts.into_iter();
    let Some(mut merged) = parts.next() else {
        return Ok(None);
    };
    for next in parts {
        merged = merge_pair(merged, next, options)?;
    }

    Ok(Some(merged))
}

/// Merge `later` into `earlier`. `earlier` must not start after `later`.
pub(crate) fn merge_pair(
    earlier: ChannelSeries,
    later: ChannelSeries,
    options: &MergeOptions,
) -> Result<ChannelSeries, MergeError> {
    if later.is_empty() {
        if earlier.id != later.id {
            return Err(MergeError::IdMismatch {
                left: earlier.id,
                right: later.id,
            });
        }
        return Ok(earlier);
    }
    check_compatible(&earlier, &later, options)?;

    let rate = earlier.sampling_rate;
    let offset = (seconds_between(earlier.start, later.start) * rate)
        .round()
        .max(0.0) as usize;

    let earlier_len = earlier.samples.len();
    let total = earlier_len.max(offset + later.samples.len());

    let ChannelSeries {
        id,
        start,
        sampling_rate,
        samples,
        response,
    } = earlier;

    let (mut values, mut filled) = samples.into_parts();
    values.resize(total, None);
    filled.resize(total, false);

    let (incoming_values, incoming_filled) = later.samples.into_parts();
    let incoming = incoming_values.into_iter().zip(incoming_filled);
    for (i, (incoming, incoming_fill)) in incoming.enumerate() {
        let index = offset + i;
        if index >= earlier_len {
            values[index] = incoming;
            filled[index] = incoming_fill;
            continue;
        }
        match (filled[index], incoming_fill) {
            // Received data always replaces a fill value.
            (true, false) => {
                values[index] = incoming;
                filled[index] = false;
            }
            (_, true) => {}
            (false, false) => {
                values[index] = match (values[index], incoming) {
                    (None, v) | (v, None) => v,
                    (Some(a), Some(b)) if a == b => Some(a),
                    (Some(_), Some(b)) => match options.overlap {
                        OverlapPolicy::MaskConflicts => None,
                        OverlapPolicy::PreferLater => Some(b),
                    },
                };
            }
        }
    }

    if options.fill != GapFill::Masked {
        if offset > earlier_len {
            filled[earlier_len..offset].fill(true);
        }
        // Fill values are recomputed so they follow the data now around them.
        for gap in runs(filled.iter().copied()) {
            fill_gap(&mut values, &mut filled, gap, options.fill);
        }
    }

    Ok(ChannelSeries {
        id,
        start,
        sampling_rate,
        samples: MaskedSamples::from_parts(values, filled),
        response: response.or(later.response),
    })
}

/// Fill the positions in `gap` according to `fill`, flagging what was filled.
fn fill_gap(values: &mut [Option<i32>], filled: &mut [bool], gap: Range<usize>, fill: GapFill) {
    let received = |i: usize| (!filled[i]).then_some(values[i]).flatten().map(|v| (i, v));
    let left = (0..gap.start).rev().find_map(received);
    let right = (gap.end..values.len()).find_map(received);

    let value_at = |k: usize| -> Option<i32> {
        match fill {
            GapFill::Masked => None,
            GapFill::Value(v) => Some(v),
            GapFill::Latest => left.map(|(_, v)| v),
            GapFill::Interpolate => {
                let ((li, lv), (ri, rv)) = (left?, right?);
                let frac = (k - li) as f64 / (ri - li) as f64;
                Some((lv as f64 + (rv as f64 - lv as f64) * frac).round() as i32)
            }
        }
    };

    for k in gap {
        let value = value_at(k);
        values[k] = value;
        filled[k] = value.is_some();
    }
}
