//! Masked sample sequences.
//!
//! Seismic counts arrive as plain integers, but once packets are merged the
//! series can contain positions with no valid data: gaps between packets and
//! overlaps whose values disagree. [`MaskedSamples`] keeps one `Option<i32>`
//! per grid position, with `None` meaning masked.
//!
//! Gap positions may also hold a fill value. Those are flagged as filled so
//! that a late packet covering the gap replaces them instead of conflicting
//! with them.

use std::ops::Range;

/// A sequence of counts where any position may be masked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskedSamples {
    values: Vec<Option<i32>>,
    // Same length as `values`.
    filled: Vec<bool>,
}

impl MaskedSamples {
    /// A fully masked sequence of `len` positions.
    pub fn masked(len: usize) -> Self {
        Self {
            values: vec![None; len],
            filled: vec![false; len],
        }
    }

    /// Wrap received values; nothing is flagged as filled.
    fn received(values: Vec<Option<i32>>) -> Self {
        let filled = vec![false; values.len()];
        Self { values, filled }
    }

    /// Number of positions, masked or not.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `index`, or `None` if masked or out of range.
    pub fn get(&self, index: usize) -> Option<i32> {
        self.values.get(index).copied().flatten()
    }

    /// Whether `index` is a masked position.
    pub fn is_masked(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Whether `index` holds a gap-fill value rather than received data.
    pub fn is_filled(&self, index: usize) -> bool {
        self.filled.get(index).copied().unwrap_or(false)
    }

    /// Number of gap-fill positions.
    pub fn filled_count(&self) -> usize {
        self.filled.iter().filter(|f| **f).count()
    }

    /// Number of masked positions.
    pub fn masked_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// Number of valid positions.
    pub fn valid_count(&self) -> usize {
        self.len() - self.masked_count()
    }

    /// Iterate over every position.
    pub fn iter(&self) -> impl Iterator<Item = Option<i32>> + '_ {
        self.values.iter().copied()
    }

    pub fn as_slice(&self) -> &[Option<i32>] {
        &self.values
    }

    /// Runs of consecutive masked positions.
    pub fn masked_runs(&self) -> Vec<Range<usize>> {
        runs(self.values.iter().map(|v| v.is_none()))
    }

    /// Runs of consecutive gap-fill positions.
    pub fn filled_runs(&self) -> Vec<Range<usize>> {
        runs(self.filled.iter().copied())
    }

    /// Runs of positions holding no received data, masked or filled.
    pub fn missing_runs(&self) -> Vec<Range<usize>> {
        runs(
            self.values
                .iter()
                .zip(&self.filled)
                .map(|(v, filled)| v.is_none() || *filled),
        )
    }

    /// Copy out the counts with masked positions replaced by `fill`.
    pub fn filled(&self, fill: i32) -> Vec<i32> {
        self.values.iter().map(|v| v.unwrap_or(fill)).collect()
    }

    /// Drop the first `count` positions.
    pub(crate) fn drain_front(&mut self, count: usize) {
        let count = count.min(self.values.len());
        self.values.drain(..count);
        self.filled.drain(..count);
    }

    pub(crate) fn from_parts(values: Vec<Option<i32>>, filled: Vec<bool>) -> Self {
        debug_assert_eq!(values.len(), filled.len());
        Self { values, filled }
    }

    pub(crate) fn into_parts(self) -> (Vec<Option<i32>>, Vec<bool>) {
        (self.values, self.filled)
    }
}

/// Ranges of consecutive `true` flags.
pub(crate) fn runs(flags: impl Iterator<Item = bool>) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut run_start = None;
    let mut len = 0;

    for (i, flag) in flags.enumerate() {
        match (flag, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                runs.push(start..i);
                run_start = None;
            }
            _ => {}
        }
        len = i + 1;
    }
    if let Some(start) = run_start {
        runs.push(start..len);
    }

    runs
}

impl From<Vec<i32>> for MaskedSamples {
    fn from(counts: Vec<i32>) -> Self {
        Self::received(counts.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<i32>>> for MaskedSamples {
    fn from(values: Vec<Option<i32>>) -> Self {
        Self::received(values)
    }
}

impl FromIterator<Option<i32>> for MaskedSamples {
    fn from_iter<I: IntoIterator<Item = Option<i32>>>(iter: I) -> Self {
        Self::received(iter.into_iter().collect())
    }
}
