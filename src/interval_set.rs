//! An `IntervalSet` is an ordered store of non-overlapping intervals
//! with a default-metadata template and metadata-filtered views.  It
//! tracks pure region membership; allocation state (unmapped, mapped,
//! allocated) is the caller's business, one set per state.
//!
//! The set is kept canonical after every mutation: intervals sorted by
//! start, no overlap, and no two adjacent intervals with equal
//! metadata (those are merged).
//!
//! Placement is randomized by contract: `find_region` picks a hosting
//! interval uniformly among the candidates and then an aligned slot
//! uniformly within it, drawing from the RNG the caller injects.  The
//! set itself never touches ambient randomness.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{Error, Result};
use crate::interval::{Interval, MetaValue, Metadata};

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Summary of a set's contents, for introspection and logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntervalStats {
    pub count: usize,
    pub total_size: u64,
    /// Smallest and largest interval size, when the set is non-empty.
    pub min_interval: Option<u64>,
    pub max_interval: Option<u64>,
    /// Per metadata key, how often each value occurs.
    pub value_histogram: BTreeMap<String, BTreeMap<MetaValue, usize>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
    default_metadata: Metadata,
}

impl IntervalSet {
    /// An empty set with empty default metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set whose future intervals default to `metadata`.
    pub fn with_default_metadata(metadata: Metadata) -> Self {
        Self {
            intervals: Vec::new(),
            default_metadata: metadata,
        }
    }

    /// A set seeded with one interval `[start, start + size)` carrying
    /// the default metadata.
    pub fn with_region(start: u64, size: u64, metadata: Metadata) -> Self {
        let mut set = Self::with_default_metadata(metadata);
        set.add_region(start, size, None);
        set
    }

    pub fn default_metadata(&self) -> &Metadata {
        &self.default_metadata
    }

    /// Unions `[start, start + size)` into the set.  The region carries
    /// the default metadata overridden key-by-key by `metadata`.
    /// Callers never pass a region overlapping existing intervals.
    ///
    /// Returns false (and does nothing) for zero-size regions.
    #[ensures(self.is_canonical(), "set stays canonical")]
    pub fn add_region(&mut self, start: u64, size: u64, metadata: Option<Metadata>) -> bool {
        if size == 0 {
            return false;
        }

        let mut combined = self.default_metadata.clone();
        if let Some(overrides) = metadata {
            combined.extend(overrides);
        }

        self.intervals.push(Interval::new(start, size, combined));
        self.normalize();
        true
    }

    /// Subtracts `[start, start + size)` from every stored interval,
    /// shrinking, splitting, or dropping them as needed.  Returns
    /// whether anything changed.  Never fails.
    #[ensures(self.is_canonical(), "set stays canonical")]
    pub fn remove_region(&mut self, start: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }

        let end = start + size;
        let mut modified = false;
        let mut kept = Vec::with_capacity(self.intervals.len());

        for interval in self.intervals.drain(..) {
            if !interval.overlaps(start, size) {
                kept.push(interval);
                continue;
            }

            modified = true;
            if interval.contains(start, size) {
                let (before, _, after) = interval.split_at(start, size);
                kept.extend(before);
                kept.extend(after);
            } else if start <= interval.start() && end >= interval.end() {
                // Fully swallowed by the removed region.
            } else if start <= interval.start() {
                // Low-end overlap; keep the tail.
                kept.push(Interval::new(
                    end,
                    interval.end() - end,
                    interval.metadata().clone(),
                ));
            } else {
                // High-end overlap; keep the head.
                kept.push(Interval::new(
                    interval.start(),
                    start - interval.start(),
                    interval.metadata().clone(),
                ));
            }
        }

        self.intervals = kept;
        self.normalize();
        modified
    }

    /// Finds a slot of `size` bytes.  With `alignment_bits`, the slot
    /// start is a multiple of `1 << alignment_bits`; without, any byte
    /// position is eligible.  The hosting interval is chosen uniformly
    /// among the matching candidates, the slot uniformly within it.
    #[ensures(ret.is_some() -> ret.unwrap().1 == size)]
    #[ensures(ret.is_some() ->
              ret.unwrap().0 % (1u64 << alignment_bits.unwrap_or(0)) == 0,
              "returned start honors the alignment")]
    #[ensures(ret.is_some() -> self.contains_region(ret.unwrap().0, size, criteria),
              "returned slot lies inside a matching interval")]
    pub fn find_region(
        &self,
        size: u64,
        alignment_bits: Option<u8>,
        criteria: Option<&Metadata>,
        rng: &mut impl Rng,
    ) -> Option<(u64, u64)> {
        self.find_region_where(size, alignment_bits, criteria, |_| true, rng)
    }

    /// `find_region` with an additional caller-supplied interval filter.
    pub fn find_region_where(
        &self,
        size: u64,
        alignment_bits: Option<u8>,
        criteria: Option<&Metadata>,
        filter: impl Fn(&Interval) -> bool,
        rng: &mut impl Rng,
    ) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }

        let alignment = 1u64 << alignment_bits.unwrap_or(0);
        let candidates = self.suitable_intervals(size, alignment, criteria, &filter);
        if candidates.is_empty() {
            return None;
        }

        let (interval, first_aligned, last_aligned) =
            candidates[rng.gen_range(0..candidates.len())];
        let position = if alignment > 1 {
            let slots = (last_aligned - first_aligned) / alignment + 1;
            first_aligned + rng.gen_range(0..slots) * alignment
        } else {
            let max_start = interval.start() + interval.size() - size;
            rng.gen_range(interval.start()..=max_start)
        };

        Some((position, size))
    }

    /// `find_region` followed by removal of exactly `size` bytes at the
    /// chosen position.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no interval can host the request.
    pub fn find_and_remove(
        &mut self,
        size: u64,
        alignment_bits: Option<u8>,
        criteria: Option<&Metadata>,
        rng: &mut impl Rng,
    ) -> Result<(u64, u64)> {
        let (start, _) = self
            .find_region(size, alignment_bits, criteria, rng)
            .ok_or(Error::NotFound {
                size,
                alignment_bits,
            })?;
        self.remove_region(start, size);
        Ok((start, size))
    }

    /// Removes `[start, start + size)` from the set and returns it as a
    /// standalone interval.
    ///
    /// # Errors
    ///
    /// `Error::NotContained` unless a single stored interval fully
    /// contains the range.
    #[ensures(ret.is_ok() -> self.is_canonical())]
    pub fn split_region(&mut self, start: u64, size: u64) -> Result<Interval> {
        if size == 0 {
            return Err(Error::NotContained { start, size });
        }

        let position = self
            .intervals
            .iter()
            .position(|interval| interval.contains(start, size))
            .ok_or(Error::NotContained { start, size })?;

        let container = self.intervals.remove(position);
        let (before, middle, after) = container.split_at(start, size);
        self.intervals.extend(before);
        self.intervals.extend(after);
        self.normalize();
        Ok(middle)
    }

    /// True iff some single stored interval (matching `criteria`, when
    /// given) fully contains `[start, start + size)`.
    pub fn contains_region(&self, start: u64, size: u64, criteria: Option<&Metadata>) -> bool {
        if size == 0 {
            return true;
        }
        self.intervals.iter().any(|interval| {
            criteria.map_or(true, |c| interval.matches_criteria(c)) && interval.contains(start, size)
        })
    }

    pub fn get_intervals(&self, criteria: Option<&Metadata>) -> Vec<&Interval> {
        self.get_intervals_where(criteria, |_| true)
    }

    pub fn get_intervals_where(
        &self,
        criteria: Option<&Metadata>,
        filter: impl Fn(&Interval) -> bool,
    ) -> Vec<&Interval> {
        self.intervals
            .iter()
            .filter(|interval| criteria.map_or(true, |c| interval.matches_criteria(c)))
            .filter(|interval| filter(interval))
            .collect()
    }

    pub fn get_total_size(&self, criteria: Option<&Metadata>) -> u64 {
        self.intervals
            .iter()
            .filter(|interval| criteria.map_or(true, |c| interval.matches_criteria(c)))
            .map(Interval::size)
            .sum()
    }

    /// Merges `metadata` into every interval overlapping the region.
    /// Returns whether any interval was touched.
    #[ensures(self.is_canonical())]
    pub fn update_metadata(&mut self, start: u64, size: u64, metadata: Metadata) -> bool {
        if size == 0 {
            return false;
        }

        let mut updated = false;
        for interval in &mut self.intervals {
            if interval.overlaps(start, size) {
                interval.metadata_mut().extend(metadata.clone());
                updated = true;
            }
        }
        if updated {
            // Updates can make neighbours equal again.
            self.normalize();
        }
        updated
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn get_stats(&self) -> IntervalStats {
        let mut value_histogram: BTreeMap<String, BTreeMap<MetaValue, usize>> = BTreeMap::new();
        for interval in &self.intervals {
            for (key, value) in interval.metadata() {
                *value_histogram
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default() += 1;
            }
        }

        IntervalStats {
            count: self.intervals.len(),
            total_size: self.get_total_size(None),
            min_interval: self.intervals.iter().map(Interval::size).min(),
            max_interval: self.intervals.iter().map(Interval::size).max(),
            value_histogram,
        }
    }

    /// All intervals hosting `size` bytes at some `alignment`-multiple
    /// start, as `(interval, first_aligned, last_aligned)`.
    fn suitable_intervals(
        &self,
        size: u64,
        alignment: u64,
        criteria: Option<&Metadata>,
        filter: &impl Fn(&Interval) -> bool,
    ) -> Vec<(&Interval, u64, u64)> {
        let mut suitable = Vec::new();
        for interval in &self.intervals {
            if let Some(criteria) = criteria {
                if !interval.matches_criteria(criteria) {
                    continue;
                }
            }
            if !filter(interval) || interval.size() < size {
                continue;
            }

            let max_start = interval.start() + interval.size() - size;
            if alignment > 1 {
                let first_aligned = align_up(interval.start(), alignment);
                let last_aligned = align_down(max_start, alignment);
                if first_aligned <= last_aligned {
                    suitable.push((interval, first_aligned, last_aligned));
                }
            } else {
                suitable.push((interval, interval.start(), max_start));
            }
        }
        suitable
    }

    /// One linear pass restoring canonical form: sort by start, then
    /// merge adjacent runs with equal metadata.
    fn normalize(&mut self) {
        if self.intervals.len() < 2 {
            return;
        }

        self.intervals.sort_by_key(Interval::start);

        let mut merged: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for interval in self.intervals.drain(..) {
            match merged.last_mut() {
                Some(previous) if previous.can_merge_with(&interval) => {
                    *previous = previous.merge_with(&interval);
                }
                _ => merged.push(interval),
            }
        }
        self.intervals = merged;
    }

    /// Sorted, non-overlapping, and no adjacent pair left unmerged.
    #[allow(dead_code)] // referenced from contract postconditions
    fn is_canonical(&self) -> bool {
        self.intervals.windows(2).all(|pair| {
            pair[0].end() <= pair[1].start() && !pair[0].can_merge_with(&pair[1])
        })
    }
}
