//! The piecewise-linear CDF model.
//!
//! The model partitions the key range into disjoint intervals separated by gaps at
//! least as large as a selected threshold, then assigns each interval a capacity in
//! a compressed position space proportional to its spread. A key strictly inside an
//! interval is projected onto `[0, A_S)` by the interval's linear map; interval
//! endpoints are stored keys by construction and never need a projection.
//!
//! Threshold selection is the heart of the structure: splitting on too many gaps
//! spends the bit budget on interval bookkeeping, too few leaves a sparse, leaky
//! model. Candidate thresholds are scanned from small to large, scoring each with an
//! expected-false-positive proxy, and the best (smallest on ties) wins.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

#[cfg(feature = "bincode")]
use bincode::{Decode, Encode};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::wire::{aligned, ByteReader, ByteWriter};

/// Bookkeeping cost of one interval in bits: two 64-bit endpoints plus one
/// cumulative-capacity entry.
const INTERVAL_COST_BITS: f64 = 3.0 * 64.0;

/// Hard cap on the position-space size, keeping `alpha * key` inside `u128`.
const MAX_POSITIONS: u64 = 1 << 56;

/// Outcome of classifying a point probe against the model.
pub(crate) enum PointOutcome {
    /// The key falls outside every interval; it cannot be a member.
    OutOfScope,
    /// The key coincides with an interval endpoint, which is always a stored key.
    Exist,
    /// The key is interior; the block list decides membership at this position.
    Uncertain(u64),
}

/// Outcome of classifying a range probe against the model.
pub(crate) enum RangeOutcome {
    /// The range lies strictly inside a gap or outside the key span.
    OutOfScope,
    /// The range touches or crosses an interval endpoint, i.e. a stored key.
    Exist,
    /// The range is strictly interior to one interval; the block list decides
    /// overlap between the two projected positions.
    Uncertain(u64, u64),
}

/// Piecewise-linear map from keys to compressed positions.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "bincode", derive(Encode, Decode))]
#[derive(Debug, Clone)]
pub(crate) struct CdfModel {
    begins: Box<[u64]>,
    ends: Box<[u64]>,
    /// Prefix sums of per-interval capacity; `cumulative[0] == 0`, length `S + 1`.
    cumulative: Box<[u64]>,
}

impl CdfModel {
    /// Fits a model to `keys` (sorted, strictly increasing, non-empty) under a
    /// bits-per-key budget.
    pub fn build(bits_per_key: f64, block_size: u16, keys: &[u64]) -> Self {
        debug_assert!(!keys.is_empty());
        debug_assert!(block_size >= 1);
        let residual = bits_per_key - 2.0 - 64.0 / f64::from(block_size);
        let threshold = select_threshold(bits_per_key, residual, keys);
        Self::partition(threshold, residual, keys)
    }

    /// Reassembles a model from its parts; used by deserialization.
    fn from_parts(begins: Box<[u64]>, ends: Box<[u64]>, cumulative: Box<[u64]>) -> Self {
        debug_assert_eq!(begins.len(), ends.len());
        debug_assert_eq!(cumulative.len(), begins.len() + 1);
        Self {
            begins,
            ends,
            cumulative,
        }
    }

    /// Splits `keys` at every gap `>= threshold` and allocates position-space
    /// capacity to the resulting intervals in proportion to their spread.
    fn partition(threshold: u64, residual: f64, keys: &[u64]) -> Self {
        let n = keys.len();
        let mut begins = Vec::new();
        let mut ends = Vec::new();

        begins.push(keys[0]);
        for pair in keys.windows(2) {
            if pair[1] - pair[0] >= threshold {
                ends.push(pair[0]);
                begins.push(pair[1]);
            }
        }
        ends.push(keys[n - 1]);

        // Single-key intervals have no interior and take no position space.
        let spread_total: u64 = begins.iter().zip(&ends).map(|(b, e)| e - b).sum();

        let s = begins.len();
        let raw = libm::pow(
            2.0,
            residual - INTERVAL_COST_BITS / n as f64 * s as f64,
        ) * n as f64;
        let budget = (raw as u64).min(MAX_POSITIONS);

        let mut cumulative = Vec::with_capacity(s + 1);
        cumulative.push(0u64);
        for i in 0..s {
            let spread = ends[i] - begins[i];
            if spread == 0 {
                cumulative.push(cumulative[i]);
                continue;
            }
            let share =
                libm::ceil(spread as f64 / spread_total as f64 * budget as f64) as u64;
            cumulative.push(cumulative[i] + share.max(1));
        }
        debug_assert!(cumulative.windows(2).all(|w| w[0] <= w[1]));

        Self::from_parts(
            begins.into_boxed_slice(),
            ends.into_boxed_slice(),
            cumulative.into_boxed_slice(),
        )
    }

    /// Number of intervals.
    pub fn segments(&self) -> usize {
        self.begins.len()
    }

    /// Total size of the compressed position space.
    pub fn positions(&self) -> u64 {
        self.cumulative[self.cumulative.len() - 1]
    }

    fn capacity(&self, idx: usize) -> u64 {
        self.cumulative[idx + 1] - self.cumulative[idx]
    }

    /// Classifies a point probe.
    pub fn classify(&self, key: u64) -> PointOutcome {
        let last = self.ends.len() - 1;
        if key < self.begins[0] || key > self.ends[last] {
            return PointOutcome::OutOfScope;
        }
        let idx = self.begins.partition_point(|&b| b <= key) - 1;
        if self.ends[idx] < key {
            return PointOutcome::OutOfScope;
        }
        if self.begins[idx] == key || self.ends[idx] == key {
            return PointOutcome::Exist;
        }
        if self.capacity(idx) == 0 {
            return PointOutcome::OutOfScope;
        }
        PointOutcome::Uncertain(self.project(idx, key))
    }

    /// Classifies a range probe over `[lo, hi]`.
    pub fn classify_range(&self, lo: u64, hi: u64) -> RangeOutcome {
        debug_assert!(lo <= hi);
        let last = self.ends.len() - 1;
        if lo > self.ends[last] || hi < self.begins[0] {
            return RangeOutcome::OutOfScope;
        }
        if lo <= self.begins[0] {
            // hi >= begins[0] was established above, so the range covers the
            // first stored key.
            return RangeOutcome::Exist;
        }
        let idx = self.begins.partition_point(|&b| b <= lo) - 1;
        // lo <= ends[last] guarantees idx + 1 exists whenever lo sits past
        // ends[idx], so the gap test cannot index out of bounds.
        if lo > self.ends[idx] && hi < self.begins[idx + 1] {
            return RangeOutcome::OutOfScope;
        }
        if !(lo > self.begins[idx] && hi < self.ends[idx]) {
            return RangeOutcome::Exist;
        }
        if self.capacity(idx) == 0 {
            return RangeOutcome::OutOfScope;
        }
        RangeOutcome::Uncertain(self.project(idx, lo), self.project(idx, hi))
    }

    /// Projects a key strictly inside interval `idx` onto its slot range.
    ///
    /// `alpha * key` does not fit in 64 bits; the whole numerator is evaluated in
    /// `u128`, which [`MAX_POSITIONS`] keeps from overflowing in turn. The floor
    /// division is exact because the numerator is non-negative for `key >= begin`.
    fn project(&self, idx: usize, key: u64) -> u64 {
        let begin = self.begins[idx] as u128;
        let end = self.ends[idx] as u128;
        let low_slot = self.cumulative[idx] as u128;
        let high_slot = self.cumulative[idx + 1] as u128;
        let alpha = high_slot - low_slot;
        let numerator = alpha * key as u128 + end * low_slot - begin * high_slot;
        (numerator / (end - begin)) as u64
    }

    /// Projects every key strictly interior to its interval, in key order.
    ///
    /// Boundary keys (including `keys[0]` and `keys[n-1]`) are skipped: they are
    /// answered exactly by the [`Exist`](PointOutcome::Exist) branch, and leaving
    /// them out keeps the bitset universe aligned with interval interiors.
    pub fn project_interior(&self, keys: &[u64]) -> Vec<u64> {
        let n = keys.len();
        let mut positions = Vec::new();
        if n < 3 {
            return positions;
        }
        let mut idx = 0;
        for &key in &keys[1..n - 1] {
            if key >= self.ends[idx] {
                idx += 1;
            } else if key > self.begins[idx] {
                positions.push(self.project(idx, key));
            }
        }
        debug_assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        positions
    }

    /// Serialized footprint: interval count, padding, then the three arrays.
    pub fn byte_size(&self) -> usize {
        aligned(8) + 3 * 8 * self.segments()
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.put_u64(self.segments() as u64);
        w.pad();
        for &begin in self.begins.iter() {
            w.put_u64(begin);
        }
        for &end in self.ends.iter() {
            w.put_u64(end);
        }
        for &total in self.cumulative[1..].iter() {
            w.put_u64(total);
        }
    }

    pub fn read(r: &mut ByteReader) -> Result<Self, Error> {
        let s64 = r.get_u64()?;
        r.skip_pad()?;
        if s64 == 0 {
            return Err(Error::Corrupt("empty interval table"));
        }
        if s64 > r.remaining() as u64 / 24 {
            return Err(Error::Corrupt("interval count overruns blob"));
        }
        let s = s64 as usize;

        let mut begins = Vec::with_capacity(s);
        for _ in 0..s {
            begins.push(r.get_u64()?);
        }
        let mut ends = Vec::with_capacity(s);
        for _ in 0..s {
            ends.push(r.get_u64()?);
        }
        let mut cumulative = Vec::with_capacity(s + 1);
        cumulative.push(0u64);
        for _ in 0..s {
            cumulative.push(r.get_u64()?);
        }

        for i in 0..s {
            if begins[i] > ends[i] {
                return Err(Error::Corrupt("interval endpoints out of order"));
            }
            if i + 1 < s && ends[i] >= begins[i + 1] {
                return Err(Error::Corrupt("intervals overlap"));
            }
            if cumulative[i] > cumulative[i + 1] {
                return Err(Error::Corrupt("capacity prefix sums not monotone"));
            }
        }

        Ok(Self::from_parts(
            begins.into_boxed_slice(),
            ends.into_boxed_slice(),
            cumulative.into_boxed_slice(),
        ))
    }
}

/// Picks the gap threshold that splits `keys` into intervals.
///
/// A bounded min-heap retains the budgeted number of largest gaps; gaps tied with
/// the smallest retained value do not justify a split and are folded back into the
/// dense mass. The survivors are scanned from small to large as candidate
/// thresholds, scoring each with the proxy `rho = dense^2 / slots`: folding small
/// gaps back grows the dense mass, keeping them spends interval bookkeeping out of
/// the slot budget. Smallest candidate wins ties.
fn select_threshold(bits_per_key: f64, residual: f64, keys: &[u64]) -> u64 {
    let n = keys.len();
    if n < 2 {
        return u64::MAX;
    }
    // The budgeted candidate count, floored at ~log2(n) so that small key sets
    // can still split on a dominant gap, and capped at the number of gaps.
    let budgeted = (bits_per_key * n as f64 / INTERVAL_COST_BITS) as usize;
    let retain = budgeted.max(n.ilog2() as usize + 1).min(n - 1);

    let mut heap: BinaryHeap<Reverse<u64>> = BinaryHeap::with_capacity(retain + 1);
    for pair in keys.windows(2) {
        let gap = pair[1] - pair[0];
        if heap.len() >= retain {
            match heap.peek() {
                Some(&Reverse(min)) if min > gap => continue,
                _ => {
                    heap.pop();
                }
            }
        }
        heap.push(Reverse(gap));
    }

    let mut gaps: Vec<u64> = heap.into_iter().map(|Reverse(gap)| gap).collect();
    gaps.sort_unstable();
    let smallest = gaps[0];
    let candidates = &gaps[gaps.partition_point(|&g| g == smallest)..];
    if candidates.is_empty() {
        // Every gap tied at the heap minimum: degrade to a single interval.
        return u64::MAX;
    }

    let outside: u64 = candidates.iter().sum();
    let mut dense = keys[n - 1] - keys[0] - outside;

    let per_gap_cost = INTERVAL_COST_BITS / n as f64;
    let mut best = candidates[0];
    let mut best_rho = f64::INFINITY;
    let mut i = 0;
    while i < candidates.len() {
        let kept = (candidates.len() - i) as f64;
        let slots = libm::ceil(
            libm::pow(2.0, residual - per_gap_cost * (kept + 1.0)) * n as f64,
        );
        let rho = dense as f64 * dense as f64 / slots;
        if rho < best_rho {
            best_rho = rho;
            best = candidates[i];
        }
        // Fold every gap equal to this candidate back into the dense mass.
        let value = candidates[i];
        while i < candidates.len() && candidates[i] == value {
            dense += value;
            i += 1;
        }
    }
    best
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec::Vec;

    fn dense_run() -> CdfModel {
        CdfModel::build(10.0, 4, &[10, 11, 12, 13, 14])
    }

    #[test]
    fn tight_run_stays_one_interval() {
        let model = dense_run();
        assert_eq!(model.segments(), 1);
        assert!(model.positions() >= 1);
    }

    #[test]
    fn point_classification() {
        let model = dense_run();
        assert!(matches!(model.classify(9), PointOutcome::OutOfScope));
        assert!(matches!(model.classify(15), PointOutcome::OutOfScope));
        assert!(matches!(model.classify(10), PointOutcome::Exist));
        assert!(matches!(model.classify(14), PointOutcome::Exist));
        assert!(matches!(model.classify(12), PointOutcome::Uncertain(_)));
    }

    #[test]
    fn dominant_gap_splits_the_model() {
        let keys = [1u64, 2, 3, 1_000_000, 1_000_001, 1_000_002];
        let model = CdfModel::build(10.0, 4, &keys);
        assert_eq!(model.segments(), 2);
        assert!(matches!(model.classify(500_000), PointOutcome::OutOfScope));
        assert!(matches!(model.classify(3), PointOutcome::Exist));
        assert!(matches!(model.classify(1_000_000), PointOutcome::Exist));
        assert!(matches!(
            model.classify(1_000_001),
            PointOutcome::Uncertain(_)
        ));
    }

    #[test]
    fn lone_key_becomes_zero_capacity_interval() {
        let keys = [5u64, 6, 7, 8, 1_000_000_000];
        let model = CdfModel::build(10.0, 4, &keys);
        assert_eq!(model.segments(), 2);
        assert!(matches!(model.classify(1_000_000_000), PointOutcome::Exist));
        assert!(matches!(
            model.classify(999_999_999),
            PointOutcome::OutOfScope
        ));
        assert!(matches!(
            model.classify(1_000_000_001),
            PointOutcome::OutOfScope
        ));
    }

    #[test]
    fn range_classification() {
        let keys = [1u64, 2, 3, 1_000_000, 1_000_001, 1_000_002];
        let model = CdfModel::build(10.0, 4, &keys);
        // Strictly inside the gap.
        assert!(matches!(
            model.classify_range(100, 999_999),
            RangeOutcome::OutOfScope
        ));
        // Touches the second interval's begin.
        assert!(matches!(
            model.classify_range(999_999, 1_000_001),
            RangeOutcome::Exist
        ));
        // Spans the gap entirely.
        assert!(matches!(
            model.classify_range(500, 2_000_000),
            RangeOutcome::Exist
        ));
        // Beyond either end.
        assert!(matches!(
            model.classify_range(1_000_003, u64::MAX),
            RangeOutcome::OutOfScope
        ));
        assert!(matches!(model.classify_range(0, 0), RangeOutcome::OutOfScope));
        // Covers the first key.
        assert!(matches!(model.classify_range(0, 1), RangeOutcome::Exist));
    }

    #[test]
    fn interior_projection_is_monotone_and_in_range() {
        let keys: Vec<u64> = (0..500u64).map(|k| k * 37 + 11).collect();
        let model = CdfModel::build(12.0, 16, &keys);
        let positions = model.project_interior(&keys);
        assert_eq!(positions.len() as u64 + model_boundary_keys(&model), 500);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        assert!(*positions.last().unwrap() < model.positions());
    }

    fn model_boundary_keys(model: &CdfModel) -> u64 {
        // Every interval contributes its two endpoints (one when begin == end).
        model
            .begins
            .iter()
            .zip(model.ends.iter())
            .map(|(b, e)| if b == e { 1 } else { 2 })
            .sum()
    }

    #[test]
    fn projection_survives_extreme_keys() {
        // A generous budget makes alpha large enough that alpha * key needs far
        // more than 64 bits while the keys press against u64::MAX.
        let keys: Vec<u64> = (0..1000u64).map(|k| u64::MAX - 999 + k).collect();
        let model = CdfModel::build(40.0, 64, &keys);
        assert_eq!(model.segments(), 1);
        for &key in &keys[1..999] {
            match model.classify(key) {
                PointOutcome::Uncertain(pos) => assert!(pos < model.positions()),
                _ => panic!("interior member not projected"),
            }
        }
    }

    #[test]
    fn serialization_round_trip() {
        let keys = [5u64, 6, 7, 8, 1_000_000_000];
        let model = CdfModel::build(10.0, 4, &keys);
        let mut w = ByteWriter::with_capacity(model.byte_size());
        model.write(&mut w);
        let blob = w.finish();
        assert_eq!(blob.len(), model.byte_size());

        let mut r = ByteReader::new(&blob);
        let copy = CdfModel::read(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(&*copy.begins, &*model.begins);
        assert_eq!(&*copy.ends, &*model.ends);
        assert_eq!(&*copy.cumulative, &*model.cumulative);
    }

    #[test]
    fn corrupt_models_are_rejected() {
        let keys = [1u64, 2, 3, 900, 901];
        let model = CdfModel::build(10.0, 4, &keys);
        let mut w = ByteWriter::with_capacity(model.byte_size());
        model.write(&mut w);
        let blob = w.finish();

        let mut truncated = blob.clone();
        truncated.truncate(blob.len() - 8);
        assert!(CdfModel::read(&mut ByteReader::new(&truncated)).is_err());

        // Swap begins and ends so every interval is inverted.
        let s = model.segments();
        let mut swapped = blob.clone();
        let (head, tail) = swapped.split_at_mut(8 + 8 * s);
        tail[..8 * s].swap_with_slice(&mut head[8..8 + 8 * s]);
        assert!(CdfModel::read(&mut ByteReader::new(&swapped)).is_err());
    }
}
