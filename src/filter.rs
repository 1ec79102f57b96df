//! The top-level filter: a CDF model composed with a bias-indexed block list.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::RangeInclusive;

#[cfg(feature = "bincode")]
use bincode::{Decode, Encode};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::block::{self, BlockView};
use crate::error::Error;
use crate::model::{CdfModel, PointOutcome, RangeOutcome};
use crate::wire::{aligned, ByteReader, ByteWriter};
use crate::Filter;

/// Rebuild once when at least this much of the bit budget was left on the table.
const RETUNE_SLACK_BITS: f64 = 0.2;

/// Learned range filter over a fixed set of 64-bit keys.
///
/// A `RangeFilter` is built once from a sorted, strictly increasing key set and is
/// immutable afterwards. It answers point-membership and inclusive-range-overlap
/// probes with no false negatives; false positives arise only from the lossy key
/// projection, at a rate governed by the `bits_per_key` budget.
///
/// ```
/// # extern crate alloc;
/// use cdfilter::{Filter, RangeFilter};
/// # use alloc::vec::Vec;
///
/// let keys: Vec<u64> = (0..10_000u64).map(|k| k * k + 7).collect();
/// let filter = RangeFilter::new(12.0, 64, &keys).unwrap();
///
/// // no false negatives, for points or ranges
/// for &key in &keys {
///     assert!(filter.point(key));
///     assert!(filter.range(key, key + 1));
/// }
///
/// // probes outside the key span are exact
/// assert!(!filter.point(6));
/// assert!(!filter.contains(&(u64::MAX)));
/// assert!(filter.contains_range(0..=7));
///
/// // round trip through the self-describing blob
/// let blob = filter.serialize();
/// assert_eq!(blob.len(), filter.byte_size());
/// let copy = RangeFilter::deserialize(&blob).unwrap();
/// assert!(copy.point(7));
/// ```
///
/// Serializing and deserializing `RangeFilter`s through generic frameworks can be
/// enabled with the [`serde`] feature (or [`bincode`] for bincode); the
/// [`serialize`](Self::serialize)/[`deserialize`](Self::deserialize) blob format
/// is always available and is the stable on-disk form.
///
/// [`serde`]: http://serde.rs
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "bincode", derive(Encode, Decode))]
#[derive(Debug, Clone)]
pub struct RangeFilter {
    block_size: u16,
    last_block_size: u16,
    model: CdfModel,
    /// First projected position of each batch, then the final projected position.
    bias: Box<[u64]>,
    /// Concatenated encoded blocks.
    payload: Box<[u8]>,
    /// Byte offset of each block inside `payload`; recomputed when mounting a
    /// serialized blob.
    offsets: Box<[usize]>,
}

impl RangeFilter {
    /// Builds a filter over `keys` with a target storage budget of
    /// `bits_per_key` and `block_size` projected positions per bitset block.
    ///
    /// `keys` must be non-empty, sorted, and strictly increasing;
    /// `block_size` must be at least 1.
    pub fn new(bits_per_key: f64, block_size: u16, keys: &[u64]) -> Result<Self, Error> {
        if keys.is_empty() {
            return Err(Error::InvalidInput("empty key set"));
        }
        if block_size == 0 {
            return Err(Error::InvalidInput("block size must be at least 1"));
        }
        if !keys.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(Error::InvalidInput(
                "keys must be sorted and strictly increasing",
            ));
        }
        if !bits_per_key.is_finite() || bits_per_key <= 0.0 {
            return Err(Error::BudgetTooSmall(bits_per_key));
        }

        let filter = Self::build(bits_per_key, block_size, keys);
        // One feedback step: when encoding overheads round well under budget,
        // rebuild with the slack folded back in. Never recurses.
        let actual = filter.byte_size() as f64 * 8.0 / keys.len() as f64;
        let slack = bits_per_key - actual;
        if slack < RETUNE_SLACK_BITS {
            return Ok(filter);
        }
        Ok(Self::build(bits_per_key + slack, block_size, keys))
    }

    fn build(bits_per_key: f64, block_size: u16, keys: &[u64]) -> Self {
        let model = CdfModel::build(bits_per_key, block_size, keys);
        let positions = model.project_interior(keys);
        debug_assert!(positions.last().map_or(true, |&p| p < model.positions()));
        Self::assemble(model, &positions, block_size)
    }

    /// Partitions the projected positions into batches and encodes one bitset
    /// block per batch, rebased to the batch's first position.
    fn assemble(model: CdfModel, positions: &[u64], block_size: u16) -> Self {
        if positions.is_empty() {
            // No interior keys: every member is an interval boundary.
            return Self {
                block_size,
                last_block_size: 0,
                model,
                bias: Box::new([]),
                payload: Box::new([]),
                offsets: Box::new([]),
            };
        }

        let batch = block_size as usize;
        let final_position = positions[positions.len() - 1];
        let nbatches = positions.len().div_ceil(batch);
        let mut bias = Vec::with_capacity(nbatches + 1);
        let mut offsets = Vec::with_capacity(nbatches);
        let mut payload = Vec::new();
        let mut deltas: Vec<u64> = Vec::with_capacity(batch);
        for (j, chunk) in positions.chunks(batch).enumerate() {
            let base = chunk[0];
            let upper = match positions.get((j + 1) * batch) {
                Some(&next) => next,
                None => final_position,
            };
            deltas.clear();
            deltas.extend(chunk.iter().map(|&p| p - base));
            bias.push(base);
            offsets.push(payload.len());
            payload.extend_from_slice(&block::encode(&deltas, upper - base));
        }
        bias.push(final_position);

        Self {
            block_size,
            last_block_size: ((positions.len() - 1) % batch + 1) as u16,
            model,
            bias: bias.into_boxed_slice(),
            payload: payload.into_boxed_slice(),
            offsets: offsets.into_boxed_slice(),
        }
    }

    fn from_parts(
        block_size: u16,
        last_block_size: u16,
        model: CdfModel,
        bias: Box<[u64]>,
        payload: Box<[u8]>,
        offsets: Box<[usize]>,
    ) -> Self {
        Self {
            block_size,
            last_block_size,
            model,
            bias,
            payload,
            offsets,
        }
    }

    /// Returns `true` if the filter probably contains `key`; `false` answers are
    /// exact.
    pub fn point(&self, key: u64) -> bool {
        match self.model.classify(key) {
            PointOutcome::Exist => true,
            PointOutcome::OutOfScope => false,
            PointOutcome::Uncertain(pos) => self.probe(pos),
        }
    }

    /// Returns `true` if the filter probably contains a key in `[lo, hi]`;
    /// `false` answers are exact. Requires `lo <= hi`.
    pub fn range(&self, lo: u64, hi: u64) -> bool {
        debug_assert!(lo <= hi);
        match self.model.classify_range(lo, hi) {
            RangeOutcome::Exist => true,
            RangeOutcome::OutOfScope => false,
            RangeOutcome::Uncertain(lo_pos, hi_pos) => self.probe_range(lo_pos, hi_pos),
        }
    }

    fn probe(&self, pos: u64) -> bool {
        if self.bias.is_empty() || pos < self.bias[0] || pos > self.bias[self.bias.len() - 1] {
            return false;
        }
        let idx = self.bias.partition_point(|&bias| bias <= pos) - 1;
        if self.bias[idx] == pos {
            return true;
        }
        self.block(idx).contains(pos - self.bias[idx])
    }

    fn probe_range(&self, lo_pos: u64, hi_pos: u64) -> bool {
        if self.bias.is_empty()
            || hi_pos < self.bias[0]
            || lo_pos > self.bias[self.bias.len() - 1]
        {
            return false;
        }
        let insert = self.bias.partition_point(|&bias| bias <= hi_pos);
        if insert == self.bias.len() {
            // hi_pos clears every bias while lo_pos does not, so the range
            // covers the final bias, an occupied position.
            return true;
        }
        let idx = insert - 1;
        if self.bias[idx] == hi_pos || lo_pos <= self.bias[idx] {
            return true;
        }
        self.block(idx)
            .contains_range(lo_pos - self.bias[idx], hi_pos - self.bias[idx])
    }

    fn block(&self, idx: usize) -> BlockView<'_> {
        let len = if idx + 1 == self.offsets.len() {
            self.last_block_size
        } else {
            self.block_size
        } as usize;
        let universe = self.bias[idx + 1] - self.bias[idx];
        BlockView::mount(&self.payload[self.offsets[idx]..], len, universe)
    }

    /// Size of the serialized filter in bytes, computed without serializing.
    pub fn byte_size(&self) -> usize {
        aligned(8 + 8 + 2 + 2) + 8 * self.bias.len() + self.model.byte_size() + self.payload.len()
    }

    /// Serializes the filter into a self-describing little-endian blob.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.byte_size());
        w.put_u64(self.offsets.len() as u64);
        w.put_u64(self.payload.len() as u64);
        w.put_u16(self.block_size);
        w.put_u16(self.last_block_size);
        w.pad();
        for &bias in self.bias.iter() {
            w.put_u64(bias);
        }
        self.model.write(&mut w);
        w.put_bytes(&self.payload);
        let blob = w.finish();
        debug_assert_eq!(blob.len(), self.byte_size());
        blob
    }

    /// Mounts a filter from a blob produced by [`serialize`](Self::serialize).
    ///
    /// The payload is copied into a fresh buffer, so `bytes` may be released
    /// afterwards. Structural damage yields [`Error::Corrupt`]; no input panics.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(bytes);
        let nbatches64 = r.get_u64()?;
        let payload_size64 = r.get_u64()?;
        let block_size = r.get_u16()?;
        let last_block_size = r.get_u16()?;
        r.skip_pad()?;

        if payload_size64 > r.remaining() as u64 {
            return Err(Error::Corrupt("payload size overruns blob"));
        }
        // Every block occupies at least one payload byte.
        if nbatches64 > payload_size64 {
            return Err(Error::Corrupt("batch count overruns payload"));
        }
        let nbatches = nbatches64 as usize;
        let payload_size = payload_size64 as usize;
        if nbatches > 0
            && (block_size == 0 || last_block_size == 0 || last_block_size > block_size)
        {
            return Err(Error::Corrupt("batch sizes out of range"));
        }

        let mut bias = Vec::new();
        if nbatches > 0 {
            bias.reserve_exact(nbatches + 1);
            for _ in 0..nbatches + 1 {
                bias.push(r.get_u64()?);
            }
            if !bias.windows(2).all(|pair| pair[0] <= pair[1]) {
                return Err(Error::Corrupt("bias values not monotone"));
            }
        }

        let model = CdfModel::read(&mut r)?;
        let payload = r.get_bytes(payload_size)?;
        if !r.is_empty() {
            return Err(Error::Corrupt("trailing bytes"));
        }

        // Recreate the block views by stepping through the payload.
        let mut offsets = Vec::with_capacity(nbatches);
        let mut offset = 0usize;
        for j in 0..nbatches {
            offsets.push(offset);
            let len = if j + 1 == nbatches {
                last_block_size
            } else {
                block_size
            } as usize;
            let universe = bias[j + 1] - bias[j];
            offset += BlockView::encoded_size(len, universe);
            if offset > payload.len() {
                return Err(Error::Corrupt("block walk overruns payload"));
            }
        }
        if offset != payload.len() {
            return Err(Error::Corrupt("payload size mismatch"));
        }

        Ok(Self::from_parts(
            block_size,
            last_block_size,
            model,
            bias.into_boxed_slice(),
            payload.to_vec().into_boxed_slice(),
            offsets.into_boxed_slice(),
        ))
    }

    #[cfg(test)]
    pub(crate) fn bias_for_test(&self) -> &[u64] {
        &self.bias
    }
}

impl Filter<u64> for RangeFilter {
    fn contains(&self, key: &u64) -> bool {
        self.point(*key)
    }

    fn contains_range(&self, range: RangeInclusive<u64>) -> bool {
        self.range(*range.start(), *range.end())
    }
}
