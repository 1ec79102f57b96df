//! Host-boundary plumbing for engines that plug filters in behind a policy
//! interface.
//!
//! A storage engine typically builds one filter per table file at flush or
//! compaction time, keyed by an opaque identifier, and later routes point and
//! range probes through a reader that resolves the identifier. The types here
//! supply that contract without dictating the host's threading or lifetime
//! model: the registry is a plain owned value, and the host decides where it
//! lives and when filters are evicted.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::Error;
use crate::filter::RangeFilter;

/// Which probe shapes the host intends to issue against a finished filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    /// Only point probes will be routed to the filter.
    Point,
    /// Point and range probes will be routed to the filter.
    Range,
}

/// Opaque identifier for a filter held in a [`FilterRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FilterId(u64);

/// Owner of built filters, mapping identifiers to instances.
///
/// The host keeps one registry per scope that needs it (an engine, a column
/// family) and frees filters by [`evict`](Self::evict)ing them.
pub struct FilterRegistry {
    next_id: u64,
    filters: BTreeMap<u64, (BuilderKind, RangeFilter)>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            filters: BTreeMap::new(),
        }
    }

    /// Number of filters currently registered.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Resolves an identifier to a borrowed reader, if still registered.
    pub fn reader(&self, id: FilterId) -> Option<FilterReader<'_>> {
        self.filters
            .get(&id.0)
            .map(|(kind, filter)| FilterReader {
                kind: *kind,
                filter,
            })
    }

    /// Removes a filter, returning it so the host may serialize or drop it.
    pub fn evict(&mut self, id: FilterId) -> Option<RangeFilter> {
        self.filters.remove(&id.0).map(|(_, filter)| filter)
    }

    fn insert(&mut self, kind: BuilderKind, filter: RangeFilter) -> FilterId {
        self.next_id += 1;
        let id = self.next_id;
        self.filters.insert(id, (kind, filter));
        FilterId(id)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates keys in sorted order and builds the filter on
/// [`finish`](Self::finish).
///
/// Hosts hand keys over one at a time as they write a table file; adjacent
/// duplicates are dropped so re-added keys cannot poison the build.
pub struct FilterBuilder {
    kind: BuilderKind,
    bits_per_key: f64,
    block_size: u16,
    keys: Vec<u64>,
}

impl FilterBuilder {
    /// Starts a builder with the filter parameters the finished filter will use.
    pub fn new(kind: BuilderKind, bits_per_key: f64, block_size: u16) -> Self {
        Self {
            kind,
            bits_per_key,
            block_size,
            keys: Vec::new(),
        }
    }

    /// Appends the next key. Keys must arrive in ascending order; an exact
    /// repeat of the previous key is ignored.
    pub fn add_key(&mut self, key: u64) {
        if self.keys.last() == Some(&key) {
            return;
        }
        self.keys.push(key);
    }

    /// Number of distinct keys added so far.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Builds the filter and deposits it in `registry`, returning the
    /// identifier the host will later resolve through
    /// [`FilterRegistry::reader`].
    pub fn finish(self, registry: &mut FilterRegistry) -> Result<FilterId, Error> {
        let filter = RangeFilter::new(self.bits_per_key, self.block_size, &self.keys)?;
        Ok(registry.insert(self.kind, filter))
    }
}

/// Borrowed view routing probes to one registered filter.
pub struct FilterReader<'a> {
    kind: BuilderKind,
    filter: &'a RangeFilter,
}

impl FilterReader<'_> {
    /// The probe shapes this filter was built for.
    pub fn kind(&self) -> BuilderKind {
        self.kind
    }

    /// Routes a point probe.
    pub fn may_match(&self, key: u64) -> bool {
        self.filter.point(key)
    }

    /// Routes an inclusive range probe. The host adjusts any exclusive upper
    /// bound before calling.
    pub fn may_match_range(&self, lo: u64, hi: u64) -> bool {
        debug_assert!(self.kind == BuilderKind::Range);
        self.filter.range(lo, hi)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn built(registry: &mut FilterRegistry, keys: &[u64]) -> FilterId {
        let mut builder = FilterBuilder::new(BuilderKind::Range, 10.0, 16);
        for &key in keys {
            builder.add_key(key);
        }
        builder.finish(registry).unwrap()
    }

    #[test]
    fn build_and_probe_through_the_registry() {
        let mut registry = FilterRegistry::new();
        let id = built(&mut registry, &[2, 3, 5, 7, 11, 13]);

        let reader = registry.reader(id).unwrap();
        assert_eq!(reader.kind(), BuilderKind::Range);
        assert!(reader.may_match(7));
        assert!(!reader.may_match(1));
        assert!(reader.may_match_range(8, 12));
        assert!(!reader.may_match_range(14, 100));
    }

    #[test]
    fn identifiers_are_distinct_and_evictable() {
        let mut registry = FilterRegistry::new();
        let a = built(&mut registry, &[1, 2, 3]);
        let b = built(&mut registry, &[10, 20, 30]);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        let evicted = registry.evict(a).unwrap();
        assert!(evicted.point(2));
        assert!(registry.reader(a).is_none());
        assert!(registry.reader(b).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn repeated_keys_collapse() {
        let mut builder = FilterBuilder::new(BuilderKind::Point, 10.0, 16);
        for key in [4u64, 4, 5, 5, 5, 9] {
            builder.add_key(key);
        }
        assert_eq!(builder.len(), 3);
        let mut registry = FilterRegistry::new();
        let id = builder.finish(&mut registry).unwrap();
        assert!(registry.reader(id).unwrap().may_match(5));
    }

    #[test]
    fn out_of_order_keys_fail_at_finish() {
        let mut builder = FilterBuilder::new(BuilderKind::Point, 10.0, 16);
        builder.add_key(9);
        builder.add_key(4);
        let mut registry = FilterRegistry::new();
        assert!(matches!(
            builder.finish(&mut registry),
            Err(Error::InvalidInput(_))
        ));
    }
}
