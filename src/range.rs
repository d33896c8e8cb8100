use std::ops::Bound;

use axum_extra::headers::Range;

/// A single requested byte sub-interval, both offsets inclusive.
///
/// A well-formed spec satisfies `from <= to < total`. Specs are produced by
/// the transport's Range-header parser, usually via [`RangeSpec::from_header`];
/// this crate never parses header text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub from: u64,
    pub to: u64,
}

impl RangeSpec {
    pub fn new(from: u64, to: u64) -> Self {
        RangeSpec { from, to }
    }

    /// Number of bytes covered by the interval.
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// A well-formed spec always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }

    /// True when the interval is well formed and lies inside a resource of
    /// `total` bytes.
    pub fn fits_within(&self, total: u64) -> bool {
        self.from <= self.to && self.to < total
    }

    /// Resolve an already-parsed `Range` header against the resource length,
    /// preserving the client's ordering.
    ///
    /// Suffix ranges (`bytes=-N`) are anchored to the end of the resource and
    /// over-long end positions are clamped to the final byte, per RFC 7233.
    /// Unsatisfiable items are dropped; an empty result means the caller
    /// should fall back to a 416 or a full-body response as it sees fit.
    pub fn from_header(range: &Range, total: u64) -> Vec<RangeSpec> {
        if total == 0 {
            return Vec::new();
        }

        let last = total - 1;

        range
            .satisfiable_ranges(total)
            .filter_map(|(start, end)| {
                let from = match start {
                    Bound::Included(start) => start,
                    Bound::Excluded(start) => start + 1,
                    Bound::Unbounded => 0,
                };

                let to = match end {
                    Bound::Included(end) => end.min(last),
                    Bound::Excluded(end) => end.checked_sub(1)?.min(last),
                    Bound::Unbounded => last,
                };

                let spec = RangeSpec { from, to };
                spec.fits_within(total).then_some(spec)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use axum_extra::headers::{Header, Range};

    use super::RangeSpec;

    fn range(header: &str) -> Range {
        let val = HeaderValue::from_str(header).unwrap();
        Range::decode(&mut [val].iter()).unwrap()
    }

    #[test]
    fn test_single_range() {
        let specs = RangeSpec::from_header(&range("bytes=0-499"), 1000);
        assert_eq!(vec![RangeSpec::new(0, 499)], specs);
    }

    #[test]
    fn test_multiple_ranges_preserve_order() {
        let specs = RangeSpec::from_header(&range("bytes=900-999,0-99"), 1000);
        assert_eq!(vec![RangeSpec::new(900, 999), RangeSpec::new(0, 99)], specs);
    }

    #[test]
    fn test_open_ended_range() {
        let specs = RangeSpec::from_header(&range("bytes=950-"), 1000);
        assert_eq!(vec![RangeSpec::new(950, 999)], specs);
    }

    #[test]
    fn test_suffix_range() {
        let specs = RangeSpec::from_header(&range("bytes=-100"), 1000);
        assert_eq!(vec![RangeSpec::new(900, 999)], specs);
    }

    #[test]
    fn test_end_clamped_to_resource() {
        let specs = RangeSpec::from_header(&range("bytes=500-2000"), 1000);
        assert_eq!(vec![RangeSpec::new(500, 999)], specs);
    }

    #[test]
    fn test_start_beyond_resource_dropped() {
        let specs = RangeSpec::from_header(&range("bytes=1000-1099"), 1000);
        assert!(specs.is_empty());
    }

    #[test]
    fn test_empty_resource() {
        let specs = RangeSpec::from_header(&range("bytes=0-0"), 0);
        assert!(specs.is_empty());
    }

    #[test]
    fn test_len() {
        assert_eq!(500, RangeSpec::new(0, 499).len());
        assert_eq!(1, RangeSpec::new(30, 30).len());
    }
}
