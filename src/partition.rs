// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::{fmt, num::NonZeroUsize};

/// A contiguous, half-open span `[start, end)` of the remote resource.
///
/// `end` is `None` only for the fallback plan when the resource length is
/// unknown, meaning "until the server closes the body".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// Value for a `Range` header asking for `[from, end)`.
    ///
    /// HTTP ranges are inclusive, so the last byte is `end - 1`.
    pub fn header_from(&self, from: u64) -> String {
        match self.end {
            Some(end) => format!("bytes={from}-{}", end - 1),
            None => format!("bytes={from}-"),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {end})", self.start),
            None => write!(f, "[{}, EOF)", self.start),
        }
    }
}

/// How a session fetches the resource. Selected once, never mixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchPlan {
    /// One worker reads the whole body.
    Single(ByteRange),
    /// One worker per range, all in parallel.
    Ranged(Vec<ByteRange>),
}

impl FetchPlan {
    pub fn ranges(&self) -> &[ByteRange] {
        match self {
            FetchPlan::Single(range) => std::slice::from_ref(range),
            FetchPlan::Ranged(ranges) => ranges,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, FetchPlan::Single(_))
    }
}

pub fn partition(length: Option<u64>, range_supported: bool, concurrency: NonZeroUsize) -> FetchPlan {
    let length = match length {
        // Nothing to fetch, whatever the server says about ranges.
        Some(0) => return FetchPlan::Ranged(Vec::new()),
        Some(length) if range_supported => length,
        Some(length) => return FetchPlan::Single(ByteRange::new(0, length)),
        None => return FetchPlan::Single(ByteRange::unbounded()),
    };

    let count = (concurrency.get() as u64).min(length);
    let size = length / count;
    let remainder = length % count;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for i in 0..count {
        // The first `remainder` ranges absorb one extra byte each.
        let len = if i < remainder { size + 1 } else { size };
        ranges.push(ByteRange::new(offset, offset + len));
        offset += len;
    }

    FetchPlan::Ranged(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn n(v: usize) -> NonZeroUsize {
        NonZeroUsize::new(v).unwrap()
    }

    #[test]
    fn even_split() {
        let plan = partition(Some(1_000_000), true, n(4));
        let sizes: Vec<_> = plan.ranges().iter().map(|r| r.len().unwrap()).collect();
        assert_eq!(sizes, vec![250_000; 4]);
        assert_eq!(plan.ranges()[0].start, 0);
        assert_eq!(plan.ranges()[3].end, Some(1_000_000));
    }

    #[test]
    fn remainder_goes_to_earlier_ranges() {
        let plan = partition(Some(10), true, n(4));
        assert_eq!(
            plan.ranges(),
            &[
                ByteRange::new(0, 3),
                ByteRange::new(3, 6),
                ByteRange::new(6, 8),
                ByteRange::new(8, 10),
            ]
        );
    }

    #[test]
    fn fewer_ranges_than_workers_for_tiny_resources() {
        let plan = partition(Some(3), true, n(5));
        assert_eq!(plan.ranges().len(), 3);
        assert!(plan.ranges().iter().all(|r| r.len() == Some(1)));
    }

    #[test]
    fn empty_resource_has_nothing_to_fetch() {
        for supported in [true, false] {
            assert_eq!(
                partition(Some(0), supported, n(5)),
                FetchPlan::Ranged(Vec::new())
            );
        }
    }

    #[test]
    fn no_range_support_falls_back_to_one_range() {
        let plan = partition(Some(1_000), false, n(5));
        assert!(plan.is_fallback());
        assert_eq!(plan.ranges(), &[ByteRange::new(0, 1_000)]);
    }

    #[test]
    fn unknown_length_falls_back_to_unbounded_range() {
        for supported in [true, false] {
            let plan = partition(None, supported, n(5));
            assert_eq!(plan, FetchPlan::Single(ByteRange::unbounded()));
        }
    }

    #[test]
    fn header_is_inclusive() {
        let range = ByteRange::new(250, 500);
        assert_eq!(range.header_from(250), "bytes=250-499");
        assert_eq!(range.header_from(300), "bytes=300-499");
        assert_eq!(ByteRange::unbounded().header_from(42), "bytes=42-");
    }

    proptest! {
        #[test]
        fn ranges_cover_exactly_and_are_balanced(length in 0u64..5_000_000, workers in 1usize..64) {
            let plan = partition(Some(length), true, n(workers));
            let ranges = plan.ranges();

            prop_assert_eq!(ranges.len() as u64, (workers as u64).min(length));

            let mut next = 0;
            for range in ranges {
                prop_assert_eq!(range.start, next);
                let len = range.len().unwrap();
                prop_assert!(len >= 1);
                next += len;
            }
            prop_assert_eq!(next, length);

            if let (Some(max), Some(min)) = (
                ranges.iter().filter_map(ByteRange::len).max(),
                ranges.iter().filter_map(ByteRange::len).min(),
            ) {
                prop_assert!(max - min <= 1);
            }
        }
    }
}
