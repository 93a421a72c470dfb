// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lazy, single-pass producers of numeric values.

use std::collections::VecDeque;
use std::iter::{Fuse, Peekable};

/// Number of records fetched at once from a [`RecordPager`] by default.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Outcome of pulling the next value out of a [`Producer`].
///
/// Exhaustion is a distinct variant, so that a value equal to zero is never
/// mistaken for the end of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next<T> {
    /// The next value of the sequence.
    Value(T),
    /// The sequence has no more values.
    Exhausted,
}

impl<T> Next<T> {
    /// Converts into an [`Option`], mapping [`Next::Exhausted`] to [`None`].
    pub fn into_option(self) -> Option<T> {
        match self {
            Next::Value(t) => Some(t),
            Next::Exhausted => None,
        }
    }
}

impl<T> From<Option<T>> for Next<T> {
    fn from(option: Option<T>) -> Self {
        match option {
            Some(t) => Next::Value(t),
            None => Next::Exhausted,
        }
    }
}

/// A forward-only cursor over a finite sequence of values.
///
/// A producer can't be restarted: once [`Next::Exhausted`] is returned, every
/// subsequent call returns it too.
///
/// ```
/// # use poolreduce::{Next, Producer};
/// let mut producer = Producer::new([3, 0, 4]);
/// assert_eq!(producer.next_value(), Next::Value(3));
/// assert_eq!(producer.next_value(), Next::Value(0));
/// assert!(producer.has_more());
/// assert_eq!(producer.next_value(), Next::Value(4));
/// assert!(producer.is_exhausted());
/// assert_eq!(producer.next_value(), Next::Exhausted);
/// assert_eq!(producer.yielded(), 3);
/// ```
pub struct Producer<I: Iterator> {
    /// Underlying source, fused so that exhaustion is sticky.
    iter: Peekable<Fuse<I>>,
    /// Number of values handed out so far.
    yielded: usize,
}

impl<I: Iterator> Producer<I> {
    /// Creates a producer over the given sequence.
    pub fn new(source: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: source.into_iter().fuse().peekable(),
            yielded: 0,
        }
    }

    /// Returns whether a value is available, without consuming it.
    pub fn has_more(&mut self) -> bool {
        self.iter.peek().is_some()
    }

    /// Returns whether the sequence has no more values.
    pub fn is_exhausted(&mut self) -> bool {
        !self.has_more()
    }

    /// Consumes the next value of the sequence.
    pub fn next_value(&mut self) -> Next<I::Item> {
        let next = Next::from(self.iter.next());
        if let Next::Value(_) = next {
            self.yielded += 1;
        }
        next
    }

    /// Returns the number of values handed out so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }
}

impl<P, F, T> Producer<PagedRecords<P, F>>
where
    P: RecordPager,
    F: FnMut(&P::Record) -> T,
{
    /// Creates a producer over records fetched page by page, projecting each
    /// record to a numeric value.
    pub fn from_pages(pager: P, page_size: usize, projection: F) -> Self {
        Self::new(PagedRecords::new(pager, page_size, projection))
    }
}

impl<I: Iterator> Iterator for Producer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        self.next_value().into_option()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// An external store of records that can be read one page at a time.
pub trait RecordPager {
    /// Type of the records in the store.
    type Record;

    /// Fetches at most `limit` records, starting at the given offset. A page
    /// shorter than `limit` marks the end of the store.
    fn fetch_page(&mut self, offset: usize, limit: usize) -> Vec<Self::Record>;
}

/// Iterator over the records of a [`RecordPager`], projected to a value.
///
/// At most one page is buffered at any time.
pub struct PagedRecords<P: RecordPager, F> {
    pager: P,
    projection: F,
    page_size: usize,
    offset: usize,
    page: VecDeque<P::Record>,
    last_page: bool,
}

impl<P: RecordPager, F> PagedRecords<P, F> {
    /// Creates an iterator over the given pager. A page size of zero is
    /// treated as one.
    pub fn new(pager: P, page_size: usize, projection: F) -> Self {
        Self {
            pager,
            projection,
            page_size: page_size.max(1),
            offset: 0,
            page: VecDeque::new(),
            last_page: false,
        }
    }
}

impl<P, F, T> Iterator for PagedRecords<P, F>
where
    P: RecordPager,
    F: FnMut(&P::Record) -> T,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.page.is_empty() && !self.last_page {
            let page = self.pager.fetch_page(self.offset, self.page_size);
            self.offset += page.len();
            self.last_page = page.len() < self.page_size;
            self.page.extend(page);
        }
        let record = self.page.pop_front()?;
        Some((self.projection)(&record))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_zero_is_not_exhaustion() {
        let mut producer = Producer::new(vec![0u64, 0, 5]);
        assert_eq!(producer.next_value(), Next::Value(0));
        assert_eq!(producer.next_value(), Next::Value(0));
        assert_eq!(producer.next_value(), Next::Value(5));
        assert_eq!(producer.next_value(), Next::Exhausted);
    }

    #[test]
    fn test_empty() {
        let mut producer = Producer::new(Vec::<u64>::new());
        assert!(producer.is_exhausted());
        assert!(!producer.has_more());
        assert_eq!(producer.next_value(), Next::Exhausted);
        assert_eq!(producer.yielded(), 0);
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        // An iterator that resumes after returning `None` once.
        let mut calls = 0;
        let flaky = std::iter::from_fn(move || {
            calls += 1;
            match calls {
                1 => Some(1),
                2 => None,
                _ => Some(2),
            }
        });
        let mut producer = Producer::new(flaky);
        assert_eq!(producer.next_value(), Next::Value(1));
        assert_eq!(producer.next_value(), Next::Exhausted);
        assert_eq!(producer.next_value(), Next::Exhausted);
        assert!(producer.is_exhausted());
    }

    #[test]
    fn test_has_more_doesnt_consume() {
        let mut producer = Producer::new([1, 2]);
        assert!(producer.has_more());
        assert!(producer.has_more());
        assert_eq!(producer.yielded(), 0);
        assert_eq!(producer.collect::<Vec<_>>(), vec![1, 2]);
    }

    /// Example of a record as returned by a database query.
    struct Data {
        datum: u64,
    }

    /// In-memory stand-in for a paginated query, that records the requested
    /// pages.
    struct InMemoryPager {
        rows: Vec<u64>,
        requests: Vec<(usize, usize)>,
    }

    impl RecordPager for &mut InMemoryPager {
        type Record = Data;

        fn fetch_page(&mut self, offset: usize, limit: usize) -> Vec<Data> {
            self.requests.push((offset, limit));
            self.rows
                .iter()
                .skip(offset)
                .take(limit)
                .map(|&datum| Data { datum })
                .collect()
        }
    }

    #[test]
    fn test_paged_records_across_pages() {
        let mut pager = InMemoryPager {
            rows: (1..=250).collect(),
            requests: Vec::new(),
        };
        let producer = Producer::from_pages(&mut pager, DEFAULT_PAGE_SIZE, |d: &Data| d.datum);
        let values = producer.collect::<Vec<u64>>();
        assert_eq!(values, (1..=250).collect::<Vec<u64>>());
        assert_eq!(pager.requests, vec![(0, 100), (100, 100), (200, 100)]);
    }

    #[test]
    fn test_paged_records_exact_multiple() {
        let mut pager = InMemoryPager {
            rows: (0..20).collect(),
            requests: Vec::new(),
        };
        let sum = Producer::from_pages(&mut pager, 10, |d: &Data| d.datum).sum::<u64>();
        assert_eq!(sum, 190);
        // The last, empty page is needed to detect the end.
        assert_eq!(pager.requests, vec![(0, 10), (10, 10), (20, 10)]);
    }

    #[test]
    fn test_paged_records_is_lazy() {
        let mut pager = InMemoryPager {
            rows: (0..50).collect(),
            requests: Vec::new(),
        };
        let mut producer = Producer::from_pages(&mut pager, 10, |d: &Data| d.datum);
        assert_eq!(producer.next_value(), Next::Value(0));
        drop(producer);
        assert_eq!(pager.requests, vec![(0, 10)]);
    }
}
