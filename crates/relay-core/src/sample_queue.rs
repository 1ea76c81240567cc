//! Bounded per-kind sample buffer with drop-oldest overflow.
//!
//! - `put` never blocks and never fails: when full, the oldest sample is
//!   evicted (and logged with its original timestamp) to admit the new one
//! - `get` never blocks: `None` is the empty sentinel

use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use relay_common::sample::format_timestamp;
use relay_common::{Sample, SampleValue, StreamKind};

/// A bounded, timestamp-tagging FIFO for one stream kind.
pub struct SampleQueue<T = SampleValue> {
    kind: StreamKind,
    capacity: usize,
    slots: Mutex<VecDeque<Sample<T>>>,
    evicted: AtomicU64,
    eviction_counter: Option<IntCounter>,
}

impl<T> SampleQueue<T> {
    /// Create a queue. A zero capacity is raised to one.
    pub fn new(kind: StreamKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            evicted: AtomicU64::new(0),
            eviction_counter: None,
        }
    }

    /// Also count evictions on a Prometheus counter.
    pub fn with_eviction_counter(mut self, counter: IntCounter) -> Self {
        self.eviction_counter = Some(counter);
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Total samples evicted since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Tag `value` with the current time and enqueue it.
    pub fn put(&self, value: T) {
        self.put_sample(Sample::now(value));
    }

    /// Enqueue an already-tagged sample.
    pub fn put_sample(&self, sample: Sample<T>) {
        let evicted = {
            let mut slots = self.slots.lock();
            let evicted = if slots.len() >= self.capacity {
                slots.pop_front()
            } else {
                None
            };
            slots.push_back(sample);
            evicted
        };

        if let Some(old) = evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            if let Some(counter) = &self.eviction_counter {
                counter.inc();
            }
            warn!(
                kind = %self.kind,
                evicted_timestamp = %format_timestamp(&old.timestamp),
                capacity = self.capacity,
                "sample queue full, evicted oldest sample"
            );
        }
    }

    /// Remove and return the oldest sample, or `None` when empty.
    pub fn get(&self) -> Option<Sample<T>> {
        self.slots.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_get_on_empty_is_none() {
        let queue: SampleQueue = SampleQueue::new(StreamKind::Kpm, 10);
        assert!(queue.get().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_eleven_into_ten_evicts_exactly_one() {
        let queue = SampleQueue::new(StreamKind::Kpm, 10);
        for v in 1..=11i64 {
            queue.put(SampleValue::Int(v));
        }
        assert_eq!(queue.evicted_total(), 1);
        assert_eq!(queue.len(), 10);

        let drained: Vec<SampleValue> = std::iter::from_fn(|| queue.get())
            .map(|s| s.value)
            .collect();
        let expected: Vec<SampleValue> = (2..=11i64).map(SampleValue::Int).collect();
        assert_eq!(drained, expected);
    }

    #[test]
    fn test_eviction_counter_is_bumped() {
        let counter = IntCounter::new("evicted", "evicted").expect("counter");
        let queue =
            SampleQueue::new(StreamKind::Title, 1).with_eviction_counter(counter.clone());
        queue.put(SampleValue::from("a"));
        queue.put(SampleValue::from("b"));
        queue.put(SampleValue::from("c"));
        assert_eq!(counter.get(), 2);
        assert_eq!(queue.get().map(|s| s.value), Some(SampleValue::from("c")));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue: SampleQueue = SampleQueue::new(StreamKind::Pxm, 0);
        assert_eq!(queue.capacity(), 1);
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..32,
            values in proptest::collection::vec(any::<i64>(), 0..200),
        ) {
            let queue = SampleQueue::new(StreamKind::Cpm, capacity);
            for v in &values {
                queue.put(SampleValue::Int(*v));
                prop_assert!(queue.len() <= capacity);
            }

            let kept: Vec<i64> = std::iter::from_fn(|| queue.get())
                .filter_map(|s| match s.value {
                    SampleValue::Int(v) => Some(v),
                    _ => None,
                })
                .collect();
            let start = values.len().saturating_sub(capacity);
            prop_assert_eq!(&kept[..], &values[start..]);
            prop_assert_eq!(queue.evicted_total() as usize, start);
        }
    }
}
