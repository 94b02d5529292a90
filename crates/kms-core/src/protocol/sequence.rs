//! Sequence numbering for input batches.
//!
//! # What is a sequence number? (for beginners)
//!
//! Every INPUT_BATCH carries a monotonically increasing integer called a
//! *sequence number*.  The receiver uses it to:
//!
//! - **Detect missing batches**: receiving 1, 2 and 4 means 3 was lost.
//! - **Drop duplicates**: a batch that was retried after its first copy
//!   already arrived carries the same number and is ignored.
//! - **Drop stale batches**: anything lower than what was already applied
//!   would move the receiver backwards, so it is discarded.
//!
//! [`SequenceCounter`] is the sender half (one per session, shared between
//! tasks), [`SequenceTracker`] the receiver half.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing counter.
///
/// Starts at 0 and wraps at `u64::MAX` without panicking.
///
/// # Examples
///
/// ```rust
/// use kms_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first [`next`](Self::next) returns `start`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            inner: AtomicU64::new(start),
        }
    }

    /// Returns the next sequence number and atomically increments the counter.
    ///
    /// `Relaxed` is enough: the value orders messages, it does not publish memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) would hand out.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of checking one received sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// The first number seen, or exactly one past the last.
    InOrder,
    /// Accepted, but at least one number in between never arrived.
    Gap { expected: u64, got: u64 },
    /// Equal to the last accepted number; drop it.
    Duplicate(u64),
    /// Lower than the last accepted number; drop it.
    Stale { last: u64, got: u64 },
}

impl SequenceCheck {
    /// `true` if the batch should be applied.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SequenceCheck::InOrder | SequenceCheck::Gap { .. })
    }
}

/// Receiver-side check that keeps applied sequence numbers non-decreasing.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `seq` and, if it is accepted, records it as the last one.
    pub fn observe(&mut self, seq: u64) -> SequenceCheck {
        let check = match self.last {
            None => SequenceCheck::InOrder,
            Some(last) if seq == last => SequenceCheck::Duplicate(seq),
            Some(last) if seq < last => SequenceCheck::Stale { last, got: seq },
            Some(last) if seq == last + 1 => SequenceCheck::InOrder,
            Some(last) => SequenceCheck::Gap {
                expected: last + 1,
                got: seq,
            },
        };
        if check.is_accepted() {
            self.last = Some(seq);
        }
        check
    }

    /// Last accepted sequence number.
    pub fn last(&self) -> Option<u64> {
        self.last
    }
}
