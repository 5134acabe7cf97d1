//! Bounded arithmetic-progression counters.
//!
//! A [`Sequence`] yields `start, start + increment, ...` up to a bound and then
//! fails forever; it never wraps. A [`StripedSequence`] interleaves N such
//! sequences (`start = 1..=N`, `increment = N`) so that concurrent callers
//! spread over N independent mutexes while the values of all lanes stay
//! disjoint.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{LifecycleError, Result};

/// A thread-safe, bounded, monotonic counter.
#[derive(Debug)]
pub struct Sequence {
    name: String,
    increment: u64,
    last: u64,
    max_value: u64,
    /// Next value to hand out; `None` once the bound has been passed.
    next: Mutex<Option<u64>>,
}

impl Sequence {
    /// Creates a sequence producing `start, start + increment, ...` while the
    /// value does not exceed `max_value`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidSequence`] if `increment` is zero or
    /// larger than `max_value`, or if `start` exceeds `max_value`.
    pub fn new(
        name: impl Into<String>,
        increment: u64,
        start: u64,
        max_value: u64,
    ) -> Result<Self> {
        let name = name.into();
        let reason = if increment == 0 {
            Some("increment must be at least 1")
        } else if increment > max_value {
            Some("increment exceeds max value")
        } else if start > max_value {
            Some("start exceeds max value")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(LifecycleError::InvalidSequence { name, reason });
        }

        // Largest progression value <= max_value; cannot overflow since it is
        // bounded by max_value itself.
        let last = start + (max_value - start) / increment * increment;

        Ok(Self {
            name,
            increment,
            last,
            max_value,
            next: Mutex::new(Some(start)),
        })
    }

    /// Returns the next value of the progression.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SequenceExhausted`] on every call after the
    /// last in-bound value has been handed out.
    pub fn next(&self) -> Result<u64> {
        let mut next = self.next.lock();
        let Some(value) = *next else {
            return Err(LifecycleError::SequenceExhausted {
                name: self.name.clone(),
                max_value: self.max_value,
            });
        };
        *next = if value == self.last {
            None
        } else {
            Some(value + self.increment)
        };
        Ok(value)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The final value this sequence will produce.
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last
    }
}

/// N interleaved [`Sequence`] lanes selected round-robin.
#[derive(Debug)]
pub struct StripedSequence {
    lanes: Vec<Sequence>,
    cursor: AtomicUsize,
}

impl StripedSequence {
    /// Creates `lanes` sequences with `start = 1..=lanes` and
    /// `increment = lanes`, all bounded by `max_value`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidSequence`] if `lanes` is zero or any
    /// lane would be invalid for `max_value`.
    pub fn new(name: &str, lanes: usize, max_value: u64) -> Result<Self> {
        let stride = u64::try_from(lanes)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| LifecycleError::InvalidSequence {
                name: name.to_string(),
                reason: "lane count must be at least 1",
            })?;

        let lanes = (1..=stride)
            .map(|start| Sequence::new(format!("{name}[{start}]"), stride, start, max_value))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            lanes,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Draws the next value from the lane chosen by the round-robin cursor.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SequenceExhausted`] if the chosen lane is
    /// exhausted.
    pub fn next(&self) -> Result<u64> {
        let lane = self.cursor.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        self.lanes[lane].next()
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}
