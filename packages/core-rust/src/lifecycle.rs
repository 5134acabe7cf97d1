//! Start/complete state machine shared by actions and operations.
//!
//! Status lives in an atomic and is only ever moved forward with
//! compare-and-swap or a final store. Timing fields are write-once cells
//! filled by the thread that wins the corresponding transition.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::Violation;
use crate::types::Status;

/// Atomically accessed [`Status`].
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(initial: Status) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub(crate) fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    pub(crate) fn compare_exchange(&self, current: Status, new: Status) -> Result<Status, Status> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(Status::from_u8)
            .map_err(Status::from_u8)
    }
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    status: AtomicStatus,
    /// Set by the first `begin_completion`; rejects a concurrent second one
    /// while the unit is still draining.
    completing: AtomicBool,
    created_at: u64,
    start_time: OnceLock<u64>,
    started_at: OnceLock<Instant>,
    end_time: OnceLock<u64>,
    elapsed: OnceLock<Duration>,
}

impl Lifecycle {
    pub(crate) fn new(created_at: u64) -> Self {
        Self {
            status: AtomicStatus::new(Status::New),
            completing: AtomicBool::new(false),
            created_at,
            start_time: OnceLock::new(),
            started_at: OnceLock::new(),
            end_time: OnceLock::new(),
            elapsed: OnceLock::new(),
        }
    }

    /// `New -> InProgress`. Succeeds exactly once.
    pub(crate) fn start(&self, now: u64) -> Result<(), Violation> {
        match self.status.compare_exchange(Status::New, Status::InProgress) {
            Ok(_) => {
                let _ = self.start_time.set(now);
                let _ = self.started_at.set(Instant::now());
                Ok(())
            }
            Err(Status::InProgress) => Err(Violation::AlreadyStarted),
            Err(_) => Err(Violation::AlreadyCompleted),
        }
    }

    /// Claims the right to complete. The caller must follow up with
    /// [`finish`](Self::finish).
    pub(crate) fn begin_completion(&self) -> Result<(), Violation> {
        match self.status.load() {
            Status::New => Err(Violation::NotStarted),
            Status::Success | Status::Failure => Err(Violation::AlreadyCompleted),
            Status::InProgress => {
                if self.completing.swap(true, Ordering::AcqRel) {
                    Err(Violation::AlreadyCompleted)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Stamps end time and elapsed time, then publishes the terminal status.
    pub(crate) fn finish(&self, succeeded: bool, now: u64) {
        let elapsed = self
            .started_at
            .get()
            .map_or(Duration::ZERO, Instant::elapsed);
        let _ = self.end_time.set(now);
        let _ = self.elapsed.set(elapsed);
        self.status.store(if succeeded {
            Status::Success
        } else {
            Status::Failure
        });
    }

    pub(crate) fn status(&self) -> Status {
        self.status.load()
    }

    pub(crate) fn created_at(&self) -> u64 {
        self.created_at
    }

    pub(crate) fn start_time(&self) -> Option<u64> {
        self.start_time.get().copied()
    }

    pub(crate) fn end_time(&self) -> Option<u64> {
        self.end_time.get().copied()
    }

    pub(crate) fn elapsed(&self) -> Option<Duration> {
        self.elapsed.get().copied()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.status() != Status::New
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }
}
