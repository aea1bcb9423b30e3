//! Once-per-day attendance marking.

use crate::store::{RecordOutcome, Store, StoreError};
use chrono::{Local, NaiveDateTime, NaiveTime, Timelike};

/// Local wall-clock source.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// The system's local time, no timezone conversion.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Outcome of [`AttendanceRecorder::mark_if_new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// First detection today; event stored with this time.
    Marked(NaiveTime),
    /// Already marked today.
    Skipped,
}

/// Marks attendance for today. Holds no state of its own.
pub struct AttendanceRecorder<'a> {
    store: &'a Store,
    clock: &'a dyn Clock,
}

impl<'a> AttendanceRecorder<'a> {
    pub fn new(store: &'a Store, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    pub fn mark_if_new(&self, student_id: &str) -> Result<MarkOutcome, StoreError> {
        let now = self.clock.now();
        // Whole seconds, matching the stored text format.
        let time = now.time().with_nanosecond(0).unwrap_or(now.time());
        match self.store.record_attendance_if_absent(student_id, now.date(), time)? {
            RecordOutcome::Recorded => Ok(MarkOutcome::Marked(time)),
            RecordOutcome::AlreadyPresent => {
                tracing::debug!(student_id, "already marked today");
                Ok(MarkOutcome::Skipped)
            }
        }
    }
}
