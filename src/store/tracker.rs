//! Change tracker: monotonic `updated_at` stamping for local mutations.
//!
//! Last-writer-wins merging across devices only works if a device never
//! re-issues a timestamp it has already handed out. The tracker therefore
//! advances strictly: each stamp is `max(now, last + 1ms)`, and the
//! high-water mark is persisted by the store so a restart cannot rewind it.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug)]
pub struct ChangeTracker {
    last: DateTime<Utc>,
}

impl ChangeTracker {
    /// Restore a tracker from a persisted high-water mark (or start fresh).
    pub fn new(high_water: Option<DateTime<Utc>>) -> Self {
        Self {
            last: high_water.unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Issue the next update timestamp, strictly after every previous one.
    pub fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = if now > self.last {
            now
        } else {
            self.last + Duration::milliseconds(1)
        };
        self.last = stamp;
        stamp
    }

    /// Current high-water mark, for persistence.
    pub fn high_water(&self) -> DateTime<Utc> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_advance_strictly_even_with_a_frozen_clock() {
        let mut tracker = ChangeTracker::new(None);
        let now = Utc::now();
        let first = tracker.next_timestamp(now);
        let second = tracker.next_timestamp(now);
        let third = tracker.next_timestamp(now);
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn restored_tracker_never_reissues_a_stamp() {
        let mut tracker = ChangeTracker::new(None);
        let now = Utc::now();
        let issued = tracker.next_timestamp(now + Duration::hours(1));

        // Restart with the persisted mark but a wall clock that lags it.
        let mut restored = ChangeTracker::new(Some(tracker.high_water()));
        let next = restored.next_timestamp(now);
        assert!(next > issued);
    }
}
