//! Progress Monitor scaling (C8): maps a remote process's `percentCompleted ∈ [0,100]` into a
//! task's configured `progress_range`, and aggregates a parallel group's per-replica progress
//! into one group-level figure.

use std::sync::{Arc, Mutex};

/// Linear scale from `[0,100]` to `[start, end]`.
#[derive(Debug, Clone, Copy)]
pub struct RangeProgress {
    pub start: u8,
    pub end: u8,
}

impl RangeProgress {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Scales and rounds `percent_completed` (clamped to `[0,100]`) into this range.
    pub fn scale(&self, percent_completed: u8) -> u8 {
        let percent_completed = f64::from(percent_completed.min(100));
        let span = f64::from(self.end.saturating_sub(self.start));
        let scaled = f64::from(self.start) + span * percent_completed / 100.0;
        scaled.round() as u8
    }
}

/// Shared progress list for a parallel group, keyed by `map_index`. Every replica writes only to
/// its own slot; the group's reported progress is the arithmetic mean of every slot, with missing
/// slots defaulting to `range.start`. Lives behind a mutex rather than real shared memory, since
/// the replicas here are tokio tasks rather than OS processes, but plays the same role the source
/// system's cross-process manager list does.
#[derive(Clone)]
pub struct RangeGroupProgress {
    range: RangeProgress,
    slots: Arc<Mutex<Vec<u8>>>,
}

impl RangeGroupProgress {
    pub fn new(range: RangeProgress) -> Self {
        Self { range, slots: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Records a raw (unscaled) `percentCompleted` value for the replica handling `index`,
    /// resizing the slot list if this is the highest index seen so far.
    pub fn record(&self, index: usize, percent_completed: u8) {
        let scaled = self.range.scale(percent_completed);
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slots.len() <= index {
            slots.resize(index + 1, self.range.start);
        }
        slots[index] = scaled;
    }

    /// Arithmetic mean of every recorded (already range-scaled) slot.
    pub fn mean(&self) -> u8 {
        let slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slots.is_empty() {
            return self.range.start;
        }
        let total: u32 = slots.iter().map(|value| u32::from(*value)).sum();
        (f64::from(total) / slots.len() as f64).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_linearly_into_range() {
        let range = RangeProgress::new(50, 100);
        assert_eq!(range.scale(0), 50);
        assert_eq!(range.scale(100), 100);
        assert_eq!(range.scale(50), 75);
    }

    #[test]
    fn group_progress_defaults_missing_slots_to_start() {
        let group = RangeGroupProgress::new(RangeProgress::new(0, 100));
        group.record(2, 100);
        assert_eq!(group.mean(), 33);
    }

    #[test]
    fn group_progress_averages_recorded_slots() {
        let group = RangeGroupProgress::new(RangeProgress::new(0, 100));
        group.record(0, 100);
        group.record(1, 0);
        assert_eq!(group.mean(), 50);
    }
}
