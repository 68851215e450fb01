use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Process-wide counters for the tracing engine itself (not the traced
/// process). All fields are atomic since producers update these from the
/// hot write path alongside whichever session background threads are
/// draining buffers.
pub struct EngineMetrics {
    pub start_time: SystemTime,
    events_written_total: AtomicU64,
    events_dropped_oversized_total: AtomicU64,
    sessions_created_total: AtomicU64,
    sessions_active: AtomicUsize,
    sequence_points_emitted_total: AtomicU64,
    sampler_samples_total: AtomicU64,
    sink_errors_total: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            events_written_total: AtomicU64::new(0),
            events_dropped_oversized_total: AtomicU64::new(0),
            sessions_created_total: AtomicU64::new(0),
            sessions_active: AtomicUsize::new(0),
            sequence_points_emitted_total: AtomicU64::new(0),
            sampler_samples_total: AtomicU64::new(0),
            sink_errors_total: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn add_events_written(&self, count: u64) {
        self.events_written_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn events_written_total(&self) -> u64 {
        self.events_written_total.load(Ordering::Relaxed)
    }

    pub fn inc_events_dropped_oversized(&self) {
        self.events_dropped_oversized_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_dropped_oversized_total(&self) -> u64 {
        self.events_dropped_oversized_total.load(Ordering::Relaxed)
    }

    pub fn inc_sessions_created(&self) {
        self.sessions_created_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_sessions_active(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sessions_created_total(&self) -> u64 {
        self.sessions_created_total.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> usize {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn inc_sequence_points_emitted(&self) {
        self.sequence_points_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sequence_points_emitted_total(&self) -> u64 {
        self.sequence_points_emitted_total.load(Ordering::Relaxed)
    }

    pub fn add_sampler_samples(&self, count: u64) {
        self.sampler_samples_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sampler_samples_total(&self) -> u64 {
        self.sampler_samples_total.load(Ordering::Relaxed)
    }

    pub fn inc_sink_errors(&self) {
        self.sink_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sink_errors_total(&self) -> u64 {
        self.sink_errors_total.load(Ordering::Relaxed)
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = EngineMetrics::new();
        assert_eq!(m.events_written_total(), 0);
        assert_eq!(m.sessions_active(), 0);
    }

    #[test]
    fn session_lifecycle_tracks_active_count() {
        let m = EngineMetrics::new();
        m.inc_sessions_created();
        m.inc_sessions_created();
        assert_eq!(m.sessions_created_total(), 2);
        assert_eq!(m.sessions_active(), 2);
        m.dec_sessions_active();
        assert_eq!(m.sessions_active(), 1);
        assert_eq!(m.sessions_created_total(), 2);
    }

    #[test]
    fn drops_and_writes_accumulate() {
        let m = EngineMetrics::new();
        m.add_events_written(10);
        m.add_events_written(5);
        m.inc_events_dropped_oversized();
        assert_eq!(m.events_written_total(), 15);
        assert_eq!(m.events_dropped_oversized_total(), 1);
    }
}
