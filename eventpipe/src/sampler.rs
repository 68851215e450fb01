//! The sample-profiler thread (§2, §5 "a dedicated sample-profiler thread
//! exists when any session subscribes to the sampler"). Target-thread
//! enumeration and stack walking are explicit external collaborators
//! (§1 Non-goals); this module only owns the sampling loop and the
//! contract (`ThreadEnumerator`) an embedder plugs a real one into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock;
use crate::ids::ActivityId;
use crate::provider::Event;

pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(1);

/// One target thread's state at the moment it was sampled.
pub struct ThreadSample {
    pub os_tid: u64,
    pub stack: Vec<u64>,
}

/// External collaborator supplying the set of threads to sample and
/// their current call stacks. The real implementation (walking every
/// OS thread in the process) lives outside this crate; the default here
/// only samples the calling thread with a synthetic one-frame stack, so
/// the profiler loop and its shutdown handshake can be exercised without
/// a platform-specific stack walker.
pub trait ThreadEnumerator: Send + Sync {
    fn sample(&self) -> Vec<ThreadSample>;
}

pub struct SingleThreadEnumerator;

impl ThreadEnumerator for SingleThreadEnumerator {
    fn sample(&self) -> Vec<ThreadSample> {
        vec![ThreadSample {
            os_tid: clock::current_thread_id(),
            stack: vec![0],
        }]
    }
}

/// What the profiler hands back for each sampled thread; the caller
/// (normally the facade) turns this into a `write_event` call against
/// whichever sessions subscribed to the sampler event.
pub type SampleSink = Arc<dyn Fn(&Arc<Event>, ActivityId, u64, i64, &[u64]) + Send + Sync>;

pub struct SampleProfiler {
    event: Arc<Event>,
    enumerator: Box<dyn ThreadEnumerator>,
    interval: Mutex<Duration>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SampleProfiler {
    pub fn new(event: Arc<Event>, enumerator: Box<dyn ThreadEnumerator>) -> Arc<SampleProfiler> {
        Arc::new(SampleProfiler {
            event,
            enumerator,
            interval: Mutex::new(DEFAULT_SAMPLING_INTERVAL),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock().unwrap() = interval;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the sampling thread if it isn't already running. Idempotent.
    pub fn start(self: &Arc<Self>, emit: SampleSink) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let profiler = self.clone();
        let handle = std::thread::spawn(move || profiler.run(emit));
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn run(self: Arc<Self>, emit: SampleSink) {
        while self.running.load(Ordering::Acquire) {
            if self.event.enabled_mask() != 0 {
                let timestamp = clock::now();
                for sample in self.enumerator.sample() {
                    (*emit)(&self.event, ActivityId::NIL, sample.os_tid, timestamp, &sample.stack);
                }
            }
            std::thread::sleep(*self.interval.lock().unwrap());
        }
    }

    /// Stops the sampling thread and joins it. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use eventpipe_wire::Level;
    use std::sync::Mutex as StdMutex;

    fn make_event() -> Arc<Event> {
        let provider = Provider::new("EventPipeSampleProfiler", None);
        provider.add_event(1, 0x1, 1, Level::Informational, true, None)
    }

    #[test]
    fn single_thread_enumerator_samples_the_calling_thread() {
        let enumerator = SingleThreadEnumerator;
        let samples = enumerator.sample();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].os_tid, clock::current_thread_id());
    }

    #[test]
    fn disabled_event_produces_no_samples() {
        let event = make_event();
        let profiler = SampleProfiler::new(event.clone(), Box::new(SingleThreadEnumerator));
        profiler.set_interval(Duration::from_millis(5));
        let calls: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));
        let calls2 = calls.clone();
        profiler.start(Arc::new(move |_event, _activity, _tid, _ts, _stack| {
            *calls2.lock().unwrap() += 1;
        }));
        std::thread::sleep(Duration::from_millis(20));
        profiler.stop();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn enabled_event_produces_samples() {
        let event = make_event();
        event.set_session_bit(0, true);
        let profiler = SampleProfiler::new(event.clone(), Box::new(SingleThreadEnumerator));
        profiler.set_interval(Duration::from_millis(2));
        let calls: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));
        let calls2 = calls.clone();
        profiler.start(Arc::new(move |_event, _activity, _tid, _ts, _stack| {
            *calls2.lock().unwrap() += 1;
        }));
        std::thread::sleep(Duration::from_millis(30));
        profiler.stop();
        assert!(*calls.lock().unwrap() > 0);
    }

    #[test]
    fn start_is_idempotent() {
        let event = make_event();
        let profiler = SampleProfiler::new(event, Box::new(SingleThreadEnumerator));
        profiler.start(Arc::new(|_, _, _, _, _| {}));
        profiler.start(Arc::new(|_, _, _, _, _| {}));
        assert!(profiler.is_running());
        profiler.stop();
        assert!(!profiler.is_running());
    }
}
