//! A session's lifecycle: providers, a buffer manager, a sink, and
//! (for stream-backed sessions) a background draining thread (§4.9).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use eventpipe_wire::{GuardLevel, SerializationFormat, SessionType};
use log::{error, info};

use crate::block::{EventBlockWriter, EventRecord, SequencePointBlockWriter, StackBlockWriter, TraceHeader};
use crate::buffer_manager::{BufferManager, WaitEvent};
use crate::clock;
use crate::configuration::{Configuration, SessionProvider};
use crate::event_instance::EventInstance;
use crate::ids::ActivityId;
use crate::metrics::EngineMetrics;
use crate::serializer::FastSerializer;
use crate::sink::EventSink;
use crate::thread_registry::ThreadSessionState;

pub const DEFAULT_SEQUENCE_POINT_BUDGET: usize = 10 * 1024 * 1024;
const STREAMING_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type SyncCallback = Box<dyn Fn(&EventInstance) + Send + Sync>;

pub struct Session {
    pub index: u8,
    pub kind: SessionType,
    pub format: SerializationFormat,
    pub mask: u64,
    pub rundown_keyword: u64,
    rundown_enabled: AtomicBool,
    streaming_enabled: AtomicBool,
    paused: AtomicBool,
    pub start_wall_time: chrono::DateTime<Utc>,
    pub start_timestamp: i64,
    pub buffer_manager: Arc<BufferManager>,
    providers: Mutex<Vec<SessionProvider>>,
    configuration: Arc<Configuration>,
    sink: Option<Arc<dyn EventSink>>,
    serializer: Mutex<Option<FastSerializer>>,
    sync_callback: Option<SyncCallback>,
    streaming_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: WaitEvent,
    file_has_errors: AtomicBool,
    metadata_ids: Mutex<HashMap<(Arc<str>, u32, u32), u32>>,
    stack_ids: Mutex<HashMap<Vec<u64>, u32>>,
    num_events_written: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

pub struct SessionArgs {
    pub kind: SessionType,
    pub format: SerializationFormat,
    pub circular_buffer_mb: usize,
    pub rundown_keyword: u64,
    pub providers: Vec<SessionProvider>,
    pub sink: Option<Arc<dyn EventSink>>,
    pub sync_callback: Option<SyncCallback>,
}

impl Session {
    pub fn new(index: u8, args: SessionArgs, configuration: Arc<Configuration>, metrics: Arc<EngineMetrics>) -> Arc<Session> {
        let buffer_manager = if args.kind == SessionType::Synchronous {
            BufferManager::new(crate::buffer_manager::MIN_BUDGET, 0, GuardLevel::None)
        } else {
            let sp_budget = if args.format == SerializationFormat::NetTraceV4 {
                DEFAULT_SEQUENCE_POINT_BUDGET
            } else {
                0
            };
            BufferManager::new(args.circular_buffer_mb << 20, sp_budget, GuardLevel::Header)
        };

        let serializer = args.sink.as_ref().map(|sink| FastSerializer::new(sink.clone()));
        let serializer = match serializer {
            Some(Ok(s)) => Some(s),
            Some(Err(e)) => {
                error!("failed to initialize session {index} serializer: {e}");
                None
            }
            None => None,
        };

        Arc::new(Session {
            index,
            kind: args.kind,
            format: args.format,
            mask: 1u64 << index,
            rundown_keyword: args.rundown_keyword,
            rundown_enabled: AtomicBool::new(false),
            streaming_enabled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            start_wall_time: Utc::now(),
            start_timestamp: clock::now(),
            buffer_manager,
            providers: Mutex::new(args.providers),
            configuration,
            sink: args.sink,
            serializer: Mutex::new(serializer),
            sync_callback: args.sync_callback,
            streaming_thread: Mutex::new(None),
            shutdown: WaitEvent::new(),
            file_has_errors: AtomicBool::new(false),
            metadata_ids: Mutex::new(HashMap::new()),
            stack_ids: Mutex::new(HashMap::new()),
            num_events_written: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn providers(&self) -> Vec<SessionProvider> {
        self.providers.lock().unwrap().clone()
    }

    pub fn has_errors(&self) -> bool {
        self.file_has_errors.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn rundown_enabled(&self) -> bool {
        self.rundown_enabled.load(Ordering::Acquire)
    }

    pub fn num_events_written(&self) -> u64 {
        self.num_events_written.load(Ordering::Relaxed)
    }

    /// Routes one producer-supplied event to this session: directly to a
    /// synchronous callback, or into the buffer manager for a
    /// buffer-backed session. `state` is `None` only for `Synchronous`
    /// sessions, which never touch a buffer.
    pub fn write_event(&self, state: Option<&Arc<ThreadSessionState>>, instance: &EventInstance) -> bool {
        if self.is_paused() {
            return false;
        }
        match self.kind {
            SessionType::Synchronous => {
                if let Some(cb) = &self.sync_callback {
                    cb(instance);
                }
                true
            }
            _ => {
                let Some(state) = state else { return false };
                self.buffer_manager.write_event(
                    state,
                    &instance.event,
                    instance.activity_id,
                    instance.related_activity_id,
                    instance.thread_id,
                    instance.timestamp,
                    instance.proc_num,
                    &instance.payload,
                    &instance.stack,
                )
            }
        }
    }

    /// Writes the file header and `Trace` object, then (for IpcStream /
    /// FileStream sessions) spawns the streaming thread.
    pub fn start_streaming(self: &Arc<Self>) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.write_all(eventpipe_wire::NETTRACE_MAGIC) {
                error!("session {} failed to write trace header: {e}", self.index);
                self.file_has_errors.store(true, Ordering::Release);
                return;
            }
            let mut guard = self.serializer.lock().unwrap();
            if let Some(serializer) = guard.as_mut() {
                let header = TraceHeader {
                    system_time: self.start_wall_time,
                    file_open_timestamp: self.start_timestamp,
                    timestamp_frequency: clock::TIMESTAMP_FREQUENCY as i64,
                    pointer_size: std::mem::size_of::<usize>() as u32,
                    current_process_id: std::process::id(),
                    number_of_processors: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32,
                    sampling_rate_in_ns: 1_000_000,
                };
                if serializer.write_object(1, 0, &header).is_err() {
                    self.file_has_errors.store(true, Ordering::Release);
                }
            }
        }

        if matches!(self.kind, SessionType::IpcStream | SessionType::FileStream) {
            self.streaming_enabled.store(true, Ordering::Release);
            let session = self.clone();
            let handle = std::thread::spawn(move || session.streaming_loop());
            *self.streaming_thread.lock().unwrap() = Some(handle);
        }
    }

    fn streaming_loop(self: Arc<Self>) {
        while self.streaming_enabled.load(Ordering::Acquire) {
            let written = self.drain_quantum(clock::now());
            if self.has_errors() {
                info!("session {} disabling after a sink error", self.index);
                self.streaming_enabled.store(false, Ordering::Release);
                break;
            }
            if written == 0 {
                self.buffer_manager.wait.wait_timeout(STREAMING_POLL_INTERVAL);
            } else {
                std::thread::sleep(STREAMING_POLL_INTERVAL);
            }
        }
        self.shutdown.notify();
    }

    /// Drains and serializes every event currently available up to
    /// `stop_timestamp`, bounded further by the next queued sequence
    /// point for V4 sessions (§4.6.5). Returns the number of events
    /// written.
    fn drain_quantum(&self, stop_timestamp: i64) -> usize {
        let Some(_sink) = self.sink.as_ref() else { return 0 };

        let boundary = match (self.format, self.buffer_manager.next_queued_sequence_point_timestamp()) {
            (SerializationFormat::NetTraceV4, Some(sp_ts)) => stop_timestamp.min(sp_ts),
            _ => stop_timestamp,
        };

        let mut metadata_block = EventBlockWriter::new_metadata_block(self.format);
        let mut event_block = EventBlockWriter::new_event_block(self.format);
        let mut stack_block = StackBlockWriter::new();
        let mut metadata_ids = self.metadata_ids.lock().unwrap();
        let mut stack_ids = self.stack_ids.lock().unwrap();
        let mut seen_threads: HashSet<u64> = HashSet::new();
        let mut count = 0usize;

        while let Some(view) = self.buffer_manager.get_next_event_before(boundary) {
            count += 1;

            let key = (view.event.provider_name.clone(), view.event.event_id, view.event.version);
            let metadata_id = match metadata_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let id = self.configuration.next_metadata_id();
                    let carrier = EventInstance::new(
                        view.event.clone(),
                        ActivityId::NIL,
                        ActivityId::NIL,
                        view.thread_id,
                        view.timestamp,
                        view.proc_num,
                        Vec::new(),
                        Vec::new(),
                    );
                    let metadata_instance = self.configuration.build_event_metadata_event(&carrier, id);
                    metadata_block.write_event(&EventRecord {
                        metadata_id: 0,
                        sequence_number: 0,
                        thread_id: metadata_instance.thread_id,
                        capture_thread_id: metadata_instance.thread_id,
                        proc_num: metadata_instance.proc_num,
                        stack_id: 0,
                        is_sorted: true,
                        timestamp: metadata_instance.timestamp,
                        activity_id: metadata_instance.activity_id.0,
                        related_activity_id: metadata_instance.related_activity_id.0,
                        payload: &metadata_instance.payload,
                        stack: &[],
                    });
                    metadata_ids.insert(key, id);
                    id
                }
            };

            let stack_id = if view.stack.is_empty() {
                0
            } else {
                let next_id = stack_ids.len() as u32 + 1;
                *stack_ids.entry(view.stack.clone()).or_insert_with(|| {
                    stack_block.write_stack(next_id, &view.stack);
                    next_id
                })
            };

            let is_sorted = seen_threads.insert(view.thread_id);

            event_block.write_event(&EventRecord {
                metadata_id,
                sequence_number: 0,
                thread_id: view.thread_id,
                capture_thread_id: view.thread_id,
                proc_num: view.proc_num,
                stack_id,
                is_sorted,
                timestamp: view.timestamp,
                activity_id: view.activity_id.0,
                related_activity_id: view.related_activity_id.0,
                payload: &view.payload,
                stack: &view.stack,
            });
        }

        drop(metadata_ids);
        drop(stack_ids);

        if count > 0 {
            self.num_events_written.fetch_add(count as u64, Ordering::Relaxed);
            self.metrics.add_events_written(count as u64);
            self.flush_blocks(metadata_block, stack_block, event_block);
        }

        if self.format == SerializationFormat::NetTraceV4 && boundary < stop_timestamp {
            if let Some(sp) = self.buffer_manager.pop_sequence_point() {
                self.flush_sequence_point(sp);
            }
            self.stack_ids.lock().unwrap().clear();
        }

        count
    }

    fn flush_blocks(&self, metadata: EventBlockWriter, stack: StackBlockWriter, events: EventBlockWriter) {
        let mut guard = self.serializer.lock().unwrap();
        let Some(serializer) = guard.as_mut() else { return };
        let mut failed = false;
        if !metadata.is_empty() && serializer.write_object(2, 0, &metadata).is_err() {
            failed = true;
        }
        if !stack.is_empty() && serializer.write_object(2, 0, &stack).is_err() {
            failed = true;
        }
        if !events.is_empty() && serializer.write_object(2, 0, &events).is_err() {
            failed = true;
        }
        if serializer.flush().is_err() {
            failed = true;
        }
        if failed || serializer.write_error {
            self.file_has_errors.store(true, Ordering::Release);
            self.metrics.inc_sink_errors();
        }
    }

    fn flush_sequence_point(&self, point: crate::buffer_manager::SequencePoint) {
        let entries: Vec<(u64, u32)> = point
            .thread_sequence_numbers
            .into_iter()
            .map(|(tid, seq)| (tid, seq as u32))
            .collect();
        let block = SequencePointBlockWriter::new(point.timestamp, entries);
        let mut guard = self.serializer.lock().unwrap();
        if let Some(serializer) = guard.as_mut() {
            if serializer.write_object(1, 0, &block).is_err() {
                self.file_has_errors.store(true, Ordering::Release);
                self.metrics.inc_sink_errors();
            }
        }
        self.metrics.inc_sequence_points_emitted();
    }

    /// Synchronous teardown (§4.9, §5 write-in-progress handshake):
    /// stops the streaming thread, drains whatever remains unconditionally,
    /// and clears this session's providers. Idempotent — a second call
    /// finds `streaming_enabled` already false and an empty buffer
    /// manager, so it's a no-op beyond clearing providers again.
    pub fn disable(&self) {
        if self.streaming_enabled.swap(false, Ordering::AcqRel) {
            self.buffer_manager.wait.notify();
            if let Some(handle) = self.streaming_thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }

        let mut stop = clock::now();
        loop {
            let written = self.drain_quantum(stop);
            stop = clock::now();
            if written == 0 && self.buffer_manager.peek_next_timestamp().is_none() {
                break;
            }
        }

        if let Some(sp) = self.buffer_manager.pop_sequence_point() {
            self.flush_sequence_point(sp);
        }

        if let Some(sink) = &self.sink {
            let mut guard = self.serializer.lock().unwrap();
            if let Some(serializer) = guard.as_mut() {
                let _ = serializer.write_end();
                let _ = serializer.flush();
            }
            let _ = sink.flush();
        }

        self.providers.lock().unwrap().clear();
    }

    /// Adds a synthetic rundown-provider subscription carrying this
    /// session's rundown keyword at Verbose level (§4.9).
    pub fn enable_rundown(&self) {
        self.providers
            .lock()
            .unwrap()
            .push(SessionProvider::new("EventPipeRundown", self.rundown_keyword, eventpipe_wire::Level::Verbose));
        self.rundown_enabled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use crate::sink::MemorySink;
    use eventpipe_wire::Level;

    fn make_event() -> Arc<crate::provider::Event> {
        let provider = Provider::new("P", None);
        let event = provider.add_event(42, 0x1, 1, Level::Informational, false, None);
        event.set_session_bit(0, true);
        event
    }

    #[test]
    fn synchronous_session_calls_callback_exactly_once() {
        let calls: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let args = SessionArgs {
            kind: SessionType::Synchronous,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb: 1,
            rundown_keyword: 0,
            providers: vec![SessionProvider::new("P", 0x1, Level::Verbose)],
            sink: None,
            sync_callback: Some(Box::new(move |instance| {
                calls2.lock().unwrap().push((instance.event.event_id, instance.payload.clone()));
            })),
        };
        let session = Session::new(0, args, Configuration::new(), Arc::new(EngineMetrics::new()));
        let event = make_event();
        let instance = EventInstance::new(
            event,
            ActivityId::from([1; 16]),
            ActivityId::NIL,
            1,
            clock::now(),
            0,
            vec![0xDE, 0xAD, 0xBE, 0xEF],
            Vec::new(),
        );
        assert!(session.write_event(None, &instance));
        let recorded = calls.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], (42, vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn disable_is_idempotent() {
        let args = SessionArgs {
            kind: SessionType::FileStream,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb: 1,
            rundown_keyword: 0,
            providers: vec![],
            sink: Some(Arc::new(MemorySink::new())),
            sync_callback: None,
        };
        let session = Session::new(0, args, Configuration::new(), Arc::new(EngineMetrics::new()));
        session.start_streaming();
        session.disable();
        session.disable();
        assert!(!session.has_errors());
    }

    #[test]
    fn metadata_is_deduplicated_across_repeated_events() {
        let sink = Arc::new(MemorySink::new());
        let args = SessionArgs {
            kind: SessionType::File,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb: 4,
            rundown_keyword: 0,
            providers: vec![],
            sink: Some(sink.clone()),
            sync_callback: None,
        };
        let session = Session::new(0, args, Configuration::new(), Arc::new(EngineMetrics::new()));
        session.start_streaming();
        let event = make_event();
        let thread = crate::thread_registry::Thread::new(1);
        let state = thread.get_or_create_session_state(&session);
        for i in 0..10 {
            let instance = EventInstance::new(event.clone(), ActivityId::NIL, ActivityId::NIL, 1, 100 + i, 0, vec![1, 2], Vec::new());
            session.write_event(Some(&state), &instance);
        }
        session.disable();
        assert_eq!(session.metadata_ids.lock().unwrap().len(), 1);
        assert_eq!(session.num_events_written(), 10);
    }

    #[test]
    fn budget_exhaustion_drains_exactly_the_accepted_events() {
        let sink = Arc::new(MemorySink::new());
        let args = SessionArgs {
            kind: SessionType::FileStream,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb: 1,
            rundown_keyword: 0,
            providers: vec![],
            sink: Some(sink),
            sync_callback: None,
        };
        let session = Session::new(0, args, Configuration::new(), Arc::new(EngineMetrics::new()));
        let event = make_event();
        let thread = crate::thread_registry::Thread::new(1);
        let state = thread.get_or_create_session_state(&session);

        let payload = vec![0u8; 100];
        let mut accepted = 0u64;
        for i in 0..20_000i64 {
            let instance = EventInstance::new(event.clone(), ActivityId::NIL, ActivityId::NIL, 1, i, 0, payload.clone(), Vec::new());
            if session.write_event(Some(&state), &instance) {
                accepted += 1;
            }
        }
        assert!(accepted < 20_000, "a 1 MiB budget should not absorb 20000 * 100-byte events");

        assert!(session.buffer_manager.size_of_all_buffers() <= crate::buffer_manager::clamp_budget(1 << 20));
        session.disable();
        assert_eq!(session.num_events_written(), accepted);
    }

    #[test]
    fn two_threads_are_split_across_a_sequence_point_boundary() {
        let sink = Arc::new(MemorySink::new());
        let args = SessionArgs {
            kind: SessionType::FileStream,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb: 8,
            rundown_keyword: 0,
            providers: vec![],
            sink: Some(sink),
            sync_callback: None,
        };
        let session = Session::new(0, args, Configuration::new(), Arc::new(EngineMetrics::new()));
        let event = make_event();
        let thread_a = crate::thread_registry::Thread::new(1);
        let thread_b = crate::thread_registry::Thread::new(2);
        let state_a = thread_a.get_or_create_session_state(&session);
        let state_b = thread_b.get_or_create_session_state(&session);

        let write = |state: &Arc<ThreadSessionState>, tid: u64, ts: i64| {
            let instance = EventInstance::new(event.clone(), ActivityId::NIL, ActivityId::NIL, tid, ts, 0, vec![1], Vec::new());
            session.write_event(Some(state), &instance);
        };

        for ts in [1, 4, 9, 10, 11, 12] {
            write(&state_a, 1, ts);
        }
        write(&state_b, 2, 2);
        write(&state_b, 2, 6);

        let point = session.buffer_manager.capture_sequence_point();
        session.buffer_manager.retain_sequence_point(point);

        for ts in [13, 15] {
            write(&state_a, 1, ts);
        }
        write(&state_b, 2, 14);
        write(&state_b, 2, 20);

        let first_batch = session.drain_quantum(12);
        assert_eq!(first_batch, 8, "both threads' events up to the sequence point should drain together");
        assert!(session.buffer_manager.pop_sequence_point().is_some());

        let second_batch = session.drain_quantum(clock::now());
        assert_eq!(second_batch, 4);
        assert_eq!(session.num_events_written(), 12);
        session.disable();
    }
}
