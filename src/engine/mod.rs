mod command;
mod coordinator;
mod drain;
mod policy;
mod stream;

pub use command::Command;
pub use drain::{DrainReport, OutputHandle};
pub use policy::{SplitPolicy, SplitReason, Timecode, TimecodeError};
pub use stream::{BufferRecord, MediaBuffer, StreamId, StreamKind, StreamSpec};

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::mux::{MuxError, Muxer};
use crate::notify::FragmentListener;
use crate::sink::LocationTemplate;

use coordinator::State;
use stream::QueuedBuffer;

/// No running time seen yet.
pub const RUNNING_TIME_NONE: i64 = i64::MIN;
/// Boundary that releases everything.
pub const RUNNING_TIME_MAX: i64 = i64::MAX;

const NANOS_PER_MS: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Stopped,
    /// Waiting for the next reference keyframe
    CollectingGopStart,
    /// Waiting for every stream to cover the frozen boundary
    WaitingGopCollect,
    /// Reference reached EOS, everything is released
    FinishingUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Stopped,
    AwaitingCommand,
    OutputGop,
    EndingFile,
    StartNextFile,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,
    #[error("unknown stream handle")]
    UnknownStream,
    #[error("stream {0} already reached end of stream")]
    StreamEnded(String),
    #[error("stream {stream} queue overflow: {queued_bytes} bytes queued, hard limit {limit}")]
    QueueOverflow {
        stream: String,
        queued_bytes: u64,
        limit: u64,
    },
    #[error("cannot attach a stream after end of stream")]
    AttachAfterEos,
    #[error("output thread already running")]
    AlreadyStarted,
    #[error("fragment {fragment_id} ({location}) failed: {source}")]
    Drain {
        fragment_id: u32,
        location: String,
        #[source]
        source: MuxError,
    },
    #[error("output failed on fragment {fragment_id} ({location}): {reason}")]
    Fatal {
        fragment_id: u32,
        location: String,
        reason: String,
    },
    #[error("failed to spawn output thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("output thread panicked")]
    OutputPanicked,
}

/// Drain failure recorded for every later caller.
#[derive(Debug, Clone)]
pub(crate) struct Fatal {
    pub fragment_id: u32,
    pub location: String,
    pub reason: String,
}

impl Fatal {
    fn to_error(&self) -> EngineError {
        EngineError::Fatal {
            fragment_id: self.fragment_id,
            location: self.location.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Queued,
    /// Queued, but the buffer lags the released GOP boundary by `skew` ns.
    Desynchronized { skew: i64 },
    /// Dropped because its stream was flushed or the engine reset while the
    /// caller waited.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: SplitPolicy,
    /// Nanoseconds a stream may lag the frozen boundary and still count as
    /// having covered it.
    pub alignment_threshold: i64,
    pub use_robust_muxing: bool,
    pub queue_soft_bytes: u64,
    pub queue_soft_time: u64,
    pub queue_hard_bytes: u64,
    pub location: LocationTemplate,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: SplitPolicy::default(),
            alignment_threshold: 0,
            use_robust_muxing: false,
            queue_soft_bytes: 10 * 1024 * 1024,
            queue_soft_time: 3_000 * NANOS_PER_MS as u64,
            queue_hard_bytes: 256 * 1024 * 1024,
            location: LocationTemplate::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let split = &config.split;
        Ok(Self {
            policy: SplitPolicy {
                threshold_bytes: split.max_size_bytes,
                threshold_time: ms_to_ns(split.max_size_time_ms),
                timecode: split.timecode()?,
                mux_overhead: split.mux_overhead,
            },
            alignment_threshold: ms_to_ns(split.alignment_threshold_ms),
            use_robust_muxing: split.use_robust_muxing,
            queue_soft_bytes: config.queue.soft_max_bytes,
            queue_soft_time: ms_to_ns(config.queue.soft_max_time_ms) as u64,
            queue_hard_bytes: config.queue.hard_max_bytes,
            location: LocationTemplate::new(config.output.location.clone()),
        })
    }
}

fn ms_to_ns(ms: u64) -> i64 {
    i64::try_from(ms)
        .unwrap_or(i64::MAX)
        .saturating_mul(NANOS_PER_MS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub input_state: InputState,
    pub output_state: OutputState,
    pub output_running: bool,
    pub fragment_id: u32,
    pub fragment_total_bytes: u64,
    pub gop_total_bytes: u64,
    pub muxed_out_bytes: u64,
    pub fragment_start_time: i64,
    pub max_in_running_time: i64,
    pub max_out_running_time: i64,
    pub gops_gathered: u64,
    pub commands_issued: u64,
    pub commands_pending: usize,
    pub streams: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub name: String,
    pub kind: StreamKind,
    pub is_reference: bool,
    pub queued_buffers: usize,
    pub queued_bytes: u64,
    pub in_running_time: i64,
    pub out_running_time: i64,
    pub in_eos: bool,
    pub out_eos: bool,
}

type Collaborators = (Box<dyn Muxer>, Arc<dyn FragmentListener>);

pub(crate) struct Shared {
    state: Mutex<State>,
    input_cond: Condvar,
    output_cond: Condvar,
    settings: EngineSettings,
    collaborators: Mutex<Option<Collaborators>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_input<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.input_cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_output<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.output_cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_all(&self) {
        self.input_cond.notify_all();
        self.output_cond.notify_all();
    }
}

/// Fragmenting engine. Cloning yields another handle to the same engine, one
/// per producer thread.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

/// Why a producer stopped waiting.
enum Wake {
    Proceed,
    Discard,
    /// The stream was elected reference while it waited as a secondary.
    Promoted,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        muxer: Box<dyn Muxer>,
        listener: Arc<dyn FragmentListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new()),
                input_cond: Condvar::new(),
                output_cond: Condvar::new(),
                settings,
                collaborators: Mutex::new(Some((muxer, listener))),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    /// Spawns the output thread. Can be called again once a previous output
    /// thread has finished.
    pub fn start(&self) -> Result<OutputHandle, EngineError> {
        let (mut muxer, listener) = self
            .shared
            .collaborators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let max_duration = self.shared.settings.policy.threshold_time;
        let reserved = if !self.shared.settings.use_robust_muxing {
            0
        } else if max_duration <= 0 {
            tracing::debug!("no time threshold, skipping trailer reservation");
            0
        } else {
            match muxer.reserve_trailer(max_duration) {
                Some(bytes) => {
                    tracing::debug!(reserved_bytes = bytes, "robust muxing enabled");
                    bytes
                }
                None => {
                    tracing::warn!("muxer cannot reserve trailer space, robust muxing disabled");
                    0
                }
            }
        };

        let session = {
            let mut state = self.shared.lock();
            state.reserved_bytes = reserved;
            state.output_running = true;
            state.session
        };

        drain::spawn(Arc::clone(&self.shared), muxer, listener, session)
    }

    pub fn attach_stream(&self, spec: StreamSpec) -> Result<StreamId, EngineError> {
        let mut state = self.shared.lock();
        state.check_running()?;
        let name = spec.name.clone();
        let id = state.attach(spec)?;
        tracing::info!(stream = %name, index = id.index(), "stream attached");
        Ok(id)
    }

    pub fn detach_stream(&self, stream: StreamId) -> Result<(), EngineError> {
        let mut state = self.shared.lock();
        let ctx = state.detach(&self.shared.settings, stream)?;
        tracing::info!(
            stream = %ctx.name,
            dropped_buffers = ctx.queued.len(),
            "stream detached"
        );
        drop(state);
        self.shared.wake_all();
        Ok(())
    }

    /// Queues one buffer. Blocks while the GOP it belongs to is not yet
    /// collectable or while the stream is over its soft queue limit.
    pub fn ingest(&self, stream: StreamId, buffer: MediaBuffer) -> Result<IngestStatus, EngineError> {
        let shared = &*self.shared;
        let settings = &shared.settings;
        let mut state = shared.lock();
        state.check_running()?;
        let session = state.session;

        let size = buffer.payload.len() as u64;
        let (is_reference, kind, epoch, name) = {
            let ctx = state.stream(stream).ok_or(EngineError::UnknownStream)?;
            if ctx.in_eos {
                return Err(EngineError::StreamEnded(ctx.name.clone()));
            }
            if ctx.queued_bytes + size > settings.queue_hard_bytes {
                return Err(EngineError::QueueOverflow {
                    stream: ctx.name.clone(),
                    queued_bytes: ctx.queued_bytes,
                    limit: settings.queue_hard_bytes,
                });
            }
            (ctx.is_reference, ctx.kind, ctx.flush_epoch, ctx.name.clone())
        };

        if state.input_state == InputState::Stopped {
            tracing::debug!(stream = %name, "first buffer, collecting GOP start");
            state.input_state = InputState::CollectingGopStart;
        }

        let running_time = buffer.running_time;
        let mut status = IngestStatus::Queued;
        if !is_reference
            && state.released_until != RUNNING_TIME_NONE
            && state.input_state != InputState::FinishingUp
            && running_time.saturating_add(settings.alignment_threshold) < state.released_until
        {
            let skew = state.released_until.saturating_sub(running_time);
            tracing::warn!(
                stream = %name,
                running_time,
                released_until = state.released_until,
                skew_ms = skew / NANOS_PER_MS,
                "stream desynchronized from reference"
            );
            status = IngestStatus::Desynchronized { skew };
        }

        let cursor = {
            let ctx = state.stream_mut(stream).ok_or(EngineError::UnknownStream)?;
            ctx.flushing = false;
            if running_time > ctx.in_running_time {
                ctx.in_running_time = running_time;
            }
            ctx.in_running_time
        };
        let mut is_reference = is_reference;
        let mut is_keyframe = buffer.is_keyframe || (is_reference && !kind.is_video());

        let (mut state, mut wake) = if is_reference {
            self.sync_reference(state, stream, cursor, is_keyframe, session, epoch)?
        } else {
            self.sync_secondary(state, stream, cursor, session, epoch)?
        };
        if let Wake::Promoted = wake {
            tracing::debug!(stream = %name, "stream became reference while waiting");
            is_reference = true;
            is_keyframe = buffer.is_keyframe || !kind.is_video();
            (state, wake) = self.sync_reference(state, stream, cursor, is_keyframe, session, epoch)?;
        }
        if let Wake::Discard = wake {
            return Ok(IngestStatus::Discarded);
        }

        let finishing = state.input_state == InputState::FinishingUp;
        {
            let ctx = state.stream_mut(stream).ok_or(EngineError::UnknownStream)?;
            if is_reference && is_keyframe {
                ctx.prev_in_keyframe = Some(buffer.payload.clone());
            }
            let caps = ctx.pending_caps.take();
            ctx.push(QueuedBuffer {
                record: BufferRecord {
                    is_keyframe,
                    running_time,
                    byte_size: size,
                    duration: buffer.duration,
                },
                payload: buffer.payload,
                caps,
            });
        }
        if finishing {
            state.fragment_total_bytes += size;
        } else {
            state.gop_total_bytes += size;
        }
        tracing::trace!(
            stream = %name,
            running_time,
            size,
            keyframe = is_keyframe,
            "queued buffer"
        );

        if finishing {
            shared.output_cond.notify_one();
        }

        if let Wake::Discard = self.wait_backpressure(state, stream, session, epoch)? {
            return Ok(IngestStatus::Discarded);
        }
        Ok(status)
    }

    /// Reference-stream side of GOP tracking: a keyframe past the current GOP
    /// freezes the boundary and waits until every stream has covered it.
    fn sync_reference<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        stream: StreamId,
        cursor: i64,
        is_keyframe: bool,
        session: u64,
        epoch: u64,
    ) -> Result<(MutexGuard<'a, State>, Wake), EngineError> {
        let shared = &*self.shared;
        if !is_keyframe {
            return Ok((state, Wake::Proceed));
        }

        loop {
            let input_state = state.input_state;
            match input_state {
                InputState::FinishingUp => return Ok((state, Wake::Proceed)),
                InputState::WaitingGopCollect => {
                    // a boundary frozen by an earlier keyframe is still pending
                    state = shared.wait_input(state);
                }
                InputState::Stopped | InputState::CollectingGopStart => {
                    if !state.reference_keyframe(&shared.settings, cursor) {
                        return Ok((state, Wake::Proceed));
                    }
                    shared.wake_all();
                    while state.input_state == InputState::WaitingGopCollect
                        && state.max_in_running_time == cursor
                    {
                        state = shared.wait_input(state);
                        if let Some(wake) = revalidate(&state, stream, session, epoch)? {
                            return Ok((state, wake));
                        }
                    }
                    return Ok((state, Wake::Proceed));
                }
            }
            if let Some(wake) = revalidate(&state, stream, session, epoch)? {
                return Ok((state, wake));
            }
        }
    }

    /// Non-reference streams only queue data below the frozen boundary; data
    /// at or past it waits for the reference to move on.
    fn sync_secondary<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        stream: StreamId,
        cursor: i64,
        session: u64,
        epoch: u64,
    ) -> Result<(MutexGuard<'a, State>, Wake), EngineError> {
        let shared = &*self.shared;
        if state.check_completed_gop(&shared.settings) {
            shared.wake_all();
        }
        while !state.admits_secondary(cursor) {
            state = shared.wait_input(state);
            if let Some(wake) = revalidate(&state, stream, session, epoch)? {
                return Ok((state, wake));
            }
            // only the reference can move the boundary this stream waits on
            if state.reference == Some(stream) {
                return Ok((state, Wake::Promoted));
            }
        }
        Ok((state, Wake::Proceed))
    }

    fn wait_backpressure<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        stream: StreamId,
        session: u64,
        epoch: u64,
    ) -> Result<Wake, EngineError> {
        let shared = &*self.shared;
        let settings = &shared.settings;
        loop {
            let released_until = state.released_until;
            let blocked = match state.stream(stream) {
                Some(ctx) => {
                    let over = ctx.queued_bytes > settings.queue_soft_bytes
                        || ctx.queued_time() > settings.queue_soft_time;
                    // only data the output side may drain is worth waiting for
                    let drainable = ctx.front_time().is_some_and(|t| t < released_until);
                    over && drainable
                }
                None => return Ok(Wake::Discard),
            };
            if !blocked {
                return Ok(Wake::Proceed);
            }
            tracing::trace!(stream = stream.index(), "backpressure, waiting for drain");
            state = shared.wait_input(state);
            if let Some(wake) = revalidate(&state, stream, session, epoch)? {
                return Ok(wake);
            }
        }
    }

    /// Discards the stream's queued data and cursors (seek, format reset).
    pub fn flush(&self, stream: StreamId) -> Result<(), EngineError> {
        let settings = &self.shared.settings;
        let mut state = self.shared.lock();
        let (dropped, buffers, is_reference, name) = {
            let ctx = state.stream_mut(stream).ok_or(EngineError::UnknownStream)?;
            let buffers = ctx.queued.len();
            let dropped = ctx.flush();
            (dropped, buffers, ctx.is_reference, ctx.name.clone())
        };
        state.gop_total_bytes = state.gop_total_bytes.saturating_sub(dropped);
        if is_reference {
            state.abandon_gop();
        } else {
            state.check_completed_gop(settings);
        }
        tracing::debug!(stream = %name, dropped_buffers = buffers, "stream flushed");
        drop(state);
        self.shared.wake_all();
        Ok(())
    }

    pub fn mark_eos(&self, stream: StreamId) -> Result<(), EngineError> {
        let settings = &self.shared.settings;
        let mut state = self.shared.lock();
        let (is_reference, name) = {
            let ctx = state.stream_mut(stream).ok_or(EngineError::UnknownStream)?;
            ctx.in_eos = true;
            if ctx.queued.is_empty() {
                ctx.out_eos = true;
            }
            (ctx.is_reference, ctx.name.clone())
        };
        tracing::debug!(stream = %name, reference = is_reference, "end of stream");

        if is_reference || state.contexts().all(|ctx| ctx.in_eos) {
            state.enter_finishing();
        } else {
            state.check_completed_gop(settings);
        }
        drop(state);
        self.shared.wake_all();
        Ok(())
    }

    /// Tags the stream so the muxer renegotiates before its next buffer.
    pub fn change_format(&self, stream: StreamId, caps: impl Into<String>) -> Result<(), EngineError> {
        let mut state = self.shared.lock();
        let ctx = state.stream_mut(stream).ok_or(EngineError::UnknownStream)?;
        let caps = caps.into();
        tracing::debug!(stream = %ctx.name, caps = %caps, "format changed");
        ctx.pending_caps = Some(caps);
        Ok(())
    }

    /// Forces a split at the next gathered GOP regardless of thresholds.
    pub fn split_now(&self) {
        let mut state = self.shared.lock();
        state.split_requested = true;
        tracing::debug!("split requested");
    }

    /// Drops every queue, command and counter; attached streams stay.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.reset();
        tracing::debug!(session = state.session, "engine reset");
        drop(state);
        self.shared.wake_all();
    }

    /// Stops the engine: waiting producers return `Stopped` and the output
    /// thread closes the open fragment and exits.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.stopping = true;
        drop(state);
        self.shared.wake_all();
    }

    /// Payload of the latest keyframe seen on `stream`.
    pub fn last_keyframe(&self, stream: StreamId) -> Option<Bytes> {
        self.shared.lock().stream(stream)?.prev_in_keyframe.clone()
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.shared.lock();
        EngineStats {
            input_state: state.input_state,
            output_state: state.output_state,
            output_running: state.output_running,
            fragment_id: state.fragment_id,
            fragment_total_bytes: state.fragment_total_bytes,
            gop_total_bytes: state.gop_total_bytes,
            muxed_out_bytes: state.muxed_out_bytes,
            fragment_start_time: state.fragment_start_time,
            max_in_running_time: state.max_in_running_time,
            max_out_running_time: state.max_out_running_time,
            gops_gathered: state.gops_gathered,
            commands_issued: state.commands.pushed(),
            commands_pending: state.commands.len(),
            streams: state.contexts().count(),
        }
    }

    pub fn stream_stats(&self, stream: StreamId) -> Option<StreamStats> {
        let state = self.shared.lock();
        let ctx = state.stream(stream)?;
        Some(StreamStats {
            name: ctx.name.clone(),
            kind: ctx.kind,
            is_reference: ctx.is_reference,
            queued_buffers: ctx.queued.len(),
            queued_bytes: ctx.queued_bytes,
            in_running_time: ctx.in_running_time,
            out_running_time: ctx.out_running_time,
            in_eos: ctx.in_eos,
            out_eos: ctx.out_eos,
        })
    }

    #[cfg(test)]
    fn pending_commands(&self) -> Vec<Command> {
        self.shared.lock().commands.snapshot()
    }
}

/// Re-checks what a waiting producer read before it released the lock.
fn revalidate(
    state: &State,
    stream: StreamId,
    session: u64,
    epoch: u64,
) -> Result<Option<Wake>, EngineError> {
    state.check_running()?;
    if state.session != session {
        return Ok(Some(Wake::Discard));
    }
    match state.stream(stream) {
        Some(ctx) if ctx.flush_epoch == epoch => Ok(None),
        _ => Ok(Some(Wake::Discard)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{FragmentClosed, FragmentOpened};
    use std::thread;
    use std::time::{Duration, Instant};

    const MS: i64 = 1_000_000;
    const SEC: i64 = 1_000 * MS;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum MuxEvent {
        Open(String),
        Write { stream: usize, running_time: i64, bytes: usize },
        Renegotiate { stream: usize, caps: String },
        Finalize,
    }

    #[derive(Clone, Default)]
    struct RecordingMuxer {
        events: Arc<Mutex<Vec<MuxEvent>>>,
        trailer: Option<u64>,
        reserved_for: Arc<Mutex<Option<i64>>>,
        fail_writes: bool,
    }

    impl RecordingMuxer {
        fn events(&self) -> Vec<MuxEvent> {
            self.events.lock().unwrap().clone()
        }

        fn writes(&self) -> Vec<(usize, i64)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    MuxEvent::Write {
                        stream,
                        running_time,
                        ..
                    } => Some((stream, running_time)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Muxer for RecordingMuxer {
        fn open(&mut self, location: &str) -> Result<(), MuxError> {
            self.events
                .lock()
                .unwrap()
                .push(MuxEvent::Open(location.to_string()));
            Ok(())
        }

        fn write(
            &mut self,
            stream: StreamId,
            payload: &Bytes,
            running_time: i64,
            _duration: u64,
        ) -> Result<u64, MuxError> {
            if self.fail_writes {
                return Err(MuxError::Rejected("disk full".to_string()));
            }
            self.events.lock().unwrap().push(MuxEvent::Write {
                stream: stream.index(),
                running_time,
                bytes: payload.len(),
            });
            Ok(payload.len() as u64)
        }

        fn renegotiate(&mut self, stream: StreamId, caps: &str) -> Result<(), MuxError> {
            self.events.lock().unwrap().push(MuxEvent::Renegotiate {
                stream: stream.index(),
                caps: caps.to_string(),
            });
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), MuxError> {
            self.events.lock().unwrap().push(MuxEvent::Finalize);
            Ok(())
        }

        fn reserve_trailer(&mut self, max_duration: i64) -> Option<u64> {
            *self.reserved_for.lock().unwrap() = Some(max_duration);
            self.trailer
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        opened: Mutex<Vec<FragmentOpened>>,
        closed: Mutex<Vec<FragmentClosed>>,
    }

    impl FragmentListener for RecordingListener {
        fn fragment_opened(&self, fragment: &FragmentOpened) {
            self.opened.lock().unwrap().push(fragment.clone());
        }

        fn fragment_closed(&self, fragment: &FragmentClosed) {
            self.closed.lock().unwrap().push(fragment.clone());
        }
    }

    fn settings(threshold_time: i64) -> EngineSettings {
        EngineSettings {
            policy: SplitPolicy {
                threshold_time,
                ..SplitPolicy::default()
            },
            ..EngineSettings::default()
        }
    }

    fn engine_with(
        settings: EngineSettings,
        muxer: RecordingMuxer,
    ) -> (Engine, RecordingMuxer, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let engine = Engine::new(settings, Box::new(muxer.clone()), listener.clone());
        (engine, muxer, listener)
    }

    fn engine(settings: EngineSettings) -> (Engine, RecordingMuxer, Arc<RecordingListener>) {
        engine_with(settings, RecordingMuxer::default())
    }

    fn buffer(running_time: i64, duration: i64, is_keyframe: bool, size: usize) -> MediaBuffer {
        MediaBuffer::new(vec![0u8; size], running_time, duration as u64, is_keyframe)
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn bounds(closed: &[FragmentClosed]) -> Vec<(u32, i64, i64, u64)> {
        closed
            .iter()
            .map(|f| (f.id, f.start_running_time, f.end_running_time, f.bytes))
            .collect()
    }

    /// Audio-only run: every buffer is a keyframe, 100 ms apart.
    fn run_audio(engine: &Engine, audio: StreamId, count: i64, size: usize) -> DrainReport {
        let output = engine.start().unwrap();
        for i in 0..count {
            engine
                .ingest(audio, buffer(i * 100 * MS, 100 * MS, false, size))
                .unwrap();
        }
        engine.mark_eos(audio).unwrap();
        output.join().unwrap()
    }

    #[test]
    fn test_splits_on_keyframes_past_time_threshold() {
        let (engine, muxer, listener) = engine(settings(4 * SEC));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let output = engine.start().unwrap();

        for t in 0..10 {
            let key = matches!(t, 0 | 2 | 5 | 9);
            let status = engine.ingest(video, buffer(t * SEC, SEC, key, 100)).unwrap();
            assert_eq!(status, IngestStatus::Queued);
        }
        engine.mark_eos(video).unwrap();
        let report = output.join().unwrap();

        let expected = vec![
            (0, 0, 5 * SEC, 500),
            (1, 5 * SEC, 9 * SEC, 400),
            (2, 9 * SEC, 10 * SEC, 100),
        ];
        assert_eq!(bounds(&report.fragments), expected);
        assert_eq!(bounds(&listener.closed.lock().unwrap()), expected);
        assert_eq!(report.muxed_out_bytes, 1000);

        let opened: Vec<_> = listener
            .opened
            .lock()
            .unwrap()
            .iter()
            .map(|f| (f.location.clone(), f.start_running_time))
            .collect();
        assert_eq!(
            opened,
            vec![
                ("segment00000.ts".to_string(), 0),
                ("segment00001.ts".to_string(), 5 * SEC),
                ("segment00002.ts".to_string(), 9 * SEC),
            ]
        );

        let events = muxer.events();
        assert_eq!(events.iter().filter(|e| **e == MuxEvent::Finalize).count(), 3);
        assert_eq!(events.last(), Some(&MuxEvent::Finalize));

        let stats = engine.stats();
        assert_eq!(stats.input_state, InputState::Stopped);
        assert_eq!(stats.output_state, OutputState::Stopped);
        assert!(!stats.output_running);
        assert_eq!(stats.fragment_id, 2);
        assert_eq!(stats.muxed_out_bytes, 1000);
    }

    #[test]
    fn test_single_audio_stream_drains_on_eos() {
        let (engine, muxer, _listener) = engine(settings(300 * MS));
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let report = run_audio(&engine, audio, 10, 10);

        assert_eq!(
            bounds(&report.fragments),
            vec![
                (0, 0, 300 * MS, 30),
                (1, 300 * MS, 600 * MS, 30),
                (2, 600 * MS, 900 * MS, 30),
                (3, 900 * MS, 1000 * MS, 10),
            ]
        );
        assert_eq!(muxer.writes().len(), 10);
        let out = engine.stream_stats(audio).unwrap();
        assert!(out.out_eos);
        assert_eq!(out.out_running_time, 900 * MS);
        assert_eq!(out.queued_buffers, 0);
    }

    #[test]
    fn test_commands_follow_gathered_gops() {
        let (engine, _muxer, _listener) = engine(settings(2 * SEC));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();

        engine.ingest(video, buffer(0, SEC, true, 10)).unwrap();
        assert!(engine.pending_commands().is_empty());
        engine.ingest(video, buffer(SEC, SEC, true, 10)).unwrap();
        engine.ingest(video, buffer(2 * SEC, SEC, true, 10)).unwrap();
        engine.mark_eos(video).unwrap();

        assert_eq!(
            engine.pending_commands(),
            vec![
                Command::gop(false, SEC),
                Command::gop(true, 2 * SEC),
                Command::finish(),
            ]
        );
        let stats = engine.stats();
        assert_eq!(stats.gops_gathered, 2);
        assert_eq!(stats.commands_issued, 3);
        assert_eq!(stats.fragment_start_time, 2 * SEC);
        assert_eq!(stats.output_state, OutputState::Stopped);
    }

    #[test]
    fn test_split_now_forces_split_at_next_gop() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let output = engine.start().unwrap();

        engine.ingest(video, buffer(0, SEC, true, 10)).unwrap();
        engine.ingest(video, buffer(SEC, SEC, true, 10)).unwrap();
        engine.split_now();
        engine.ingest(video, buffer(2 * SEC, SEC, true, 10)).unwrap();
        engine.ingest(video, buffer(3 * SEC, SEC, true, 10)).unwrap();
        engine.mark_eos(video).unwrap();
        let report = output.join().unwrap();

        assert_eq!(
            bounds(&report.fragments),
            vec![(0, 0, 2 * SEC, 20), (1, 2 * SEC, 4 * SEC, 20)]
        );
    }

    #[test]
    fn test_secondary_streams_never_split_mid_gop() {
        let (engine, muxer, _listener) = engine(settings(SEC));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();
        let output = engine.start().unwrap();

        let producer = engine.clone();
        let video_thread = thread::spawn(move || {
            for i in 0..30 {
                producer
                    .ingest(video, buffer(i * 100 * MS, 100 * MS, i % 10 == 0, 50))
                    .unwrap();
            }
            producer.mark_eos(video).unwrap();
        });
        let producer = engine.clone();
        let audio_thread = thread::spawn(move || {
            for i in 0..60 {
                producer
                    .ingest(audio, buffer(i * 50 * MS, 50 * MS, true, 8))
                    .unwrap();
            }
            producer.mark_eos(audio).unwrap();
        });
        video_thread.join().unwrap();
        audio_thread.join().unwrap();
        let report = output.join().unwrap();

        let fragments: Vec<_> = report
            .fragments
            .iter()
            .map(|f| (f.start_running_time, f.end_running_time))
            .collect();
        assert_eq!(
            fragments,
            vec![(0, SEC), (SEC, 2 * SEC), (2 * SEC, 3 * SEC)]
        );
        assert_eq!(report.muxed_out_bytes, 30 * 50 + 60 * 8);

        // each fragment starts on a keyframe and holds only its own span
        let mut fragment = None;
        let mut last = [RUNNING_TIME_NONE; 2];
        for event in muxer.events() {
            match event {
                MuxEvent::Open(_) => {
                    fragment = Some(fragment.map_or(0, |i: usize| i + 1));
                }
                MuxEvent::Write {
                    stream,
                    running_time,
                    ..
                } => {
                    let (start, end) = fragments[fragment.unwrap()];
                    assert!(running_time >= start && running_time < end);
                    assert!(running_time > last[stream], "stream went back in time");
                    last[stream] = running_time;
                }
                _ => {}
            }
        }
        assert_eq!(muxer.writes().len(), 90);
        assert_eq!(muxer.writes()[0], (video.index(), 0));
    }

    #[test]
    fn test_flush_of_lagging_stream_completes_gop() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let producer = engine.clone();
        let video_thread = thread::spawn(move || {
            producer.ingest(video, buffer(0, SEC, true, 10)).unwrap();
            producer.ingest(video, buffer(SEC, SEC, true, 10)).unwrap()
        });

        wait_until("GOP collection", || {
            engine.stats().input_state == InputState::WaitingGopCollect
        });
        assert!(!video_thread.is_finished());

        engine.flush(audio).unwrap();
        assert_eq!(video_thread.join().unwrap(), IngestStatus::Queued);
        assert_eq!(engine.pending_commands(), vec![Command::gop(false, SEC)]);
        assert_eq!(engine.stats().input_state, InputState::CollectingGopStart);
    }

    #[test]
    fn test_flush_discards_waiting_buffer() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();
        engine.ingest(video, buffer(0, SEC, true, 10)).unwrap();

        let producer = engine.clone();
        let audio_thread = thread::spawn(move || producer.ingest(audio, buffer(0, SEC, true, 10)));
        wait_until("audio cursor", || {
            engine.stream_stats(audio).unwrap().in_running_time == 0
        });

        engine.flush(audio).unwrap();
        assert_eq!(audio_thread.join().unwrap().unwrap(), IngestStatus::Discarded);
        let stats = engine.stream_stats(audio).unwrap();
        assert_eq!(stats.queued_buffers, 0);
        assert_eq!(stats.in_running_time, RUNNING_TIME_NONE);
    }

    #[test]
    fn test_flush_of_reference_restarts_collection() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        engine.ingest(video, buffer(0, SEC, true, 10)).unwrap();
        engine.ingest(video, buffer(SEC / 2, SEC, false, 10)).unwrap();
        assert_eq!(engine.stats().gop_total_bytes, 20);

        engine.flush(video).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.gop_total_bytes, 0);
        assert_eq!(stats.input_state, InputState::CollectingGopStart);

        // a new keyframe anchors a fresh GOP instead of closing the old one
        engine.ingest(video, buffer(10 * SEC, SEC, true, 10)).unwrap();
        assert!(engine.pending_commands().is_empty());
        engine.ingest(video, buffer(11 * SEC, SEC, true, 10)).unwrap();
        assert_eq!(engine.pending_commands(), vec![Command::gop(false, 11 * SEC)]);
    }

    #[test]
    fn test_detach_of_lagging_stream_completes_gop() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let producer = engine.clone();
        let video_thread = thread::spawn(move || {
            producer.ingest(video, buffer(0, SEC, true, 10)).unwrap();
            producer.ingest(video, buffer(SEC, SEC, true, 10)).unwrap()
        });
        wait_until("GOP collection", || {
            engine.stats().input_state == InputState::WaitingGopCollect
        });

        engine.detach_stream(audio).unwrap();
        assert_eq!(video_thread.join().unwrap(), IngestStatus::Queued);
        assert_eq!(engine.stats().streams, 1);
        assert!(matches!(
            engine.ingest(audio, buffer(0, SEC, true, 1)),
            Err(EngineError::UnknownStream)
        ));

        // the freed slot is reused with a fresh generation
        let data = engine
            .attach_stream(StreamSpec::new("data", StreamKind::Data))
            .unwrap();
        assert_eq!(data.index(), audio.index());
        assert_ne!(data, audio);
    }

    #[test]
    fn test_waiting_secondary_takes_over_as_reference() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();
        engine.ingest(video, buffer(0, SEC, true, 10)).unwrap();

        let producer = engine.clone();
        let audio_thread = thread::spawn(move || producer.ingest(audio, buffer(0, 100 * MS, false, 4)));
        wait_until("audio cursor", || {
            engine.stream_stats(audio).unwrap().in_running_time == 0
        });
        assert!(!audio_thread.is_finished());

        engine.detach_stream(video).unwrap();
        assert_eq!(audio_thread.join().unwrap().unwrap(), IngestStatus::Queued);
        let stats = engine.stream_stats(audio).unwrap();
        assert!(stats.is_reference);
        assert_eq!(stats.queued_buffers, 1);

        // audio buffers now close GOPs on their own
        engine.ingest(audio, buffer(100 * MS, 100 * MS, false, 4)).unwrap();
        assert_eq!(engine.pending_commands(), vec![Command::gop(false, 100 * MS)]);
    }

    #[test]
    fn test_late_reference_keyframes_never_move_boundary_back() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();

        let mut boundaries = Vec::new();
        for t in [0, 2 * SEC, SEC, 2 * SEC] {
            engine.ingest(video, buffer(t, SEC, true, 10)).unwrap();
            boundaries.push(engine.stats().max_in_running_time);
        }
        assert_eq!(
            boundaries,
            vec![RUNNING_TIME_NONE, 2 * SEC, 2 * SEC, 2 * SEC]
        );
        assert_eq!(engine.pending_commands(), vec![Command::gop(false, 2 * SEC)]);
        assert_eq!(engine.stream_stats(video).unwrap().in_running_time, 2 * SEC);
        assert_eq!(engine.stats().commands_issued, 1);
    }

    #[test]
    fn test_timecode_threshold_reanchors_on_split() {
        let mut settings = settings(0);
        settings.policy.timecode = Some(Timecode::parse("00:00:03:00", "25").unwrap());
        let (engine, _muxer, _listener) = engine(settings);
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let output = engine.start().unwrap();

        for t in 0..10 {
            let key = matches!(t, 0 | 4 | 6 | 8);
            engine.ingest(video, buffer(t * SEC, SEC, key, 100)).unwrap();
        }
        engine.mark_eos(video).unwrap();
        let report = output.join().unwrap();

        // the split at 4s moves the next timecode boundary to 7s, so 6s stays
        assert_eq!(
            bounds(&report.fragments),
            vec![
                (0, 0, 4 * SEC, 400),
                (1, 4 * SEC, 8 * SEC, 400),
                (2, 8 * SEC, 10 * SEC, 200),
            ]
        );
    }

    #[test]
    fn test_reference_election() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();
        assert!(engine.stream_stats(audio).unwrap().is_reference);

        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        assert!(engine.stream_stats(video).unwrap().is_reference);
        assert!(!engine.stream_stats(audio).unwrap().is_reference);

        engine.ingest(video, buffer(0, SEC, true, 1)).unwrap();
        let late = engine
            .attach_stream(StreamSpec::new("video2", StreamKind::Video))
            .unwrap();
        assert!(!engine.stream_stats(late).unwrap().is_reference);

        engine.detach_stream(video).unwrap();
        assert!(engine.stream_stats(late).unwrap().is_reference);
    }

    #[test]
    fn test_desynchronized_buffer_is_reported() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let producer = engine.clone();
        let video_thread = thread::spawn(move || {
            for t in 0..3 {
                producer.ingest(video, buffer(t * SEC, SEC, true, 10)).unwrap();
            }
            producer.mark_eos(video).unwrap();
        });

        assert_eq!(
            engine.ingest(audio, buffer(0, SEC, true, 10)).unwrap(),
            IngestStatus::Queued
        );
        assert_eq!(
            engine.ingest(audio, buffer(SEC, SEC, true, 10)).unwrap(),
            IngestStatus::Queued
        );
        assert_eq!(
            engine.ingest(audio, buffer(200 * MS, SEC, true, 10)).unwrap(),
            IngestStatus::Desynchronized { skew: 800 * MS }
        );
        engine.ingest(audio, buffer(2 * SEC, SEC, true, 10)).unwrap();
        engine.mark_eos(audio).unwrap();
        video_thread.join().unwrap();

        assert_eq!(
            engine.pending_commands(),
            vec![
                Command::gop(false, SEC),
                Command::gop(false, 2 * SEC),
                Command::finish(),
            ]
        );
    }

    #[test]
    fn test_backpressure_waits_for_output() {
        let mut settings = settings(0);
        settings.queue_soft_bytes = 100;
        let (engine, muxer, _listener) = engine(settings);
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let producer = engine.clone();
        let audio_thread = thread::spawn(move || {
            for i in 0..20 {
                producer
                    .ingest(audio, buffer(i * 100 * MS, 100 * MS, true, 60))
                    .unwrap();
            }
            producer.mark_eos(audio).unwrap();
        });

        wait_until("queue over soft limit", || {
            engine.stream_stats(audio).unwrap().queued_buffers == 2
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!audio_thread.is_finished());
        assert_eq!(engine.stream_stats(audio).unwrap().queued_buffers, 2);

        let output = engine.start().unwrap();
        audio_thread.join().unwrap();
        let report = output.join().unwrap();
        assert_eq!(report.muxed_out_bytes, 20 * 60);
        assert_eq!(muxer.writes().len(), 20);
    }

    #[test]
    fn test_hard_limit_rejects_buffer() {
        let mut settings = settings(0);
        settings.queue_hard_bytes = 100;
        let (engine, _muxer, _listener) = engine(settings);
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        engine.ingest(audio, buffer(0, MS, true, 60)).unwrap();
        let err = engine.ingest(audio, buffer(MS, MS, true, 60)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::QueueOverflow {
                queued_bytes: 60,
                limit: 100,
                ..
            }
        ));
        assert_eq!(engine.stream_stats(audio).unwrap().queued_buffers, 1);
    }

    #[test]
    fn test_drain_failure_is_fatal() {
        let muxer = RecordingMuxer {
            fail_writes: true,
            ..RecordingMuxer::default()
        };
        let (engine, _muxer, _listener) = engine_with(settings(0), muxer);
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();
        let output = engine.start().unwrap();

        engine.ingest(audio, buffer(0, MS, true, 10)).unwrap();
        engine.ingest(audio, buffer(MS, MS, true, 10)).unwrap();
        let err = output.join().unwrap_err();
        match err {
            EngineError::Drain {
                fragment_id,
                location,
                source,
            } => {
                assert_eq!(fragment_id, 0);
                assert_eq!(location, "segment00000.ts");
                assert!(matches!(source, MuxError::Rejected(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = engine.ingest(audio, buffer(2 * MS, MS, true, 10)).unwrap_err();
        assert!(matches!(err, EngineError::Fatal { fragment_id: 0, .. }));
        assert!(matches!(
            engine.attach_stream(StreamSpec::new("late", StreamKind::Data)),
            Err(EngineError::Fatal { .. })
        ));
    }

    #[test]
    fn test_reset_gives_identical_rerun() {
        let (engine, muxer, _listener) = engine(settings(300 * MS));
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let first = run_audio(&engine, audio, 7, 12);
        let first_events = muxer.events();
        muxer.events.lock().unwrap().clear();

        engine.reset();
        let stats = engine.stats();
        assert_eq!(stats.input_state, InputState::Stopped);
        assert_eq!(stats.fragment_id, 0);
        assert_eq!(stats.commands_issued, 0);

        let second = run_audio(&engine, audio, 7, 12);
        assert_eq!(first, second);
        assert_eq!(first_events, muxer.events());
        assert_eq!(first.fragments.len(), 3);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let output = engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        engine.shutdown();
        assert!(output.join().unwrap().fragments.is_empty());
    }

    #[test]
    fn test_shutdown_releases_waiting_producer() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();
        engine.ingest(video, buffer(0, SEC, true, 10)).unwrap();

        let producer = engine.clone();
        let audio_thread = thread::spawn(move || producer.ingest(audio, buffer(0, SEC, true, 10)));
        wait_until("audio cursor", || {
            engine.stream_stats(audio).unwrap().in_running_time == 0
        });

        engine.shutdown();
        assert!(matches!(
            audio_thread.join().unwrap(),
            Err(EngineError::Stopped)
        ));
        assert!(matches!(
            engine.ingest(video, buffer(SEC, SEC, true, 10)),
            Err(EngineError::Stopped)
        ));
    }

    #[test]
    fn test_robust_muxing_reserves_trailer_space() {
        let mut settings = settings(10 * SEC);
        settings.policy.threshold_bytes = 1000;
        settings.use_robust_muxing = true;
        let muxer = RecordingMuxer {
            trailer: Some(500),
            ..RecordingMuxer::default()
        };
        let (engine, muxer, _listener) = engine_with(settings, muxer);
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let report = run_audio(&engine, audio, 6, 200);
        assert_eq!(
            bounds(&report.fragments),
            vec![(0, 0, 300 * MS, 600), (1, 300 * MS, 600 * MS, 600)]
        );
        assert_eq!(*muxer.reserved_for.lock().unwrap(), Some(10 * SEC));
    }

    #[test]
    fn test_robust_muxing_skips_reserve_without_time_threshold() {
        let mut settings = settings(0);
        settings.policy.threshold_bytes = 1000;
        settings.use_robust_muxing = true;
        let muxer = RecordingMuxer {
            trailer: Some(500),
            ..RecordingMuxer::default()
        };
        let (engine, muxer, _listener) = engine_with(settings, muxer);
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let report = run_audio(&engine, audio, 6, 200);
        assert_eq!(*muxer.reserved_for.lock().unwrap(), None);
        assert_eq!(report.fragments.len(), 1);
        assert_eq!(report.fragments[0].bytes, 1200);
    }

    #[test]
    fn test_robust_muxing_without_support_keeps_full_threshold() {
        let mut settings = settings(10 * SEC);
        settings.policy.threshold_bytes = 1000;
        settings.use_robust_muxing = true;
        let (engine, _muxer, _listener) = engine(settings);
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio))
            .unwrap();

        let report = run_audio(&engine, audio, 6, 200);
        assert_eq!(report.fragments.len(), 1);
        assert_eq!(report.fragments[0].bytes, 1200);
    }

    #[test]
    fn test_format_change_renegotiates_before_next_buffer() {
        let (engine, muxer, _listener) = engine(settings(0));
        let audio = engine
            .attach_stream(StreamSpec::new("audio", StreamKind::Audio).with_caps("audio/x-raw"))
            .unwrap();
        let output = engine.start().unwrap();

        engine.ingest(audio, buffer(0, 100 * MS, true, 4)).unwrap();
        engine.ingest(audio, buffer(100 * MS, 100 * MS, true, 4)).unwrap();
        engine.change_format(audio, "audio/x-opus").unwrap();
        engine.ingest(audio, buffer(200 * MS, 100 * MS, true, 4)).unwrap();
        engine.mark_eos(audio).unwrap();
        output.join().unwrap();

        let stream = audio.index();
        let write = |running_time| MuxEvent::Write {
            stream,
            running_time,
            bytes: 4,
        };
        assert_eq!(
            muxer.events(),
            vec![
                MuxEvent::Open("segment00000.ts".to_string()),
                MuxEvent::Renegotiate {
                    stream,
                    caps: "audio/x-raw".to_string()
                },
                write(0),
                write(100 * MS),
                MuxEvent::Renegotiate {
                    stream,
                    caps: "audio/x-opus".to_string()
                },
                write(200 * MS),
                MuxEvent::Finalize,
            ]
        );
    }

    #[test]
    fn test_eos_and_keyframe_bookkeeping() {
        let (engine, _muxer, _listener) = engine(settings(0));
        let video = engine
            .attach_stream(StreamSpec::new("video", StreamKind::Video))
            .unwrap();

        engine
            .ingest(video, MediaBuffer::new(Bytes::from_static(b"idr"), 0, 1, true))
            .unwrap();
        engine
            .ingest(video, MediaBuffer::new(Bytes::from_static(b"p"), 1, 1, false))
            .unwrap();
        assert_eq!(engine.last_keyframe(video), Some(Bytes::from_static(b"idr")));

        engine.mark_eos(video).unwrap();
        assert!(matches!(
            engine.ingest(video, buffer(2, 1, false, 1)),
            Err(EngineError::StreamEnded(_))
        ));
        assert!(matches!(
            engine.attach_stream(StreamSpec::new("audio", StreamKind::Audio)),
            Err(EngineError::AttachAfterEos)
        ));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::parse(
            r#"
[split]
max_size_bytes = 4096
max_size_time_ms = 2000
alignment_threshold_ms = 40
use_robust_muxing = true

[output]
location = "part-%d.mp4"

[[streams]]
name = "cam"
kind = "video"
"#,
        )
        .unwrap();
        let settings = EngineSettings::from_config(&config).unwrap();
        assert_eq!(settings.policy.threshold_bytes, 4096);
        assert_eq!(settings.policy.threshold_time, 2 * SEC);
        assert_eq!(settings.alignment_threshold, 40 * MS);
        assert!(settings.use_robust_muxing);
        assert_eq!(settings.location.format(7), "part-7.mp4");
    }
}
