//! Input-side state machine: GOP boundary detection, completion checks and
//! the per-GOP split decision. Everything here runs with the engine lock
//! held; callers wake the condition variables afterwards.

use super::command::{Command, CommandQueue};
use super::policy::{GopSnapshot, SplitPolicy};
use super::stream::{StreamContext, StreamId, StreamSpec};
use super::{EngineError, EngineSettings, Fatal, InputState, OutputState};
use super::{RUNNING_TIME_MAX, RUNNING_TIME_NONE};

pub(crate) struct State {
    pub streams: Vec<Option<StreamContext>>,
    pub next_generation: u64,
    pub reference: Option<StreamId>,

    pub input_state: InputState,
    pub output_state: OutputState,

    pub fragment_id: u32,
    pub fragment_total_bytes: u64,
    pub gop_total_bytes: u64,
    pub muxed_out_bytes: u64,

    pub fragment_start_time: i64,
    pub gop_start_time: i64,
    pub max_in_running_time: i64,
    pub max_out_running_time: i64,
    /// Boundary of the latest GOP handed to the output side.
    pub released_until: i64,
    pub next_timecode_boundary: i64,

    pub reserved_bytes: u64,
    pub split_requested: bool,
    pub gops_gathered: u64,
    pub commands: CommandQueue,

    pub session: u64,
    pub stopping: bool,
    pub output_running: bool,
    pub fatal: Option<Fatal>,
}

impl State {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            next_generation: 0,
            reference: None,
            input_state: InputState::Stopped,
            output_state: OutputState::Stopped,
            fragment_id: 0,
            fragment_total_bytes: 0,
            gop_total_bytes: 0,
            muxed_out_bytes: 0,
            fragment_start_time: RUNNING_TIME_NONE,
            gop_start_time: RUNNING_TIME_NONE,
            max_in_running_time: RUNNING_TIME_NONE,
            max_out_running_time: RUNNING_TIME_NONE,
            released_until: RUNNING_TIME_NONE,
            next_timecode_boundary: RUNNING_TIME_NONE,
            reserved_bytes: 0,
            split_requested: false,
            gops_gathered: 0,
            commands: CommandQueue::default(),
            session: 0,
            stopping: false,
            output_running: false,
            fatal: None,
        }
    }

    pub fn check_running(&self) -> Result<(), EngineError> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.to_error());
        }
        if self.stopping {
            return Err(EngineError::Stopped);
        }
        Ok(())
    }

    pub fn stream(&self, id: StreamId) -> Option<&StreamContext> {
        self.streams
            .get(id.index)
            .and_then(Option::as_ref)
            .filter(|ctx| ctx.id == id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut StreamContext> {
        self.streams
            .get_mut(id.index)
            .and_then(Option::as_mut)
            .filter(|ctx| ctx.id == id)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &StreamContext> {
        self.streams.iter().flatten()
    }

    pub fn contexts_mut(&mut self) -> impl Iterator<Item = &mut StreamContext> {
        self.streams.iter_mut().flatten()
    }

    pub fn attach(&mut self, spec: StreamSpec) -> Result<StreamId, EngineError> {
        if self.input_state == InputState::FinishingUp {
            return Err(EngineError::AttachAfterEos);
        }

        let index = self
            .streams
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.streams.len());
        let id = StreamId {
            index,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        let ctx = StreamContext::new(id, spec);
        let is_video = ctx.kind.is_video();
        if index == self.streams.len() {
            self.streams.push(Some(ctx));
        } else {
            self.streams[index] = Some(ctx);
        }

        let take_over = match self.reference.and_then(|r| self.stream(r)) {
            None => true,
            // a video stream replaces a non-video reference until data flows
            Some(current) => {
                is_video && !current.kind.is_video() && self.input_state == InputState::Stopped
            }
        };
        if take_over {
            self.set_reference(Some(id));
        }

        Ok(id)
    }

    pub fn detach(
        &mut self,
        settings: &EngineSettings,
        id: StreamId,
    ) -> Result<StreamContext, EngineError> {
        self.stream(id).ok_or(EngineError::UnknownStream)?;
        let ctx = self.streams[id.index]
            .take()
            .ok_or(EngineError::UnknownStream)?;
        self.gop_total_bytes = self.gop_total_bytes.saturating_sub(ctx.gop_bytes);

        if self.reference == Some(id) {
            let next = self
                .contexts()
                .find(|c| c.kind.is_video())
                .or_else(|| self.contexts().next())
                .map(|c| c.id);
            self.set_reference(next);
        }

        self.check_completed_gop(settings);
        Ok(ctx)
    }

    fn set_reference(&mut self, id: Option<StreamId>) {
        for ctx in self.contexts_mut() {
            ctx.is_reference = Some(ctx.id) == id;
        }
        self.reference = id;
        if let Some(ctx) = id.and_then(|id| self.stream(id)) {
            tracing::debug!(stream = %ctx.name, kind = ?ctx.kind, "reference stream selected");
        }
    }

    /// Handles a keyframe on the reference stream. Returns true when a new
    /// GOP boundary was frozen and the caller has to wait for collection.
    pub fn reference_keyframe(&mut self, settings: &EngineSettings, running_time: i64) -> bool {
        if self.gop_start_time == RUNNING_TIME_NONE {
            self.gop_start_time = running_time;
            if self.fragment_start_time == RUNNING_TIME_NONE {
                self.fragment_start_time = running_time;
                self.next_timecode_boundary =
                    settings.policy.next_timecode_boundary(running_time);
            }
            tracing::debug!(running_time, "first GOP started");
            return false;
        }

        if running_time <= self.max_in_running_time || running_time <= self.gop_start_time {
            return false;
        }

        self.max_in_running_time = running_time;
        self.input_state = InputState::WaitingGopCollect;
        tracing::debug!(
            max_in_running_time = running_time,
            gop_start = self.gop_start_time,
            "GOP boundary frozen, collecting"
        );
        self.check_completed_gop(settings);
        true
    }

    /// Re-evaluates the GOP-complete predicate; gathers the GOP when every
    /// stream has covered the frozen boundary.
    pub fn check_completed_gop(&mut self, settings: &EngineSettings) -> bool {
        if self.input_state != InputState::WaitingGopCollect {
            return false;
        }
        let max_in = self.max_in_running_time;
        let threshold = settings.alignment_threshold;
        if !self.contexts().all(|ctx| ctx.covers(max_in, threshold)) {
            return false;
        }
        self.handle_gathered_gop(&settings.policy);
        true
    }

    fn handle_gathered_gop(&mut self, policy: &SplitPolicy) {
        let boundary = self.max_in_running_time;
        let snapshot = GopSnapshot {
            fragment_total_bytes: self.fragment_total_bytes,
            gop_total_bytes: self.gop_total_bytes,
            fragment_start_time: self.fragment_start_time,
            boundary,
            next_timecode_boundary: self.next_timecode_boundary,
            reserved_bytes: self.reserved_bytes,
            split_requested: self.split_requested,
        };
        let reason = policy.decide(&snapshot);
        let split = reason.is_some();

        tracing::debug!(
            boundary,
            gop_bytes = self.gop_total_bytes,
            fragment_bytes = self.fragment_total_bytes,
            split,
            reason = ?reason,
            "gathered GOP"
        );

        self.commands.push(Command::gop(split, boundary));

        if split {
            self.fragment_total_bytes = 0;
            self.fragment_start_time = boundary;
            self.split_requested = false;
            self.next_timecode_boundary = policy.next_timecode_boundary(boundary);
        } else {
            self.fragment_total_bytes += self.gop_total_bytes;
        }
        self.gop_total_bytes = 0;
        for ctx in self.contexts_mut() {
            ctx.gop_bytes = 0;
        }

        self.gop_start_time = boundary;
        self.released_until = boundary;
        self.gops_gathered += 1;
        self.input_state = InputState::CollectingGopStart;
    }

    /// Reference EOS: release everything that is left.
    pub fn enter_finishing(&mut self) {
        if self.input_state == InputState::FinishingUp {
            return;
        }
        tracing::debug!(
            from = ?self.input_state,
            gop_bytes = self.gop_total_bytes,
            "finishing up"
        );
        self.input_state = InputState::FinishingUp;
        self.fragment_total_bytes += self.gop_total_bytes;
        self.gop_total_bytes = 0;
        for ctx in self.contexts_mut() {
            ctx.gop_bytes = 0;
        }
        self.released_until = RUNNING_TIME_MAX;
        self.commands.push(Command::finish());
    }

    /// Whether a non-reference buffer at `running_time` may be queued now.
    pub fn admits_secondary(&self, running_time: i64) -> bool {
        match self.input_state {
            InputState::FinishingUp => true,
            InputState::Stopped | InputState::CollectingGopStart | InputState::WaitingGopCollect => {
                self.reference.is_none() || running_time < self.max_in_running_time
            }
        }
    }

    /// Flush of the reference abandons the GOP being collected.
    pub fn abandon_gop(&mut self) {
        if matches!(
            self.input_state,
            InputState::CollectingGopStart | InputState::WaitingGopCollect
        ) {
            tracing::debug!(
                max_in_running_time = self.max_in_running_time,
                "reference flushed, restarting GOP collection"
            );
            self.input_state = InputState::CollectingGopStart;
            self.max_in_running_time = RUNNING_TIME_NONE;
            self.gop_start_time = RUNNING_TIME_NONE;
        }
    }

    /// Clears all queued data and counters, keeping attached streams.
    pub fn reset(&mut self) {
        for ctx in self.contexts_mut() {
            ctx.flush();
            ctx.flushing = false;
        }
        self.input_state = InputState::Stopped;
        self.output_state = OutputState::Stopped;
        self.fragment_id = 0;
        self.fragment_total_bytes = 0;
        self.gop_total_bytes = 0;
        self.muxed_out_bytes = 0;
        self.fragment_start_time = RUNNING_TIME_NONE;
        self.gop_start_time = RUNNING_TIME_NONE;
        self.max_in_running_time = RUNNING_TIME_NONE;
        self.max_out_running_time = RUNNING_TIME_NONE;
        self.released_until = RUNNING_TIME_NONE;
        self.next_timecode_boundary = RUNNING_TIME_NONE;
        self.split_requested = false;
        self.gops_gathered = 0;
        self.commands.clear();
        self.stopping = false;
        self.fatal = None;
        self.session += 1;
    }

    /// Next record the output side may write below `max_output_time`:
    /// earliest front record across streams, ties to the lower slot.
    pub fn peek_output(&self, max_output_time: i64) -> Option<usize> {
        self.streams
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let time = slot.as_ref()?.front_time()?;
                (time < max_output_time).then_some((time, index))
            })
            .min()
            .map(|(_, index)| index)
    }

    pub fn all_drained(&self) -> bool {
        self.contexts().all(StreamContext::is_drained)
    }
}
