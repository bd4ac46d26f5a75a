//! Output side: pops commands and writes every released record to the muxer
//! in running-time order, opening and closing fragments on the way.

use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;

use super::command::Command;
use super::stream::{QueuedBuffer, StreamId};
use super::{EngineError, Fatal, InputState, OutputState, Shared, RUNNING_TIME_NONE};
use crate::mux::{MuxError, Muxer};
use crate::notify::{FragmentClosed, FragmentListener, FragmentOpened};

/// What one output thread run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub fragments: Vec<FragmentClosed>,
    pub muxed_out_bytes: u64,
}

pub struct OutputHandle {
    handle: JoinHandle<Result<DrainReport, EngineError>>,
}

impl OutputHandle {
    /// Waits for the output thread to stop.
    pub fn join(self) -> Result<DrainReport, EngineError> {
        self.handle
            .join()
            .map_err(|_| EngineError::OutputPanicked)?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    muxer: Box<dyn Muxer>,
    listener: Arc<dyn FragmentListener>,
    session: u64,
) -> Result<OutputHandle, EngineError> {
    let drainer = OutputDrainer {
        shared: Arc::clone(&shared),
        muxer,
        listener,
        session,
        command: Command::gop(false, RUNNING_TIME_NONE),
        current: None,
        opened_any: false,
        next_start: RUNNING_TIME_NONE,
        finishing: false,
        report: DrainReport::default(),
    };

    let spawned = std::thread::Builder::new()
        .name("segmux-output".to_string())
        .spawn(move || drainer.run());
    match spawned {
        Ok(handle) => Ok(OutputHandle { handle }),
        Err(e) => {
            shared.lock().output_running = false;
            Err(EngineError::Spawn(e))
        }
    }
}

struct OpenFragment {
    id: u32,
    location: String,
    start_running_time: i64,
    last_end_time: i64,
    bytes: u64,
}

struct OutputDrainer {
    shared: Arc<Shared>,
    muxer: Box<dyn Muxer>,
    listener: Arc<dyn FragmentListener>,
    session: u64,
    command: Command,
    current: Option<OpenFragment>,
    opened_any: bool,
    /// Start time of the fragment opened after a split.
    next_start: i64,
    finishing: bool,
    report: DrainReport,
}

impl OutputDrainer {
    fn run(mut self) -> Result<DrainReport, EngineError> {
        tracing::debug!(session = self.session, "output thread started");
        let result = self.drain();

        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        if let Err(EngineError::Drain {
            fragment_id,
            location,
            source,
        }) = &result
        {
            tracing::error!(
                fragment = fragment_id,
                location = %location,
                error = %source,
                "output failed, engine stopped"
            );
            state.fatal = Some(Fatal {
                fragment_id: *fragment_id,
                location: location.clone(),
                reason: source.to_string(),
            });
        }
        state.output_running = false;
        state.output_state = OutputState::Stopped;
        drop(state);
        shared.wake_all();

        let OutputDrainer {
            muxer,
            listener,
            report,
            ..
        } = self;
        *shared
            .collaborators
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((muxer, listener));

        tracing::debug!(fragments = report.fragments.len(), "output thread stopped");
        result.map(|()| report)
    }

    fn drain(&mut self) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        state.output_state = OutputState::AwaitingCommand;

        loop {
            if state.stopping || state.session != self.session || state.fatal.is_some() {
                tracing::debug!(stopping = state.stopping, "output interrupted");
                drop(state);
                let end = self.current.as_ref().map_or(RUNNING_TIME_NONE, |f| f.last_end_time);
                return self.close_fragment(end);
            }

            let output_state = state.output_state;
            match output_state {
                OutputState::Stopped => return Ok(()),
                OutputState::AwaitingCommand => match state.commands.pop() {
                    Some(command) => {
                        tracing::trace!(?command, "output command");
                        self.command = command;
                        state.output_state = OutputState::OutputGop;
                    }
                    None => state = shared.wait_output(state),
                },
                OutputState::OutputGop => {
                    let max_output_time = self.command.max_output_time;
                    match state.peek_output(max_output_time) {
                        Some(_) if self.current.is_none() => {
                            state.output_state = OutputState::StartNextFile;
                        }
                        Some(index) => {
                            let Some(ctx) = state.streams.get_mut(index).and_then(Option::as_mut)
                            else {
                                continue;
                            };
                            let Some(buffer) = ctx.pop() else {
                                continue;
                            };
                            let stream = ctx.id;
                            let epoch = ctx.flush_epoch;
                            drop(state);

                            let written = self.write_buffer(stream, &buffer);
                            state = shared.lock();
                            let produced = written?;

                            if let Some(ctx) = state.stream_mut(stream) {
                                if ctx.flush_epoch == epoch {
                                    ctx.out_running_time = buffer.record.running_time;
                                    if ctx.in_eos && ctx.queued.is_empty() {
                                        ctx.out_eos = true;
                                    }
                                }
                            }
                            state.muxed_out_bytes += produced;
                            self.report.muxed_out_bytes += produced;
                            if let Some(fragment) = self.current.as_mut() {
                                fragment.bytes += produced;
                                fragment.last_end_time =
                                    fragment.last_end_time.max(buffer.record.end_time());
                            }
                            shared.input_cond.notify_all();
                        }
                        None if self.command.is_final() => {
                            if state.all_drained() {
                                self.finishing = true;
                                state.output_state = OutputState::EndingFile;
                            } else {
                                state = shared.wait_output(state);
                            }
                        }
                        None => {
                            state.max_out_running_time = max_output_time;
                            if self.command.start_new_fragment {
                                self.next_start = max_output_time;
                                state.output_state = OutputState::EndingFile;
                            } else {
                                state.output_state = OutputState::AwaitingCommand;
                            }
                            shared.input_cond.notify_all();
                        }
                    }
                }
                OutputState::EndingFile => {
                    let end = if self.finishing {
                        self.current.as_ref().map_or(RUNNING_TIME_NONE, |f| f.last_end_time)
                    } else {
                        self.command.max_output_time
                    };
                    drop(state);
                    self.close_fragment(end)?;
                    state = shared.lock();
                    if self.finishing {
                        state.output_state = OutputState::Stopped;
                        state.input_state = InputState::Stopped;
                        tracing::debug!(
                            muxed_out_bytes = state.muxed_out_bytes,
                            "all streams drained"
                        );
                        return Ok(());
                    }
                    state.output_state = OutputState::AwaitingCommand;
                }
                OutputState::StartNextFile => {
                    if self.opened_any {
                        state.fragment_id += 1;
                    }
                    let id = state.fragment_id;
                    let start = if self.next_start != RUNNING_TIME_NONE {
                        self.next_start
                    } else {
                        state
                            .peek_output(self.command.max_output_time)
                            .and_then(|index| state.streams[index].as_ref()?.front_time())
                            .unwrap_or(RUNNING_TIME_NONE)
                    };
                    drop(state);
                    self.open_fragment(id, start)?;
                    state = shared.lock();
                    state.output_state = OutputState::OutputGop;
                }
            }
        }
    }

    fn write_buffer(&mut self, stream: StreamId, buffer: &QueuedBuffer) -> Result<u64, EngineError> {
        let result = match &buffer.caps {
            Some(caps) => self.muxer.renegotiate(stream, caps),
            None => Ok(()),
        }
        .and_then(|()| {
            self.muxer.write(
                stream,
                &buffer.payload,
                buffer.record.running_time,
                buffer.record.duration,
            )
        });
        result.map_err(|e| self.failure(e))
    }

    fn open_fragment(&mut self, id: u32, start_running_time: i64) -> Result<(), EngineError> {
        let location = self.shared.settings.location.format(id);
        self.opened_any = true;
        self.current = Some(OpenFragment {
            id,
            location: location.clone(),
            start_running_time,
            last_end_time: start_running_time,
            bytes: 0,
        });
        self.muxer.open(&location).map_err(|e| self.failure(e))?;

        tracing::debug!(fragment = id, location = %location, start_running_time, "fragment opened");
        self.listener.fragment_opened(&FragmentOpened {
            id,
            location,
            start_running_time,
        });
        Ok(())
    }

    fn close_fragment(&mut self, end_running_time: i64) -> Result<(), EngineError> {
        let Some(fragment) = self.current.take() else {
            return Ok(());
        };
        if let Err(e) = self.muxer.finalize() {
            return Err(EngineError::Drain {
                fragment_id: fragment.id,
                location: fragment.location,
                source: e,
            });
        }

        let closed = FragmentClosed {
            id: fragment.id,
            location: fragment.location,
            start_running_time: fragment.start_running_time,
            end_running_time,
            bytes: fragment.bytes,
        };
        tracing::debug!(
            fragment = closed.id,
            bytes = closed.bytes,
            end_running_time,
            "fragment closed"
        );
        self.listener.fragment_closed(&closed);
        self.report.fragments.push(closed);
        Ok(())
    }

    fn failure(&self, source: MuxError) -> EngineError {
        let (fragment_id, location) = match &self.current {
            Some(fragment) => (fragment.id, fragment.location.clone()),
            None => (0, String::new()),
        };
        EngineError::Drain {
            fragment_id,
            location,
            source,
        }
    }
}
