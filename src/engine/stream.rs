use std::collections::VecDeque;

use bytes::Bytes;
use serde::Deserialize;

use super::{RUNNING_TIME_MAX, RUNNING_TIME_NONE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

impl StreamKind {
    pub fn is_video(self) -> bool {
        self == StreamKind::Video
    }
}

/// Handle to an attached stream. Carries the slot generation so handles of a
/// detached stream never alias a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl StreamId {
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub kind: StreamKind,
    pub caps: Option<String>,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            caps: None,
        }
    }

    pub fn with_caps(mut self, caps: impl Into<String>) -> Self {
        self.caps = Some(caps.into());
        self
    }
}

/// One buffer handed to `Engine::ingest`.
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub payload: Bytes,
    pub running_time: i64,
    pub duration: u64,
    pub is_keyframe: bool,
}

impl MediaBuffer {
    pub fn new(payload: impl Into<Bytes>, running_time: i64, duration: u64, is_keyframe: bool) -> Self {
        Self {
            payload: payload.into(),
            running_time,
            duration,
            is_keyframe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRecord {
    pub is_keyframe: bool,
    pub running_time: i64,
    pub byte_size: u64,
    pub duration: u64,
}

impl BufferRecord {
    pub fn end_time(&self) -> i64 {
        self.running_time
            .saturating_add(i64::try_from(self.duration).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedBuffer {
    pub record: BufferRecord,
    pub payload: Bytes,
    /// Set on the first buffer after a format change.
    pub caps: Option<String>,
}

#[derive(Debug)]
pub(crate) struct StreamContext {
    pub id: StreamId,
    pub name: String,
    pub kind: StreamKind,
    pub is_reference: bool,

    pub flushing: bool,
    pub in_eos: bool,
    pub out_eos: bool,
    pub pending_caps: Option<String>,

    pub in_running_time: i64,
    pub out_running_time: i64,

    pub queued: VecDeque<QueuedBuffer>,
    pub queued_bytes: u64,
    /// Bytes this stream contributed to the GOP being collected.
    pub gop_bytes: u64,
    pub prev_in_keyframe: Option<Bytes>,
    pub flush_epoch: u64,
}

impl StreamContext {
    pub fn new(id: StreamId, spec: StreamSpec) -> Self {
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            is_reference: false,
            flushing: false,
            in_eos: false,
            out_eos: false,
            pending_caps: spec.caps,
            in_running_time: RUNNING_TIME_NONE,
            out_running_time: RUNNING_TIME_NONE,
            queued: VecDeque::new(),
            queued_bytes: 0,
            gop_bytes: 0,
            prev_in_keyframe: None,
            flush_epoch: 0,
        }
    }

    pub fn push(&mut self, buffer: QueuedBuffer) {
        self.queued_bytes += buffer.record.byte_size;
        self.gop_bytes += buffer.record.byte_size;
        self.queued.push_back(buffer);
    }

    pub fn pop(&mut self) -> Option<QueuedBuffer> {
        let buffer = self.queued.pop_front()?;
        self.queued_bytes = self.queued_bytes.saturating_sub(buffer.record.byte_size);
        Some(buffer)
    }

    pub fn front_time(&self) -> Option<i64> {
        self.queued.front().map(|b| b.record.running_time)
    }

    /// Span between the oldest queued record and the input cursor.
    pub fn queued_time(&self) -> u64 {
        match self.queued.front() {
            Some(front) => self
                .in_running_time
                .saturating_sub(front.record.running_time)
                .max(0) as u64,
            None => 0,
        }
    }

    /// Discards everything queued and returns the GOP bytes dropped with it.
    pub fn flush(&mut self) -> u64 {
        let dropped = self.gop_bytes;
        self.queued.clear();
        self.queued_bytes = 0;
        self.gop_bytes = 0;
        self.in_running_time = RUNNING_TIME_NONE;
        self.out_running_time = RUNNING_TIME_NONE;
        self.in_eos = false;
        self.out_eos = false;
        self.pending_caps = None;
        self.prev_in_keyframe = None;
        self.flushing = true;
        self.flush_epoch += 1;
        dropped
    }

    /// Whether this stream has covered the GOP ending at `max_in`.
    pub fn covers(&self, max_in: i64, alignment_threshold: i64) -> bool {
        if self.in_eos || self.flushing || max_in == RUNNING_TIME_MAX {
            return true;
        }
        self.in_running_time != RUNNING_TIME_NONE
            && self.in_running_time >= max_in.saturating_sub(alignment_threshold)
    }

    pub fn is_drained(&self) -> bool {
        self.in_eos && self.queued.is_empty()
    }
}
