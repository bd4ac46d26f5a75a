use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::engine::{
    Engine, EngineError, IngestStatus, MediaBuffer, StreamId, StreamKind, StreamSpec,
};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;
const NANOS_PER_MS: i64 = 1_000_000;
const KEYFRAME_SCALE: usize = 4;
const TS_SYNC_BYTE: u8 = 0x47;

/// Deterministic stand-in for a live capture: fixed frame rate, fixed GOP
/// length, payload sizes derived from the bitrate.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    name: String,
    kind: StreamKind,
    caps: Option<String>,
    frame_duration: i64,
    gop_frames: u32,
    frame_count: u64,
    frame_size: usize,
    start_offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub frames: u64,
    pub bytes: u64,
    pub desynchronized: u64,
    pub discarded: u64,
}

impl SyntheticSource {
    pub fn from_config(config: &StreamConfig) -> Self {
        let frame_duration = (NANOS_PER_SEC / config.fps).round() as i64;
        let frame_size = (f64::from(config.bitrate_kbps) * 1000.0 / 8.0 / config.fps) as usize;
        Self {
            name: config.name.clone(),
            kind: config.kind,
            caps: config.caps.clone(),
            frame_duration,
            gop_frames: config.gop_frames,
            frame_count: (config.duration_secs as f64 * config.fps) as u64,
            frame_size: frame_size.max(1),
            start_offset: config.start_offset_ms.saturating_mul(NANOS_PER_MS),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> StreamSpec {
        let spec = StreamSpec::new(self.name.clone(), self.kind);
        match &self.caps {
            Some(caps) => spec.with_caps(caps.clone()),
            None => spec,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn frame(&self, index: u64) -> MediaBuffer {
        let is_keyframe = !self.kind.is_video() || index % u64::from(self.gop_frames) == 0;
        let size = if is_keyframe && self.kind.is_video() {
            self.frame_size * KEYFRAME_SCALE
        } else {
            self.frame_size
        };

        let mut payload = vec![(index % 251) as u8; size];
        payload[0] = TS_SYNC_BYTE;

        let running_time = self
            .start_offset
            .saturating_add((index as i64).saturating_mul(self.frame_duration));
        MediaBuffer::new(payload, running_time, self.frame_duration as u64, is_keyframe)
    }

    /// Feeds every frame to the engine, paced to real time when `realtime`
    /// is set, then marks end of stream. Returns early on shutdown.
    pub fn run(
        &self,
        engine: &Engine,
        stream: StreamId,
        shutdown: &AtomicBool,
        realtime: bool,
    ) -> Result<SourceSummary, EngineError> {
        tracing::info!(stream = %self.name, frames = self.frame_count, "synthetic source started");
        let started = Instant::now();
        let mut summary = SourceSummary::default();

        for index in 0..self.frame_count {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!(stream = %self.name, frames = summary.frames, "source interrupted");
                break;
            }
            if realtime {
                let due = Duration::from_nanos(index * self.frame_duration as u64);
                if let Some(wait) = due.checked_sub(started.elapsed()) {
                    std::thread::sleep(wait);
                }
            }

            let buffer = self.frame(index);
            let size = buffer.payload.len() as u64;
            match engine.ingest(stream, buffer)? {
                IngestStatus::Queued => {}
                IngestStatus::Desynchronized { .. } => summary.desynchronized += 1,
                IngestStatus::Discarded => {
                    summary.discarded += 1;
                    continue;
                }
            }
            summary.frames += 1;
            summary.bytes += size;
        }

        engine.mark_eos(stream)?;
        tracing::info!(
            stream = %self.name,
            frames = summary.frames,
            bytes = summary.bytes,
            "synthetic source finished"
        );
        Ok(summary)
    }
}
