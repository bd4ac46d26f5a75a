use thiserror::Error;

use super::RUNNING_TIME_NONE;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimecodeError {
    #[error("expected HH:MM:SS:FF, got {0:?}")]
    Format(String),
    #[error("invalid framerate {0:?}")]
    Framerate(String),
    #[error("frame count {frames} exceeds framerate {fps}")]
    FrameOverflow { frames: u64, fps: u64 },
    #[error("timecode threshold is zero")]
    Zero,
}

/// Timecode threshold converted to a running-time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timecode {
    pub frames: u64,
    pub fps_n: u64,
    pub fps_d: u64,
}

impl Timecode {
    /// Parses `HH:MM:SS:FF` (a `;` before the frames is accepted) against a
    /// framerate such as `"25"` or `"30000/1001"`.
    pub fn parse(timecode: &str, framerate: &str) -> Result<Self, TimecodeError> {
        let (fps_n, fps_d) = parse_framerate(framerate)?;
        let nominal_fps = fps_n.div_ceil(fps_d);

        let normalized = timecode.trim().replace(';', ":");
        let parts: Vec<&str> = normalized.split(':').collect();
        if parts.len() != 4 {
            return Err(TimecodeError::Format(timecode.to_string()));
        }
        let mut fields = [0u64; 4];
        for (field, part) in fields.iter_mut().zip(&parts) {
            *field = part
                .parse()
                .map_err(|_| TimecodeError::Format(timecode.to_string()))?;
        }
        let [hours, minutes, seconds, frames] = fields;
        if minutes >= 60 || seconds >= 60 {
            return Err(TimecodeError::Format(timecode.to_string()));
        }
        if frames >= nominal_fps {
            return Err(TimecodeError::FrameOverflow {
                frames,
                fps: nominal_fps,
            });
        }

        let total = (hours * 3600 + minutes * 60 + seconds) * nominal_fps + frames;
        if total == 0 {
            return Err(TimecodeError::Zero);
        }

        Ok(Self {
            frames: total,
            fps_n,
            fps_d,
        })
    }

    pub fn duration_ns(&self) -> i64 {
        let ns = self.frames as u128 * self.fps_d as u128 * NANOS_PER_SEC as u128
            / self.fps_n as u128;
        i64::try_from(ns).unwrap_or(i64::MAX)
    }
}

fn parse_framerate(framerate: &str) -> Result<(u64, u64), TimecodeError> {
    let err = || TimecodeError::Framerate(framerate.to_string());
    let (n, d) = match framerate.trim().split_once('/') {
        Some((n, d)) => (n.trim().parse().map_err(|_| err())?, d.trim().parse().map_err(|_| err())?),
        None => (framerate.trim().parse().map_err(|_| err())?, 1),
    };
    if n == 0 || d == 0 {
        return Err(err());
    }
    Ok((n, d))
}

/// Thresholds that decide whether a gathered GOP closes the fragment.
#[derive(Debug, Clone, Default)]
pub struct SplitPolicy {
    /// 0 disables
    pub threshold_bytes: u64,
    /// Nanoseconds, 0 disables
    pub threshold_time: i64,
    pub timecode: Option<Timecode>,
    pub mux_overhead: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitReason {
    Requested,
    Bytes,
    Time,
    Timecode,
}

/// Inputs of one split decision, sampled under the engine lock.
#[derive(Debug, Clone, Copy)]
pub struct GopSnapshot {
    pub fragment_total_bytes: u64,
    pub gop_total_bytes: u64,
    pub fragment_start_time: i64,
    pub boundary: i64,
    pub next_timecode_boundary: i64,
    pub reserved_bytes: u64,
    pub split_requested: bool,
}

impl SplitPolicy {
    pub fn decide(&self, gop: &GopSnapshot) -> Option<SplitReason> {
        // never close an empty fragment
        if gop.fragment_total_bytes + gop.gop_total_bytes == 0 {
            return None;
        }
        if gop.split_requested {
            return Some(SplitReason::Requested);
        }

        if self.threshold_bytes > 0 {
            let projected = self.projected_bytes(gop.fragment_total_bytes + gop.gop_total_bytes);
            let limit = self.threshold_bytes.saturating_sub(gop.reserved_bytes);
            if projected > limit {
                return Some(SplitReason::Bytes);
            }
        }

        if self.threshold_time > 0
            && gop.fragment_start_time != RUNNING_TIME_NONE
            && gop.boundary.saturating_sub(gop.fragment_start_time) >= self.threshold_time
        {
            return Some(SplitReason::Time);
        }

        if gop.next_timecode_boundary != RUNNING_TIME_NONE && gop.boundary >= gop.next_timecode_boundary {
            return Some(SplitReason::Timecode);
        }

        None
    }

    pub fn projected_bytes(&self, bytes: u64) -> u64 {
        (bytes as f64 * (1.0 + self.mux_overhead)) as u64
    }

    /// Next running time at which the timecode threshold fires for a
    /// fragment starting at `fragment_start`.
    pub fn next_timecode_boundary(&self, fragment_start: i64) -> i64 {
        match self.timecode {
            Some(tc) if fragment_start != RUNNING_TIME_NONE => {
                fragment_start.saturating_add(tc.duration_ns())
            }
            _ => RUNNING_TIME_NONE,
        }
    }
}
