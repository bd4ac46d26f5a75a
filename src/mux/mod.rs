use bytes::Bytes;
use thiserror::Error;

use crate::engine::StreamId;
use crate::sink::{FragmentSink, SinkError};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("no fragment open")]
    NotOpen,
    #[error("muxer rejected input: {0}")]
    Rejected(String),
}

/// Container muxer fed by the output thread, one fragment at a time.
pub trait Muxer: Send {
    fn open(&mut self, location: &str) -> Result<(), MuxError>;

    /// Returns the number of bytes produced into the sink.
    fn write(
        &mut self,
        stream: StreamId,
        payload: &Bytes,
        running_time: i64,
        duration: u64,
    ) -> Result<u64, MuxError>;

    fn renegotiate(&mut self, _stream: StreamId, _caps: &str) -> Result<(), MuxError> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), MuxError>;

    /// Reserves space for finalization metadata covering `max_duration`
    /// nanoseconds of media. `None` when the muxer has no such support.
    fn reserve_trailer(&mut self, _max_duration: i64) -> Option<u64> {
        None
    }
}

/// Writes payloads unchanged, for streams that already carry container
/// packets (e.g. MPEG-TS).
pub struct PassthroughMuxer<S> {
    sink: S,
    location: Option<String>,
    written: u64,
}

impl<S: FragmentSink> PassthroughMuxer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            location: None,
            written: 0,
        }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: FragmentSink> Muxer for PassthroughMuxer<S> {
    fn open(&mut self, location: &str) -> Result<(), MuxError> {
        self.sink.set_location(location)?;
        self.sink.start()?;
        self.location = Some(location.to_string());
        self.written = 0;
        Ok(())
    }

    fn write(
        &mut self,
        _stream: StreamId,
        payload: &Bytes,
        _running_time: i64,
        _duration: u64,
    ) -> Result<u64, MuxError> {
        if self.location.is_none() {
            return Err(MuxError::NotOpen);
        }
        self.sink.write(payload)?;
        self.written += payload.len() as u64;
        Ok(payload.len() as u64)
    }

    fn renegotiate(&mut self, stream: StreamId, caps: &str) -> Result<(), MuxError> {
        tracing::debug!(stream = stream.index(), caps = %caps, "format change passed through");
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), MuxError> {
        let location = self.location.take().ok_or(MuxError::NotOpen)?;
        self.sink.finish()?;
        tracing::trace!(location = %location, bytes = self.written, "finalized fragment");
        Ok(())
    }
}
