mod file;
mod memory;

pub use file::FileSink;
pub use memory::MemorySink;

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no location specified for writing")]
    NoLocation,
    #[error("sink not started")]
    NotStarted,
    #[error("not enough buffer space: {needed} bytes needed, capacity {capacity}")]
    NoSpace { needed: usize, capacity: usize },
    #[error("cannot change location while {0} is resident")]
    LocationBusy(String),
    #[error("location mismatch: sink holds {held:?}, requested {requested}")]
    LocationMismatch {
        held: Option<String>,
        requested: String,
    },
    #[error("fragment {0} was already taken")]
    AlreadyTaken(String),
}

/// Byte sink receiving one fragment at a time.
pub trait FragmentSink: Send {
    fn set_location(&mut self, location: &str) -> Result<(), SinkError>;
    fn start(&mut self) -> Result<(), SinkError>;
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Disk-backed or memory-backed sink chosen at startup.
pub enum SinkKind {
    File(FileSink),
    Memory(MemorySink),
}

impl FragmentSink for SinkKind {
    fn set_location(&mut self, location: &str) -> Result<(), SinkError> {
        match self {
            SinkKind::File(sink) => sink.set_location(location),
            SinkKind::Memory(sink) => sink.set_location(location),
        }
    }

    fn start(&mut self) -> Result<(), SinkError> {
        match self {
            SinkKind::File(sink) => sink.start(),
            SinkKind::Memory(sink) => sink.start(),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        match self {
            SinkKind::File(sink) => sink.write(data),
            SinkKind::Memory(sink) => sink.write(data),
        }
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        match self {
            SinkKind::File(sink) => sink.finish(),
            SinkKind::Memory(sink) => sink.finish(),
        }
    }
}

/// printf-style fragment name, e.g. `segment%05d.ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationTemplate(String);

impl LocationTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn format(&self, fragment_id: u32) -> String {
        let mut out = String::with_capacity(self.0.len() + 8);
        let mut chars = self.0.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                out.push('%');
                continue;
            }

            let mut spec = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    spec.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek() == Some(&'d') {
                chars.next();
                let zero_pad = spec.starts_with('0');
                let width: usize = spec.parse().unwrap_or(0);
                if zero_pad {
                    out.push_str(&format!("{:0width$}", fragment_id, width = width));
                } else {
                    out.push_str(&format!("{:width$}", fragment_id, width = width));
                }
            } else {
                // not a conversion we know, keep it literally
                out.push('%');
                out.push_str(&spec);
            }
        }

        out
    }
}

impl Default for LocationTemplate {
    fn default() -> Self {
        Self::new("segment%05d.ts")
    }
}

/// Resolves a fragment location against the output directory.
pub fn resolve(directory: &Path, location: &str) -> PathBuf {
    let path = Path::new(location);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        directory.join(path)
    }
}
