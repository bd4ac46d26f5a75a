use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{resolve, FragmentSink, SinkError};

pub struct FileSink {
    directory: PathBuf,
    location: Option<String>,
    writer: Option<BufWriter<File>>,
    current_pos: u64,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            location: None,
            writer: None,
            current_pos: 0,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Bytes written to the current file.
    pub fn position(&self) -> u64 {
        self.current_pos
    }
}

impl FragmentSink for FileSink {
    fn set_location(&mut self, location: &str) -> Result<(), SinkError> {
        if let Some(current) = self.writer.as_ref().and(self.location.as_ref()) {
            return Err(SinkError::LocationBusy(current.clone()));
        }
        self.location = Some(location.to_string());
        Ok(())
    }

    fn start(&mut self) -> Result<(), SinkError> {
        let location = self.location.as_deref().ok_or(SinkError::NoLocation)?;
        let path = resolve(&self.directory, location);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        self.writer = Some(BufWriter::new(file));
        self.current_pos = 0;
        tracing::debug!(path = %path.display(), "opened fragment file");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotStarted)?;
        writer.write_all(data)?;
        self.current_pos += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
            tracing::trace!(
                location = ?self.location,
                bytes = self.current_pos,
                "closed fragment file"
            );
        }
        Ok(())
    }
}
