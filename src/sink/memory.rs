use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::{FragmentSink, SinkError};

struct MemoryStore {
    location: Option<String>,
    buffer: Option<Vec<u8>>,
    capacity: usize,
    eos: bool,
}

/// Accumulates one fragment in memory until its owner takes it.
///
/// Clones share the same store: the muxer writes through one handle while
/// the fragment index takes finished fragments through another.
#[derive(Clone)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(MemoryStore {
                location: None,
                buffer: None,
                capacity,
                eos: false,
            })),
        }
    }

    fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the buffered fragment out. One-shot: later writes to the same
    /// location fail until the sink is started again.
    pub fn take(&self, location: &str) -> Result<Bytes, SinkError> {
        let mut store = self.store();
        if store.location.as_deref() != Some(location) {
            return Err(SinkError::LocationMismatch {
                held: store.location.clone(),
                requested: location.to_string(),
            });
        }
        if !store.eos {
            tracing::warn!(location = %location, "taking fragment before it was finished");
        }
        let buffer = store
            .buffer
            .take()
            .ok_or_else(|| SinkError::AlreadyTaken(location.to_string()))?;
        tracing::trace!(location = %location, bytes = buffer.len(), "moved fragment out of memory sink");
        Ok(Bytes::from(buffer))
    }

    pub fn resident_bytes(&self) -> usize {
        self.store().buffer.as_ref().map_or(0, Vec::len)
    }
}

impl FragmentSink for MemorySink {
    fn set_location(&mut self, location: &str) -> Result<(), SinkError> {
        let mut store = self.store();
        if store.buffer.is_some() {
            let held = store.location.clone().unwrap_or_default();
            return Err(SinkError::LocationBusy(held));
        }
        store.location = Some(location.to_string());
        Ok(())
    }

    fn start(&mut self) -> Result<(), SinkError> {
        let mut store = self.store();
        match store.location.as_deref() {
            None | Some("") => return Err(SinkError::NoLocation),
            Some(_) => {}
        }
        store.buffer = Some(Vec::new());
        store.eos = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let mut store = self.store();
        let capacity = store.capacity;
        let buffer = store.buffer.as_mut().ok_or(SinkError::NotStarted)?;
        let needed = buffer.len() + data.len();
        if needed > capacity {
            return Err(SinkError::NoSpace { needed, capacity });
        }
        buffer.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.store().eos = true;
        Ok(())
    }
}
