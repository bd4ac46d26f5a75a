use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;

use crate::config::PlaylistConfig;
use crate::notify::{FragmentClosed, FragmentListener, FragmentOpened};
use crate::sink::{resolve, MemorySink};

/// Where closed fragments live until they fall out of retention.
pub enum Retention {
    Disk(PathBuf),
    Memory(MemorySink),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentEntry {
    pub sequence: u64,
    pub location: String,
    pub duration: u64,
    pub bytes: u64,
}

struct IndexState {
    window: VecDeque<FragmentEntry>,
    retained: VecDeque<String>,
    cache: HashMap<String, Bytes>,
    next_sequence: u64,
    first_sequence: u64,
}

/// Sliding window over closed fragments, with eviction of the ones that
/// fall out of retention.
pub struct FragmentIndex {
    state: RwLock<IndexState>,
    length: usize,
    max_files: usize,
    retention: Retention,
}

impl FragmentIndex {
    /// `length` 0 keeps every fragment.
    pub fn new(length: usize, max_files: usize, retention: Retention) -> Self {
        Self {
            state: RwLock::new(IndexState {
                window: VecDeque::new(),
                retained: VecDeque::new(),
                cache: HashMap::new(),
                next_sequence: 0,
                first_sequence: 0,
            }),
            length,
            max_files,
            retention,
        }
    }

    pub fn from_config(config: &PlaylistConfig, retention: Retention) -> Self {
        Self::new(config.length, config.max_files, retention)
    }

    /// Fragments currently in the window, oldest first.
    pub fn entries(&self) -> Vec<FragmentEntry> {
        self.read().window.iter().cloned().collect()
    }

    /// Media sequence number of the first fragment in the window
    pub fn first_sequence(&self) -> u64 {
        self.read().first_sequence
    }

    pub fn retained(&self) -> usize {
        self.read().retained.len()
    }

    /// Cached bytes of a retained fragment (memory retention only).
    pub fn fragment(&self, location: &str) -> Option<Bytes> {
        self.read().cache.get(location).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn retention_limit(&self) -> usize {
        if self.length == 0 {
            0
        } else {
            self.length.max(self.max_files)
        }
    }

    fn evict(&self, state: &mut IndexState, location: &str) {
        match &self.retention {
            Retention::Disk(directory) => {
                let path = resolve(directory, location);
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed old fragment"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove old fragment")
                    }
                }
            }
            Retention::Memory(_) => {
                let dropped = state.cache.remove(location).map_or(0, |b| b.len());
                tracing::debug!(location = %location, bytes = dropped, "dropped cached fragment");
            }
        }
    }
}

impl FragmentListener for FragmentIndex {
    fn fragment_opened(&self, fragment: &FragmentOpened) {
        tracing::trace!(fragment = fragment.id, location = %fragment.location, "indexing new fragment");
    }

    fn fragment_closed(&self, fragment: &FragmentClosed) {
        let cached = match &self.retention {
            Retention::Memory(sink) => match sink.take(&fragment.location) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(location = %fragment.location, error = %e, "fragment not cached");
                    None
                }
            },
            Retention::Disk(_) => None,
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(bytes) = cached {
            state.cache.insert(fragment.location.clone(), bytes);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.window.push_back(FragmentEntry {
            sequence,
            location: fragment.location.clone(),
            duration: fragment.duration(),
            bytes: fragment.bytes,
        });
        while self.length > 0 && state.window.len() > self.length {
            state.window.pop_front();
            state.first_sequence += 1;
        }

        state.retained.push_back(fragment.location.clone());
        let limit = self.retention_limit();
        while limit > 0 && state.retained.len() > limit {
            if let Some(old) = state.retained.pop_front() {
                self.evict(&mut state, &old);
            }
        }

        tracing::trace!(
            sequence,
            first_sequence = state.first_sequence,
            window = state.window.len(),
            "fragment indexed"
        );
    }
}
