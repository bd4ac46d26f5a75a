/// Emitted when the output thread opens a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentOpened {
    pub id: u32,
    pub location: String,
    pub start_running_time: i64,
}

/// Emitted once a fragment has been finalized by the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentClosed {
    pub id: u32,
    pub location: String,
    pub start_running_time: i64,
    pub end_running_time: i64,
    /// Bytes the muxer produced for this fragment.
    pub bytes: u64,
}

impl FragmentClosed {
    pub fn duration(&self) -> u64 {
        self.end_running_time
            .saturating_sub(self.start_running_time)
            .max(0) as u64
    }
}

/// Receives fragment lifecycle events. Called from the output thread with
/// the engine lock released.
pub trait FragmentListener: Send + Sync {
    fn fragment_opened(&self, fragment: &FragmentOpened);
    fn fragment_closed(&self, fragment: &FragmentClosed);
}

/// Forwards events to several listeners in order.
pub struct ListenerSet {
    listeners: Vec<std::sync::Arc<dyn FragmentListener>>,
}

impl ListenerSet {
    pub fn new(listeners: Vec<std::sync::Arc<dyn FragmentListener>>) -> Self {
        Self { listeners }
    }
}

impl FragmentListener for ListenerSet {
    fn fragment_opened(&self, fragment: &FragmentOpened) {
        for listener in &self.listeners {
            listener.fragment_opened(fragment);
        }
    }

    fn fragment_closed(&self, fragment: &FragmentClosed) {
        for listener in &self.listeners {
            listener.fragment_closed(fragment);
        }
    }
}

/// Logs every event; the default listener of the binary when nothing else
/// is attached.
pub struct LogListener;

impl FragmentListener for LogListener {
    fn fragment_opened(&self, fragment: &FragmentOpened) {
        tracing::info!(
            fragment = fragment.id,
            location = %fragment.location,
            start_ms = fragment.start_running_time / 1_000_000,
            "fragment opened"
        );
    }

    fn fragment_closed(&self, fragment: &FragmentClosed) {
        tracing::info!(
            fragment = fragment.id,
            location = %fragment.location,
            duration_ms = fragment.duration() / 1_000_000,
            bytes = fragment.bytes,
            "fragment closed"
        );
    }
}
