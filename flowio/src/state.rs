use std::fmt;

/// Lifecycle state shared by readable and writable streams
///
/// ```text
/// Idle ──first pull/write──▶ Active ◀──▶ Paused   (readable)
///                              │  ◀──▶ Draining (writable)
///                              ├──────▶ Finished
///                              └──────▶ Errored
/// any ──destroy()──▶ Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing pulled or written yet
    Idle,
    /// Moving data
    Active,
    /// Writable: a write returned `false` and no drain happened yet
    Draining,
    /// Readable: the eager pull loop is stopped
    Paused,
    /// All data delivered and the resource released
    Finished,
    /// Failed; queued data discarded and the resource released
    Errored,
    /// Torn down by `destroy()`
    Destroyed,
}

impl StreamState {
    /// No more data will move through the stream
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Destroyed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}
