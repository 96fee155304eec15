use std::time::Duration;

pub const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// A resolved, playable piece of media.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    /// URL or engine identifier the audio engine can play from.
    pub play_ref: String,
    pub duration: Option<Duration>,
}

impl Track {
    pub fn new(title: impl Into<String>, play_ref: impl Into<String>, duration: Option<Duration>) -> Self {
        Track {
            title: title.into(),
            play_ref: play_ref.into(),
            duration,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration.map(|duration| duration.as_millis() as u64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Idle,
    Playing,
    Paused,
}

/// Generation number handed to the engine with every `play`, reported back on track end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayTicket(pub u64);

/// What the coordinator reports back to the command layer after queueing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueResult {
    pub count: usize,
    pub title: Option<String>,
    pub started: bool,
    /// Set when the engine refused the first track; the tracks stay queued.
    pub play_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub position: i64,
    pub track: Track,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistSummary {
    pub name: String,
    pub owner_id: u64,
    pub created_at: String,
}
