use crate::models::{PlayTicket, SessionState, Track};

/// Per-guild view of the voice session: connection state plus the track the engine was last told to play.
#[derive(Debug)]
pub struct PlaybackSession {
    state: SessionState,
    current: Option<(PlayTicket, Track)>,
    generation: u64,
}

impl Default for PlaybackSession {
    fn default() -> Self {
        PlaybackSession {
            state: SessionState::Disconnected,
            current: None,
            generation: 0,
        }
    }
}

impl PlaybackSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn is_connected(&self) -> bool {
        self.state != SessionState::Disconnected
    }

    pub fn now_playing(&self) -> Option<&Track> {
        self.current.as_ref().map(|(_, track)| track)
    }

    pub fn is_current(&self, ticket: PlayTicket) -> bool {
        matches!(&self.current, Some((current, _)) if *current == ticket)
    }

    pub fn connected(&mut self) {
        if self.state == SessionState::Disconnected {
            self.state = SessionState::Idle;
        }
    }

    /// Issues a fresh ticket for `track` and marks the session as playing.
    pub fn begin(&mut self, track: Track) -> PlayTicket {
        self.generation += 1;
        let ticket = PlayTicket(self.generation);

        self.current = Some((ticket, track));
        self.state = SessionState::Playing;

        ticket
    }

    /// Drops the current ticket; the session stays connected.
    pub fn finish(&mut self) {
        self.current = None;

        if self.state != SessionState::Disconnected {
            self.state = SessionState::Idle;
        }
    }

    pub fn paused(&mut self) {
        if self.state == SessionState::Playing {
            self.state = SessionState::Paused;
        }
    }

    pub fn resumed(&mut self) {
        if self.state == SessionState::Paused {
            self.state = SessionState::Playing;
        }
    }

    pub fn disconnected(&mut self) {
        self.current = None;
        self.state = SessionState::Disconnected;
    }
}
