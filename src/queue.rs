use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::models::Track;

/// Pending tracks of one guild, in play order. Never holds the track that is currently playing.
#[derive(Debug)]
pub struct GuildQueue {
    guild_id: u64,
    pending: VecDeque<Track>,
}

/// Read-only view of the head of a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub tracks: Vec<Track>,
    pub remaining: usize,
}

impl GuildQueue {
    pub fn new(guild_id: u64) -> Self {
        GuildQueue {
            guild_id,
            pending: VecDeque::new(),
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn append(&mut self, track: Track) {
        self.pending.push_back(track);
    }

    /// Puts a track back at the head, ahead of everything pending.
    pub fn push_front(&mut self, track: Track) {
        self.pending.push_front(track);
    }

    pub fn pop_front(&mut self) -> Option<Track> {
        self.pending.pop_front()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self, limit: usize) -> QueueSnapshot {
        let tracks: Vec<Track> = self.pending.iter().take(limit).cloned().collect();
        let remaining = self.pending.len() - tracks.len();

        QueueSnapshot { tracks, remaining }
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.pending.iter().cloned().collect()
    }

    pub fn shuffle(&mut self) {
        self.pending.make_contiguous().shuffle(&mut thread_rng());
    }
}
