use std::sync::Arc;

use serenity::async_trait;

use crate::error::MusicResult;
use crate::models::{PlayTicket, Track};

/// Remote audio engine: resolves queries and plays media into a guild's voice session.
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Empty on no match. Search text yields at most one track, URLs may yield many.
    async fn resolve(&self, query: &str) -> MusicResult<Vec<Track>>;

    /// The engine must report the end of this track with the same `ticket`.
    async fn play(&self, guild_id: u64, track: &Track, ticket: PlayTicket) -> MusicResult<()>;

    async fn pause(&self, guild_id: u64) -> MusicResult<()>;

    async fn resume(&self, guild_id: u64) -> MusicResult<()>;

    async fn stop(&self, guild_id: u64) -> MusicResult<()>;
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> MusicResult<()>;

    async fn disconnect(&self, guild_id: u64) -> MusicResult<()>;

    async fn is_connected(&self, guild_id: u64) -> bool;
}

/// Completion notification sent by the engine, naturally or after a stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackEnded {
    pub guild_id: u64,
    pub ticket: PlayTicket,
}

#[async_trait]
impl<T: AudioEngine + ?Sized> AudioEngine for Arc<T> {
    async fn resolve(&self, query: &str) -> MusicResult<Vec<Track>> {
        (**self).resolve(query).await
    }

    async fn play(&self, guild_id: u64, track: &Track, ticket: PlayTicket) -> MusicResult<()> {
        (**self).play(guild_id, track, ticket).await
    }

    async fn pause(&self, guild_id: u64) -> MusicResult<()> {
        (**self).pause(guild_id).await
    }

    async fn resume(&self, guild_id: u64) -> MusicResult<()> {
        (**self).resume(guild_id).await
    }

    async fn stop(&self, guild_id: u64) -> MusicResult<()> {
        (**self).stop(guild_id).await
    }
}

#[async_trait]
impl<T: VoiceConnector + ?Sized> VoiceConnector for Arc<T> {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> MusicResult<()> {
        (**self).connect(guild_id, channel_id).await
    }

    async fn disconnect(&self, guild_id: u64) -> MusicResult<()> {
        (**self).disconnect(guild_id).await
    }

    async fn is_connected(&self, guild_id: u64) -> bool {
        (**self).is_connected(guild_id).await
    }
}
