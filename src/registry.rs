use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::queue::GuildQueue;
use crate::session::PlaybackSession;

/// Everything one guild's commands mutate. Held behind the guild's own lock, so
/// every read-then-act sequence on it is serialized per guild.
#[derive(Debug)]
pub struct GuildState {
    pub queue: GuildQueue,
    pub session: PlaybackSession,
}

pub type GuildHandle = Arc<Mutex<GuildState>>;

/// Process-wide guild id -> guild state mapping.
///
/// Created once at startup and shared by handle. Entries are created lazily on
/// first use and live until the process exits; nothing is ever evicted.
#[derive(Default)]
pub struct QueueRegistry {
    guilds: RwLock<HashMap<u64, GuildHandle>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, guild_id: u64) -> GuildHandle {
        {
            let guilds = self.guilds.read().await;
            if let Some(handle) = guilds.get(&guild_id) {
                return handle.clone();
            }
        }

        // Re-checked under the write lock: a concurrent caller may have inserted meanwhile.
        let mut guilds = self.guilds.write().await;
        guilds
            .entry(guild_id)
            .or_insert_with(|| {
                debug!("Creating queue for guild {guild_id}");

                Arc::new(Mutex::new(GuildState {
                    queue: GuildQueue::new(guild_id),
                    session: PlaybackSession::default(),
                }))
            })
            .clone()
    }

    pub async fn get(&self, guild_id: u64) -> Option<GuildHandle> {
        self.guilds.read().await.get(&guild_id).cloned()
    }
}
