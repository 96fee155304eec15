use std::collections::HashMap;
use std::sync::Arc;

use serenity::async_trait;
use songbird::input::ytdl_search;
use songbird::tracks::{TrackError, TrackHandle};
use songbird::{ytdl, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::engine::{AudioEngine, TrackEnded, VoiceConnector};
use crate::error::{MusicError, MusicResult};
use crate::models::{PlayTicket, Track, UNKNOWN_TRACK_TITLE};
use crate::ytdlp;

/// Audio engine and voice connector backed by songbird and yt-dlp.
pub struct SongbirdEngine {
    manager: Arc<Songbird>,
    ytdlp_path: String,
    track_ended: UnboundedSender<TrackEnded>,
    track_handles: Mutex<HashMap<u64, TrackHandle>>,
}

impl SongbirdEngine {
    pub fn new(manager: Arc<Songbird>, ytdlp_path: String, track_ended: UnboundedSender<TrackEnded>) -> Self {
        SongbirdEngine {
            manager,
            ytdlp_path,
            track_ended,
            track_handles: Mutex::new(HashMap::new()),
        }
    }

    async fn track_handle(&self, guild_id: u64) -> MusicResult<TrackHandle> {
        self.track_handles
            .lock()
            .await
            .get(&guild_id)
            .cloned()
            .ok_or(MusicError::NothingPlaying)
    }
}

#[async_trait]
impl AudioEngine for SongbirdEngine {
    async fn resolve(&self, query: &str) -> MusicResult<Vec<Track>> {
        info!("User input is {query}");

        if ytdlp::is_playlist_url(query) {
            info!("Detected playlist in {query}");
            return ytdlp::expand_playlist(&self.ytdlp_path, query).await;
        }

        let input = if ytdlp::is_url(query) {
            ytdl(query).await
        } else {
            ytdl_search(query).await
        };

        let input = match input {
            Ok(input) => input,
            Err(why) => {
                warn!("Could not load song for input {query}: {why:?}");
                return Ok(Vec::new());
            }
        };

        let metadata = &input.metadata;
        let Some(source_url) = metadata.source_url.clone() else {
            warn!("No source url for input {query}");
            return Ok(Vec::new());
        };

        let title = metadata.title.clone().unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string());

        Ok(vec![Track::new(title, source_url, metadata.duration)])
    }

    async fn play(&self, guild_id: u64, track: &Track, ticket: PlayTicket) -> MusicResult<()> {
        let handler_lock = self.manager.get(guild_id).ok_or(MusicError::NotConnected)?;

        let source = ytdl(&track.play_ref)
            .await
            .map_err(|why| MusicError::engine(format!("could not load {}: {why}", track.title)))?;

        let track_handle = {
            let mut handler = handler_lock.lock().await;

            handler.stop(); // Just in case something was playing before
            handler.play_source(source)
        };

        track_handle
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndNotifier {
                    guild_id,
                    ticket,
                    track_ended: self.track_ended.clone(),
                },
            )
            .map_err(MusicError::engine)?;

        self.track_handles.lock().await.insert(guild_id, track_handle);

        Ok(())
    }

    async fn pause(&self, guild_id: u64) -> MusicResult<()> {
        self.track_handle(guild_id).await?.pause().map_err(MusicError::engine)
    }

    async fn resume(&self, guild_id: u64) -> MusicResult<()> {
        self.track_handle(guild_id).await?.play().map_err(MusicError::engine)
    }

    async fn stop(&self, guild_id: u64) -> MusicResult<()> {
        let track_handle = self.track_handles.lock().await.remove(&guild_id);

        match track_handle.map(|handle| handle.stop()) {
            None | Some(Ok(())) | Some(Err(TrackError::Finished)) => Ok(()),
            Some(Err(why)) => Err(MusicError::engine(why)),
        }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdEngine {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> MusicResult<()> {
        let (handler_lock, joined) = self.manager.join(guild_id, channel_id).await;
        joined.map_err(MusicError::engine)?;

        let mut handler = handler_lock.lock().await;

        if handler.is_deaf() {
            info!("Already deafen!")
        } else if let Err(e) = handler.deafen(true).await {
            info!("Deafen failed due to {e:?}")
        }

        Ok(())
    }

    async fn disconnect(&self, guild_id: u64) -> MusicResult<()> {
        self.track_handles.lock().await.remove(&guild_id);

        if self.manager.get(guild_id).is_none() {
            return Err(MusicError::NotConnected);
        }

        self.manager.remove(guild_id).await.map_err(MusicError::engine)
    }

    async fn is_connected(&self, guild_id: u64) -> bool {
        match self.manager.get(guild_id) {
            Some(handler_lock) => handler_lock.lock().await.current_channel().is_some(),
            None => false,
        }
    }
}

struct TrackEndNotifier {
    guild_id: u64,
    ticket: PlayTicket,
    track_ended: UnboundedSender<TrackEnded>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        info!("End notifier triggered for guild {}", self.guild_id);

        let event = TrackEnded {
            guild_id: self.guild_id,
            ticket: self.ticket,
        };

        if self.track_ended.send(event).is_err() {
            warn!("Track end dispatcher is gone, guild {} will not advance", self.guild_id);
        }

        None
    }
}
