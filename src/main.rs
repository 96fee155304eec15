use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    model::{gateway::Ready, prelude::VoiceState},
    prelude::GatewayIntents,
};
use songbird::{SerenityInit, Songbird};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::playlist::PLAYLIST_GROUP;
use crate::commands::{BotData, BotDataMap, ConfigKey, CoordinatorKey, StoreKey, GENERAL_GROUP};
use crate::config::Config;
use crate::coordinator::{dispatch_track_ends, PlaybackCoordinator};
use crate::registry::QueueRegistry;
use crate::songbird_engine::SongbirdEngine;
use crate::store::PlaylistStore;

mod commands;
mod config;
mod coordinator;
mod engine;
mod error;
mod models;
mod queue;
mod registry;
mod render;
mod session;
mod songbird_engine;
mod store;
mod ytdlp;

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() {
            return;
        }

        let (bot_id, coordinator) = {
            let data = ctx.data.read().await;
            (data.get::<BotDataMap>().map(|data| data.id), data.get::<CoordinatorKey>().cloned())
        };

        if let (Some(bot_id), Some(guild_id), Some(coordinator)) = (bot_id, new.guild_id, coordinator) {
            if bot_id == new.user_id.0 {
                info!("Bot was disconnected from voice in guild {}", guild_id.0);
                coordinator.on_voice_disconnected(guild_id.0).await;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let dotenv_result = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if dotenv_result.is_err() {
        info!(".env file not found, using the process environment");
    }

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(why) => {
            error!("Invalid configuration: {why}");
            return;
        }
    };

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(config.prefix.as_str()))
        .group(&GENERAL_GROUP)
        .group(&PLAYLIST_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();

    let mut client = match Client::builder(&config.token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(songbird.clone())
        .await
    {
        Ok(client) => client,
        Err(why) => {
            error!("Err creating client: {why:?}");
            return;
        }
    };

    let (track_ended_tx, track_ended_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(SongbirdEngine::new(songbird, config.ytdlp_path.clone(), track_ended_tx));
    let coordinator = Arc::new(PlaybackCoordinator::new(Arc::new(QueueRegistry::new()), engine.clone(), engine));

    tokio::spawn(dispatch_track_ends(coordinator.clone(), track_ended_rx));

    {
        let mut data = client.data.write().await;

        data.insert::<ConfigKey>(config.clone());
        data.insert::<CoordinatorKey>(coordinator);

        match PlaylistStore::connect(&config.playlist_db).await {
            Ok(store) => {
                data.insert::<StoreKey>(Arc::new(store));
            }
            Err(why) => warn!("Playlist store unavailable, playlist commands disabled: {why}"),
        }
    }

    tokio::spawn(async move {
        if let Err(why) = client.start().await {
            error!("Client ended: {why:?}");
        }
    });

    if let Err(why) = tokio::signal::ctrl_c().await {
        error!("Control-C interruption failed: {why}");
    }

    info!("Received Ctrl-C, shutting down.");
}
