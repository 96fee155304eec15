use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serenity::client::Context;
use serenity::constants::MESSAGE_CODE_LIMIT;
use serenity::framework::standard::{
    macros::{command, group},
    Args, CommandError, CommandResult,
};
use serenity::model::channel::Message;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::id::{GuildId, UserId};
use serenity::prelude::TypeMapKey;
use serenity::Result as SerenityResult;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::PlaybackCoordinator;
use crate::error::{MusicError, MusicResult};
use crate::models::{EnqueueResult, SessionState};
use crate::render;
use crate::songbird_engine::SongbirdEngine;
use crate::store::PlaylistStore;

pub mod playlist;

pub type Coordinator = PlaybackCoordinator<Arc<SongbirdEngine>, Arc<SongbirdEngine>>;

pub struct CoordinatorKey;

impl TypeMapKey for CoordinatorKey {
    type Value = Arc<Coordinator>;
}

pub struct StoreKey;

impl TypeMapKey for StoreKey {
    type Value = Arc<PlaylistStore>;
}

pub struct ConfigKey;

impl TypeMapKey for ConfigKey {
    type Value = Arc<Config>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl TypeMapKey for BotDataMap {
    type Value = BotData;
}

const LOADING_EMOJI: &str = "⏳";
const SUCCESS_EMOJI: &str = "👍";
const FAILURE_EMOJI: &str = "💀";

#[group]
#[commands(join, play, skip, pause, resume, stop, leave, queue, shuffle, help)]
struct General;

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let prefix = config(ctx).await?.prefix.clone();

    let message = format!(
        r#"
**Commands:**
    **{prefix}join** - Joins your voice channel.
    **{prefix}play [URL|Title]** - Plays (or adds to the queue) new tracks given a URL or a video title (supports youtube playlists).
    **{prefix}skip** - Skips the current track.
    **{prefix}pause** - Pauses the current track.
    **{prefix}resume** - Resumes the paused track.
    **{prefix}stop** - Stops the current track and clears the queue.
    **{prefix}leave** - Leaves the voice channel.
    **{prefix}queue** - Shows the queue of tracks.
    **{prefix}shuffle** - Reorders the queue randomly.
**Playlists:**
    **{prefix}playlist create|delete|show|play|savequeue [NAME]** - Manages saved playlists.
    **{prefix}playlist add [NAME] [URL|Title]** - Adds tracks to a saved playlist.
    **{prefix}playlist list** - Lists the playlists of this server.
    "#
    );

    say(ctx, msg, message).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let coordinator = coordinator(ctx).await?;

    let result = ensure_voice(ctx, msg, &coordinator).await.map(|_| "Joined your voice channel.");
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let query = args.message().trim().to_string();

    if query.is_empty() {
        say(ctx, msg, "Give me a URL or something to search for.").await;
        return Ok(());
    }

    let guild_id = get_guild_id(msg)?;
    let coordinator = coordinator(ctx).await?;

    let result = with_loading_reaction(ctx, msg, async {
        ensure_voice(ctx, msg, &coordinator).await?;
        coordinator.enqueue_and_maybe_start(guild_id.0, &query, msg.author.id.0).await
    })
    .await;

    if let Ok(queued) = &result {
        info!("Queued {} track(s) in guild {}, started playback: {}", queued.count, guild_id.0, queued.started);
    }

    reply(ctx, msg, result.map(|queued| queued_message(&queued))).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("next")]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    info!("Skip command invoked from guild {}!", guild_id.0);

    let result = coordinator(ctx).await?.skip(guild_id.0).await.map(|_| "Skipped.");
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    let result = coordinator(ctx).await?.pause(guild_id.0).await.map(|_| "Paused.");
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("unpause")]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    let result = coordinator(ctx).await?.resume(guild_id.0).await.map(|_| "Resumed.");
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    coordinator(ctx).await?.stop(guild_id.0).await;
    say(ctx, msg, "Stopped and cleared the queue.").await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    match coordinator(ctx).await?.leave(guild_id.0).await {
        Ok(()) => say(ctx, msg, "Left the channel.").await,
        Err(MusicError::NotConnected) => say(ctx, msg, "I'm not in a voice channel.").await,
        Err(why) => reply::<&str>(ctx, msg, Err(why)).await,
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;
    let limit = config(ctx).await?.queue_display_limit;
    let coordinator = coordinator(ctx).await?;

    let mut lines = Vec::new();
    if let Some(track) = coordinator.now_playing(guild_id.0).await {
        let paused = coordinator.session_state(guild_id.0).await == SessionState::Paused;
        let label = if paused { "Paused" } else { "Now playing" };

        lines.push(format!("{label}: **{}** [{}]", track.title, render::format_duration(track.duration)));
    }

    let queued = coordinator.render_queue(guild_id.0, limit).await;
    if queued.is_empty() {
        lines.push("Queue is empty.".to_string());
    } else {
        lines.extend(queued);
    }

    say_lines(ctx, msg, &lines).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn shuffle(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    info!("Shuffle command invoked from guild {}!", guild_id.0);

    let shuffled = coordinator(ctx).await?.shuffle(guild_id.0).await;
    check_reaction(msg.react(&ctx.http, Unicode(SUCCESS_EMOJI.to_string())).await);
    say(ctx, msg, format!("Shuffled {shuffled} track(s).")).await;

    Ok(())
}

fn queued_message(queued: &EnqueueResult) -> String {
    let message = match (&queued.title, queued.count) {
        (Some(title), 1) => format!("Queued: **{title}**"),
        (_, count) => format!("Queued **{count}** tracks."),
    };

    with_play_error(message, queued)
}

pub(crate) fn with_play_error(message: String, queued: &EnqueueResult) -> String {
    match &queued.play_error {
        Some(why) => format!("{message}\nCould not start playback: {why}"),
        None => message,
    }
}

pub(crate) async fn coordinator(ctx: &Context) -> Result<Arc<Coordinator>, CommandError> {
    let data = ctx.data.read().await;

    data.get::<CoordinatorKey>()
        .cloned()
        .ok_or_else(|| CommandError::from("Playback coordinator not initialised"))
}

pub(crate) async fn config(ctx: &Context) -> Result<Arc<Config>, CommandError> {
    let data = ctx.data.read().await;

    data.get::<ConfigKey>()
        .cloned()
        .ok_or_else(|| CommandError::from("Config not initialised"))
}

/// `StoreUnavailable` when the store failed to open at startup.
pub(crate) async fn store(ctx: &Context) -> MusicResult<Arc<PlaylistStore>> {
    let data = ctx.data.read().await;

    data.get::<StoreKey>().cloned().ok_or(MusicError::StoreUnavailable)
}

pub(crate) fn get_guild_id(msg: &Message) -> Result<GuildId, CommandError> {
    msg.guild_id.ok_or(CommandError::from("Guild not found"))
}

/// Joins the author's voice channel, or fails with `NotInVoiceChannel`.
pub(crate) async fn ensure_voice(ctx: &Context, msg: &Message, coordinator: &Coordinator) -> MusicResult<()> {
    let guild = msg.guild(&ctx.cache).ok_or(MusicError::NotInVoiceChannel)?;

    let channel_id = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or(MusicError::NotInVoiceChannel)?;

    coordinator.join(guild.id.0, channel_id.0).await
}

/// Shows ⏳ while `action` runs, then 👍 or 💀 depending on its outcome.
pub(crate) async fn with_loading_reaction<T, F>(ctx: &Context, msg: &Message, action: F) -> MusicResult<T>
where
    F: Future<Output = MusicResult<T>>,
{
    let loading_emoji = Unicode(LOADING_EMOJI.to_string());

    check_reaction(msg.react(&ctx.http, loading_emoji.clone()).await);

    let result = action.await;

    let bot_id = ctx.data.read().await.get::<BotDataMap>().map(|data| data.id);
    if let Some(bot_id) = bot_id {
        if let Err(why) = msg
            .channel_id
            .delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji)
            .await
        {
            info!("Error removing reaction: {why:?}");
        }
    }

    let answer_emoji = match result {
        Ok(_) => SUCCESS_EMOJI,
        Err(_) => FAILURE_EMOJI,
    };
    check_reaction(msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await);

    result
}

/// Sends the success text, or the error's user-facing message.
pub(crate) async fn reply<T: Display>(ctx: &Context, msg: &Message, result: MusicResult<T>) {
    match result {
        Ok(text) => say(ctx, msg, text).await,
        Err(why) => {
            if matches!(why, MusicError::Store(_) | MusicError::Engine(_)) {
                warn!("Command {:?} failed: {why}", msg.content);
            }

            say(ctx, msg, why).await
        }
    }
}

pub(crate) async fn say(ctx: &Context, msg: &Message, text: impl Display) {
    check_msg(msg.channel_id.say(&ctx.http, text).await);
}

/// Sends lines in as few messages as the length limit allows.
pub(crate) async fn say_lines(ctx: &Context, msg: &Message, lines: &[String]) {
    for chunk in chunk_lines(lines, MESSAGE_CODE_LIMIT) {
        say(ctx, msg, chunk).await;
    }
}

fn chunk_lines(lines: &[String], limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in lines {
        let needed = if current.is_empty() { 0 } else { 1 } + line.chars().count();

        if !current.is_empty() && current.chars().count() + needed > limit {
            chunks.push(std::mem::take(&mut current));
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.extend(line.chars().take(limit));
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Checks that a message successfully sent; if not, then logs why to stdout.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

fn check_reaction<T>(result: SerenityResult<T>) {
    if let Err(why) = result {
        info!("Error reacting to message: {why:?}");
    }
}
