use serenity::client::Context;
use serenity::framework::standard::{
    macros::{command, group},
    Args, CommandResult,
};
use serenity::model::channel::Message;
use tracing::info;

use super::{
    config, coordinator, ensure_voice, get_guild_id, reply, say, say_lines, store, with_loading_reaction, with_play_error,
};
use crate::error::MusicError;
use crate::models::Track;
use crate::{render, ytdlp};

#[group]
#[prefixes("playlist", "pl")]
#[only_in(guilds)]
#[commands(create, delete, add, show, play, savequeue, list)]
struct Playlist;

/// First argument, quotes allowed so names may contain spaces.
fn playlist_name(args: &mut Args) -> Option<String> {
    args.single_quoted::<String>()
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[command]
async fn create(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let Some(name) = playlist_name(&mut args) else {
        say(ctx, msg, "Give the playlist a name.").await;
        return Ok(());
    };
    let guild_id = get_guild_id(msg)?;

    let result = async {
        store(ctx).await?.create_playlist(guild_id.0, &name, msg.author.id.0).await?;
        Ok::<_, MusicError>(format!("Created playlist **{name}**."))
    }
    .await;
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
async fn delete(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let Some(name) = playlist_name(&mut args) else {
        say(ctx, msg, "Which playlist?").await;
        return Ok(());
    };
    let guild_id = get_guild_id(msg)?;

    let result = async {
        store(ctx).await?.delete_playlist(guild_id.0, &name).await?;
        Ok::<_, MusicError>(format!("Deleted **{name}**."))
    }
    .await;
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
async fn add(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let Some(name) = playlist_name(&mut args) else {
        say(ctx, msg, "Which playlist?").await;
        return Ok(());
    };
    let query = args.rest().trim().to_string();
    if query.is_empty() {
        say(ctx, msg, "Give me a URL or something to search for.").await;
        return Ok(());
    }

    let guild_id = get_guild_id(msg)?;
    let coordinator = coordinator(ctx).await?;

    let result = with_loading_reaction(ctx, msg, async {
        let store = store(ctx).await?;
        if store.get_playlist_id(guild_id.0, &name).await?.is_none() {
            return Err(MusicError::PlaylistNotFound);
        }

        let mut tracks = coordinator.resolve(&query).await?;
        // Only a URL may add several tracks; a search keeps its top result.
        if !ytdlp::is_url(&query) {
            tracks.truncate(1);
        }

        for track in &tracks {
            store.append_track(guild_id.0, &name, track, msg.author.id.0).await?;
        }

        Ok::<_, MusicError>(format!("Added {} track(s) to **{name}**.", tracks.len()))
    })
    .await;
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
async fn show(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let Some(name) = playlist_name(&mut args) else {
        say(ctx, msg, "Which playlist?").await;
        return Ok(());
    };
    let guild_id = get_guild_id(msg)?;
    let limit = config(ctx).await?.playlist_display_limit;

    let entries = match store(ctx).await {
        Ok(store) => store.list_tracks(guild_id.0, &name).await,
        Err(why) => Err(why),
    };

    match entries {
        Ok(entries) if !entries.is_empty() => say_lines(ctx, msg, &render::playlist_lines(&entries, limit)).await,
        Ok(_) | Err(MusicError::PlaylistNotFound) => say(ctx, msg, "Playlist not found or empty.").await,
        Err(why) => reply::<&str>(ctx, msg, Err(why)).await,
    }

    Ok(())
}

#[command]
async fn play(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let Some(name) = playlist_name(&mut args) else {
        say(ctx, msg, "Which playlist?").await;
        return Ok(());
    };
    let guild_id = get_guild_id(msg)?;
    let coordinator = coordinator(ctx).await?;

    let result = with_loading_reaction(ctx, msg, async {
        ensure_voice(ctx, msg, &coordinator).await?;

        let tracks: Vec<Track> = store(ctx)
            .await?
            .list_tracks(guild_id.0, &name)
            .await?
            .into_iter()
            .map(|entry| entry.track)
            .collect();

        if tracks.is_empty() {
            return Err(MusicError::PlaylistNotFound);
        }

        info!("Queueing playlist {name} with {} track(s) in guild {}", tracks.len(), guild_id.0);
        coordinator.enqueue_tracks_and_maybe_start(guild_id.0, tracks).await
    })
    .await;

    match result {
        Ok(queued) => {
            let message = format!("Queued playlist **{name}** with {} item(s).", queued.count);
            say(ctx, msg, with_play_error(message, &queued)).await
        }
        Err(MusicError::PlaylistNotFound) => say(ctx, msg, "Playlist not found or empty.").await,
        Err(why) => reply::<&str>(ctx, msg, Err(why)).await,
    }

    Ok(())
}

/// Saves the pending queue under `name`, overwriting any playlist already called that.
#[command]
async fn savequeue(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let Some(name) = playlist_name(&mut args) else {
        say(ctx, msg, "Give the playlist a name.").await;
        return Ok(());
    };
    let guild_id = get_guild_id(msg)?;
    let coordinator = coordinator(ctx).await?;

    let result = async {
        let store = store(ctx).await?;
        let tracks = coordinator.queued_tracks(guild_id.0).await;
        let saved = store.replace_playlist(guild_id.0, &name, msg.author.id.0, &tracks).await?;

        Ok::<_, MusicError>(format!("Saved {saved} queued track(s) to **{name}**."))
    }
    .await;
    reply(ctx, msg, result).await;

    Ok(())
}

#[command]
async fn list(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;
    let prefix = config(ctx).await?.prefix.clone();

    let playlists = match store(ctx).await {
        Ok(store) => store.list_playlists(guild_id.0).await,
        Err(why) => Err(why),
    };

    match playlists {
        Ok(playlists) if playlists.is_empty() => {
            say(ctx, msg, format!("No playlists yet. Try `{prefix}playlist create <name>`.")).await
        }
        Ok(playlists) => say_lines(ctx, msg, &render::playlist_summary_lines(&playlists)).await,
        Err(why) => reply::<&str>(ctx, msg, Err(why)).await,
    }

    Ok(())
}
