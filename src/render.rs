use std::time::Duration;

use crate::models::{PlaylistEntry, PlaylistSummary};
use crate::queue::QueueSnapshot;

pub const QUEUE_DISPLAY_LIMIT: usize = 15;
pub const PLAYLIST_DISPLAY_LIMIT: usize = 25;

const UNKNOWN_DURATION: &str = "?:??";

/// `minutes:seconds`, or `?:??` when the length is unknown or zero (live streams).
pub fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(duration) if !duration.is_zero() => {
            let millis = duration.as_millis();
            let minutes = millis / 60_000;
            let seconds = (millis % 60_000) / 1000;

            format!("{minutes}:{seconds:02}")
        }
        _ => UNKNOWN_DURATION.to_string(),
    }
}

fn remainder_line(remaining: usize) -> Option<String> {
    (remaining > 0).then(|| format!("…and {remaining} more."))
}

/// One numbered line per shown track plus an "…and N more." trailer. Empty for an empty queue.
pub fn queue_lines(snapshot: &QueueSnapshot) -> Vec<String> {
    let mut lines: Vec<String> = snapshot
        .tracks
        .iter()
        .enumerate()
        .map(|(index, track)| format!("{}. {} [{}]", index + 1, track.title, format_duration(track.duration)))
        .collect();

    lines.extend(remainder_line(snapshot.remaining));

    lines
}

pub fn playlist_lines(entries: &[PlaylistEntry], limit: usize) -> Vec<String> {
    let mut lines: Vec<String> = entries
        .iter()
        .take(limit)
        .map(|entry| {
            format!(
                "{}. [{}]({}) [{}]",
                entry.position,
                entry.track.title,
                entry.track.play_ref,
                format_duration(entry.track.duration)
            )
        })
        .collect();

    lines.extend(remainder_line(entries.len().saturating_sub(limit)));

    lines
}

pub fn playlist_summary_lines(playlists: &[PlaylistSummary]) -> Vec<String> {
    playlists
        .iter()
        .map(|playlist| {
            let created_on = playlist.created_at.get(..10).unwrap_or(&playlist.created_at);
            format!("• **{}** (by <@{}>, {})", playlist.name, playlist.owner_id, created_on)
        })
        .collect()
}
