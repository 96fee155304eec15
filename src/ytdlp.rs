use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{MusicError, MusicResult};
use crate::models::{Track, UNKNOWN_TRACK_TITLE};

/// One line of `yt-dlp -j --flat-playlist` output. Only the fields we use.
#[derive(Deserialize)]
struct FlatPlaylistEntry {
    url: Option<String>,
    webpage_url: Option<String>,
    title: Option<String>,
    /// Seconds, sometimes fractional.
    duration: Option<f64>,
}

pub fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://")
}

pub fn is_playlist_url(query: &str) -> bool {
    is_url(query) && (query.contains("&list=") || query.contains("?list="))
}

/// Expands a playlist URL into its member tracks, in playlist order.
pub async fn expand_playlist(ytdlp_path: &str, url: &str) -> MusicResult<Vec<Track>> {
    info!("Getting songs from playlist {url}");

    let output = Command::new(ytdlp_path)
        .arg("-j")
        .arg("--flat-playlist")
        .arg(url)
        .output()
        .await
        .map_err(|why| MusicError::engine(format!("{ytdlp_path} failed to start: {why}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() && stdout.trim().is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("{ytdlp_path} failed for {url}: {}", stderr.trim());

        return Ok(Vec::new());
    }

    Ok(parse_flat_playlist(&stdout))
}

pub fn parse_flat_playlist(output: &str) -> Vec<Track> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let tracks: Vec<Track> = lines
        .iter()
        .filter_map(|line| {
            let entry: FlatPlaylistEntry = serde_json::from_str(line).ok()?;
            let play_ref = entry.webpage_url.or(entry.url)?;

            let duration = entry
                .duration
                .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());

            Some(Track {
                title: entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
                play_ref,
                duration,
            })
        })
        .collect();

    if tracks.len() < lines.len() {
        warn!("{} playlist entries skipped due to errors during parsing", lines.len() - tracks.len());
    }

    tracks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_urls_and_playlists() {
        assert!(is_url("https://youtu.be/abc"));
        assert!(!is_url("never gonna give you up"));
        assert!(is_playlist_url("https://www.youtube.com/watch?v=abc&list=PL123"));
        assert!(is_playlist_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=abc"));
        assert!(!is_playlist_url("songs ?list= not a url"));
    }

    #[test]
    fn parses_flat_playlist_lines_in_order() {
        let output = concat!(
            r#"{"_type": "url", "id": "a1", "url": "https://www.youtube.com/watch?v=a1", "title": "First", "duration": 180.0}"#,
            "\n",
            r#"{"_type": "url", "id": "b2", "url": "https://www.youtube.com/watch?v=b2", "title": "Second", "duration": 270}"#,
            "\n",
        );

        let tracks = parse_flat_playlist(output);

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].title, "First");
        assert_eq!(tracks[0].play_ref, "https://www.youtube.com/watch?v=a1");
        assert_eq!(tracks[0].duration, Some(Duration::from_secs(180)));
        assert_eq!(tracks[1].duration_ms(), Some(270_000));
    }

    #[test]
    fn skips_broken_lines_and_fills_missing_fields() {
        let output = concat!(
            "not json\n",
            r#"{"url": "https://example.com/x"}"#,
            "\n",
            r#"{"title": "no url"}"#,
        );

        let tracks = parse_flat_playlist(output);

        assert_eq!(tracks, vec![Track::new(UNKNOWN_TRACK_TITLE, "https://example.com/x", None)]);
    }

    #[test]
    fn out_of_range_durations_are_unknown() {
        let output = concat!(
            r#"{"url": "https://example.com/huge", "title": "Huge", "duration": 1e30}"#,
            "\n",
            r#"{"url": "https://example.com/negative", "title": "Negative", "duration": -3.0}"#,
        );

        let tracks = parse_flat_playlist(output);

        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|track| track.duration.is_none()));
    }
}
