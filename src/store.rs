use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::{MusicError, MusicResult};
use crate::models::{PlaylistEntry, PlaylistSummary, Track};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS playlists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        owner_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(guild_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS playlist_tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        playlist_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        title TEXT NOT NULL,
        url TEXT NOT NULL,
        length_ms INTEGER,
        added_by INTEGER,
        added_at TEXT NOT NULL,
        FOREIGN KEY(playlist_id) REFERENCES playlists(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_playlist_tracks_position ON playlist_tracks(playlist_id, position)",
];

/// Named, per-guild track lists kept in SQLite.
pub struct PlaylistStore {
    pool: SqlitePool,
}

impl PlaylistStore {
    /// Opens (creating if missing) the database at `url` and makes sure the schema exists.
    pub async fn connect(url: &str) -> MusicResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

        info!("Playlist store opened at {url}");

        Self::with_pool(pool).await
    }

    /// A private in-memory database; a single connection that is never recycled keeps it alive.
    #[cfg(test)]
    pub async fn in_memory() -> MusicResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> MusicResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(PlaylistStore { pool })
    }

    pub async fn create_playlist(&self, guild_id: u64, name: &str, owner_id: u64) -> MusicResult<i64> {
        let mut conn = self.pool.acquire().await?;

        insert_playlist(&mut conn, guild_id, name, owner_id).await
    }

    /// Deletes the playlist and all of its tracks.
    pub async fn delete_playlist(&self, guild_id: u64, name: &str) -> MusicResult<()> {
        let mut tx = self.pool.begin().await?;

        let playlist_id = find_playlist_id(&mut tx, guild_id, name)
            .await?
            .ok_or(MusicError::PlaylistNotFound)?;
        remove_playlist(&mut tx, playlist_id).await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn get_playlist_id(&self, guild_id: u64, name: &str) -> MusicResult<Option<i64>> {
        let mut conn = self.pool.acquire().await?;

        find_playlist_id(&mut conn, guild_id, name).await
    }

    /// Appends at the end of the playlist and returns the new track's position.
    pub async fn append_track(&self, guild_id: u64, name: &str, track: &Track, added_by: u64) -> MusicResult<i64> {
        let mut conn = self.pool.acquire().await?;

        let playlist_id = find_playlist_id(&mut conn, guild_id, name)
            .await?
            .ok_or(MusicError::PlaylistNotFound)?;

        insert_track(&mut conn, playlist_id, track, added_by).await
    }

    pub async fn list_tracks(&self, guild_id: u64, name: &str) -> MusicResult<Vec<PlaylistEntry>> {
        let mut conn = self.pool.acquire().await?;

        let playlist_id = find_playlist_id(&mut conn, guild_id, name)
            .await?
            .ok_or(MusicError::PlaylistNotFound)?;

        let rows = sqlx::query(
            r#"
            SELECT position, title, url, length_ms FROM playlist_tracks
            WHERE playlist_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(playlist_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let length_ms: Option<i64> = row.get("length_ms");

                PlaylistEntry {
                    position: row.get("position"),
                    track: Track {
                        title: row.get("title"),
                        play_ref: row.get("url"),
                        duration: length_ms.and_then(|ms| u64::try_from(ms).ok()).map(Duration::from_millis),
                    },
                }
            })
            .collect())
    }

    pub async fn list_playlists(&self, guild_id: u64) -> MusicResult<Vec<PlaylistSummary>> {
        let rows = sqlx::query("SELECT name, owner_id, created_at FROM playlists WHERE guild_id = ? ORDER BY name ASC")
            .bind(guild_id as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| PlaylistSummary {
                name: row.get("name"),
                owner_id: row.get::<i64, _>("owner_id") as u64,
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Replaces the playlist (creating it if needed) with `tracks`, all in one transaction.
    pub async fn replace_playlist(&self, guild_id: u64, name: &str, owner_id: u64, tracks: &[Track]) -> MusicResult<usize> {
        let mut tx = self.pool.begin().await?;

        if let Some(playlist_id) = find_playlist_id(&mut tx, guild_id, name).await? {
            remove_playlist(&mut tx, playlist_id).await?;
        }

        let playlist_id = insert_playlist(&mut tx, guild_id, name, owner_id).await?;
        for track in tracks {
            insert_track(&mut tx, playlist_id, track, owner_id).await?;
        }

        tx.commit().await?;

        Ok(tracks.len())
    }
}

async fn find_playlist_id(conn: &mut SqliteConnection, guild_id: u64, name: &str) -> MusicResult<Option<i64>> {
    let row = sqlx::query("SELECT id FROM playlists WHERE guild_id = ? AND name = ?")
        .bind(guild_id as i64)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|row| row.get("id")))
}

async fn insert_playlist(conn: &mut SqliteConnection, guild_id: u64, name: &str, owner_id: u64) -> MusicResult<i64> {
    let result = sqlx::query("INSERT INTO playlists (guild_id, name, owner_id, created_at) VALUES (?, ?, ?, ?)")
        .bind(guild_id as i64)
        .bind(name)
        .bind(owner_id as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(why)) if why.is_unique_violation() => Err(MusicError::PlaylistAlreadyExists),
        Err(why) => Err(why.into()),
    }
}

async fn remove_playlist(conn: &mut SqliteConnection, playlist_id: i64) -> MusicResult<()> {
    sqlx::query("DELETE FROM playlist_tracks WHERE playlist_id = ?")
        .bind(playlist_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM playlists WHERE id = ?")
        .bind(playlist_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Position is computed in the insert itself so concurrent appends stay strictly increasing.
async fn insert_track(conn: &mut SqliteConnection, playlist_id: i64, track: &Track, added_by: u64) -> MusicResult<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO playlist_tracks (playlist_id, position, title, url, length_ms, added_by, added_at)
        SELECT ?, COALESCE(MAX(position), 0) + 1, ?, ?, ?, ?, ?
        FROM playlist_tracks WHERE playlist_id = ?
        RETURNING position
        "#,
    )
    .bind(playlist_id)
    .bind(&track.title)
    .bind(&track.play_ref)
    .bind(track.duration_ms().map(|ms| ms as i64))
    .bind(added_by as i64)
    .bind(Utc::now().to_rfc3339())
    .bind(playlist_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.get("position"))
}
