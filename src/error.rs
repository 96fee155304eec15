use thiserror::Error;

pub type MusicResult<T> = Result<T, MusicError>;

#[derive(Error, Debug)]
pub enum MusicError {
    #[error("Join a voice channel first.")]
    NotInVoiceChannel,

    #[error("Not connected.")]
    NotConnected,

    #[error("Nothing is playing.")]
    NothingPlaying,

    #[error("No results.")]
    ResolutionFailed,

    #[error("Playlist not found.")]
    PlaylistNotFound,

    #[error("A playlist with that name already exists.")]
    PlaylistAlreadyExists,

    #[error("Playlists are unavailable right now.")]
    StoreUnavailable,

    #[error("Audio engine error: {0}")]
    Engine(String),

    #[error("Playlist store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl MusicError {
    pub fn engine(why: impl std::fmt::Display) -> Self {
        MusicError::Engine(why.to_string())
    }
}
