use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::engine::{AudioEngine, TrackEnded, VoiceConnector};
use crate::error::{MusicError, MusicResult};
use crate::models::{EnqueueResult, PlayTicket, SessionState, Track};
use crate::queue::QueueSnapshot;
use crate::registry::{GuildState, QueueRegistry};
use crate::render;

/// Drives playback for every guild.
///
/// Each operation looks the guild up in the registry and holds that guild's lock
/// for its whole duration, engine calls included. Commands and track-end
/// notifications for one guild therefore run one at a time, while different
/// guilds never wait on each other.
pub struct PlaybackCoordinator<E, V> {
    registry: Arc<QueueRegistry>,
    engine: E,
    voice: V,
}

impl<E: AudioEngine, V: VoiceConnector> PlaybackCoordinator<E, V> {
    pub fn new(registry: Arc<QueueRegistry>, engine: E, voice: V) -> Self {
        PlaybackCoordinator { registry, engine, voice }
    }

    /// Resolves without touching any queue. Zero matches is `ResolutionFailed`.
    pub async fn resolve(&self, query: &str) -> MusicResult<Vec<Track>> {
        let tracks = self.engine.resolve(query).await?;

        if tracks.is_empty() {
            info!("No tracks resolved for {query}");
            return Err(MusicError::ResolutionFailed);
        }

        Ok(tracks)
    }

    pub async fn join(&self, guild_id: u64, channel_id: u64) -> MusicResult<()> {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        if !guild.session.is_connected() || !self.voice.is_connected(guild_id).await {
            info!("Joining channel {channel_id} in guild {guild_id}");
            self.voice.connect(guild_id, channel_id).await?;
        }

        guild.session.connected();

        Ok(())
    }

    pub async fn leave(&self, guild_id: u64) -> MusicResult<()> {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        if !self.voice.is_connected(guild_id).await {
            guild.session.disconnected();
            return Err(MusicError::NotConnected);
        }

        guild.queue.clear();
        if let Err(why) = self.engine.stop(guild_id).await {
            warn!("Stopping guild {guild_id} before leaving failed: {why}");
        }
        guild.session.disconnected();

        self.voice.disconnect(guild_id).await
    }

    /// Resolves `query`, queues every result and starts playback if the session is idle.
    pub async fn enqueue_and_maybe_start(&self, guild_id: u64, query: &str, requester: u64) -> MusicResult<EnqueueResult> {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        self.ensure_connected(guild_id, &mut guild).await?;

        let tracks = self.resolve(query).await?;
        info!("User {requester} queued {} track(s) in guild {guild_id}", tracks.len());

        self.enqueue_locked(&mut guild, tracks).await
    }

    /// Same as [`Self::enqueue_and_maybe_start`] for tracks that are already resolved.
    pub async fn enqueue_tracks_and_maybe_start(&self, guild_id: u64, tracks: Vec<Track>) -> MusicResult<EnqueueResult> {
        if tracks.is_empty() {
            return Err(MusicError::ResolutionFailed);
        }

        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        self.ensure_connected(guild_id, &mut guild).await?;

        self.enqueue_locked(&mut guild, tracks).await
    }

    /// Handles the engine's completion notification for the track played under `ticket`.
    ///
    /// Notifications for anything but the current ticket are dropped, which covers
    /// redelivered events and events for tracks that `stop` already discarded.
    pub async fn on_track_ended(&self, guild_id: u64, ticket: PlayTicket) -> MusicResult<Option<Track>> {
        let Some(handle) = self.registry.get(guild_id).await else {
            return Ok(None);
        };
        let mut guild = handle.lock().await;

        if !guild.session.is_current(ticket) {
            debug!("Ignoring stale end of {ticket:?} in guild {guild_id}");
            return Ok(None);
        }

        guild.session.finish();

        self.advance(&mut guild).await
    }

    /// Stops the current track. The queue advances through the resulting track-end notification.
    pub async fn skip(&self, guild_id: u64) -> MusicResult<()> {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        self.ensure_connected(guild_id, &mut guild).await?;

        if guild.queue.is_empty() {
            info!("Skipping the last track in guild {guild_id}");
        } else {
            info!("Skipping in guild {guild_id}, {} track(s) pending", guild.queue.len());
        }
        self.engine.stop(guild_id).await
    }

    pub async fn pause(&self, guild_id: u64) -> MusicResult<()> {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        self.ensure_connected(guild_id, &mut guild).await?;

        match guild.session.state() {
            SessionState::Playing => {
                self.engine.pause(guild_id).await?;
                guild.session.paused();
                Ok(())
            }
            SessionState::Paused => Ok(()),
            _ => Err(MusicError::NothingPlaying),
        }
    }

    pub async fn resume(&self, guild_id: u64) -> MusicResult<()> {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        self.ensure_connected(guild_id, &mut guild).await?;

        match guild.session.state() {
            SessionState::Paused => {
                self.engine.resume(guild_id).await?;
                guild.session.resumed();
                Ok(())
            }
            SessionState::Playing => Ok(()),
            _ => Err(MusicError::NothingPlaying),
        }
    }

    /// Clears the queue and stops playback. Never fails.
    pub async fn stop(&self, guild_id: u64) {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        guild.queue.clear();

        if guild.session.is_connected() {
            if let Err(why) = self.engine.stop(guild_id).await {
                warn!("Engine stop failed in guild {guild_id}: {why}");
            }
        }

        guild.session.finish();
        info!("Stopped and cleared guild {guild_id}");
    }

    /// The bot was removed from voice by something other than `leave`.
    pub async fn on_voice_disconnected(&self, guild_id: u64) {
        if let Some(handle) = self.registry.get(guild_id).await {
            let mut guild = handle.lock().await;

            guild.queue.clear();
            guild.session.disconnected();
            if let Err(why) = self.engine.stop(guild_id).await {
                warn!("Releasing the track of guild {guild_id} failed: {why}");
            }
            info!("Guild {guild_id} lost its voice connection, queue cleared");
        }
    }

    pub async fn render_queue(&self, guild_id: u64, limit: usize) -> Vec<String> {
        render::queue_lines(&self.snapshot(guild_id, limit).await)
    }

    pub async fn snapshot(&self, guild_id: u64, limit: usize) -> QueueSnapshot {
        let handle = self.registry.get_or_create(guild_id).await;
        let guild = handle.lock().await;

        guild.queue.snapshot(limit)
    }

    pub async fn queued_tracks(&self, guild_id: u64) -> Vec<Track> {
        let handle = self.registry.get_or_create(guild_id).await;
        let guild = handle.lock().await;

        guild.queue.tracks()
    }

    /// Shuffles pending tracks, returning how many were shuffled.
    pub async fn shuffle(&self, guild_id: u64) -> usize {
        let handle = self.registry.get_or_create(guild_id).await;
        let mut guild = handle.lock().await;

        guild.queue.shuffle();
        guild.queue.len()
    }

    pub async fn now_playing(&self, guild_id: u64) -> Option<Track> {
        let handle = self.registry.get(guild_id).await?;
        let guild = handle.lock().await;

        guild.session.now_playing().cloned()
    }

    pub async fn session_state(&self, guild_id: u64) -> SessionState {
        match self.registry.get(guild_id).await {
            Some(handle) => handle.lock().await.session.state(),
            None => SessionState::Disconnected,
        }
    }

    async fn ensure_connected(&self, guild_id: u64, guild: &mut GuildState) -> MusicResult<()> {
        if guild.session.is_connected() && self.voice.is_connected(guild_id).await {
            return Ok(());
        }

        guild.session.disconnected();
        Err(MusicError::NotConnected)
    }

    async fn enqueue_locked(&self, guild: &mut GuildState, tracks: Vec<Track>) -> MusicResult<EnqueueResult> {
        let count = tracks.len();
        let title = match tracks.as_slice() {
            [only] => Some(only.title.clone()),
            _ => None,
        };

        for track in tracks {
            guild.queue.append(track);
        }

        let mut queued = EnqueueResult {
            count,
            title,
            started: false,
            play_error: None,
        };

        if guild.session.is_idle() {
            match self.advance(guild).await {
                Ok(started) => queued.started = started.is_some(),
                Err(MusicError::NotConnected) => return Err(MusicError::NotConnected),
                Err(why) => queued.play_error = Some(why.to_string()),
            }
        }

        Ok(queued)
    }

    /// Pops the head and plays it; an empty queue leaves the session idle.
    ///
    /// A track the engine refuses is dropped and the error returned, with the rest
    /// of the queue left untouched.
    async fn advance(&self, guild: &mut GuildState) -> MusicResult<Option<Track>> {
        let guild_id = guild.queue.guild_id();

        let Some(track) = guild.queue.pop_front() else {
            debug!("Queue of guild {guild_id} is empty");
            guild.session.finish();
            return Ok(None);
        };

        let ticket = guild.session.begin(track.clone());

        match self.engine.play(guild_id, &track, ticket).await {
            Ok(()) => {
                info!("Playing {} - {} in guild {guild_id}", track.title, track.play_ref);
                Ok(Some(track))
            }
            Err(MusicError::NotConnected) => {
                guild.queue.push_front(track);
                guild.session.disconnected();
                Err(MusicError::NotConnected)
            }
            Err(why) => {
                warn!("Could not play {} in guild {guild_id}: {why}", track.title);
                guild.session.finish();
                Err(why)
            }
        }
    }
}

/// Feeds engine completion events into the coordinator, one task per event so a
/// guild stuck behind a slow call never holds up another guild's advance.
pub async fn dispatch_track_ends<E, V>(coordinator: Arc<PlaybackCoordinator<E, V>>, mut events: UnboundedReceiver<TrackEnded>)
where
    E: AudioEngine + 'static,
    V: VoiceConnector + 'static,
{
    while let Some(event) = events.recv().await {
        let coordinator = coordinator.clone();
        let span = info_span!("track_end", guild_id = event.guild_id, ticket = event.ticket.0);

        tokio::spawn(
            async move {
                match coordinator.on_track_ended(event.guild_id, event.ticket).await {
                    Ok(Some(track)) => info!("Advanced to {}", track.title),
                    Ok(None) => debug!("Nothing advanced"),
                    Err(why) => warn!("Advance failed: {why}"),
                }
            }
            .instrument(span),
        );
    }

    info!("Track end channel closed");
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use serenity::async_trait;
    use tokio::sync::mpsc::{self, UnboundedSender};

    use super::*;

    const GUILD: u64 = 10;
    const CHANNEL: u64 = 20;
    const USER: u64 = 30;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Play(String, PlayTicket),
        Pause,
        Resume,
        Stop,
    }

    /// Records every call; `stop` reports the end of whatever was playing, like a real engine.
    #[derive(Default)]
    struct MockEngine {
        results: Mutex<HashMap<String, Vec<Track>>>,
        broken: Mutex<HashSet<String>>,
        calls: Mutex<Vec<Call>>,
        playing: Mutex<HashMap<u64, PlayTicket>>,
        ended: Option<UnboundedSender<TrackEnded>>,
        resolve_delay: Option<Duration>,
    }

    impl MockEngine {
        fn with_end_events(ended: UnboundedSender<TrackEnded>) -> Self {
            MockEngine {
                ended: Some(ended),
                ..Default::default()
            }
        }

        fn add_result(&self, query: &str, tracks: Vec<Track>) {
            self.results.lock().unwrap().insert(query.to_string(), tracks);
        }

        fn break_track(&self, track: &Track) {
            self.broken.lock().unwrap().insert(track.play_ref.clone());
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn played(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Play(title, _) => Some(title),
                    _ => None,
                })
                .collect()
        }

        fn current_ticket(&self) -> Option<PlayTicket> {
            self.playing.lock().unwrap().get(&GUILD).copied()
        }
    }

    #[async_trait]
    impl AudioEngine for MockEngine {
        async fn resolve(&self, query: &str) -> MusicResult<Vec<Track>> {
            if let Some(delay) = self.resolve_delay {
                tokio::time::sleep(delay).await;
            }

            Ok(self.results.lock().unwrap().get(query).cloned().unwrap_or_default())
        }

        async fn play(&self, guild_id: u64, track: &Track, ticket: PlayTicket) -> MusicResult<()> {
            self.calls.lock().unwrap().push(Call::Play(track.title.clone(), ticket));

            if self.broken.lock().unwrap().contains(&track.play_ref) {
                return Err(MusicError::engine("unplayable"));
            }

            self.playing.lock().unwrap().insert(guild_id, ticket);
            Ok(())
        }

        async fn pause(&self, _guild_id: u64) -> MusicResult<()> {
            self.calls.lock().unwrap().push(Call::Pause);
            Ok(())
        }

        async fn resume(&self, _guild_id: u64) -> MusicResult<()> {
            self.calls.lock().unwrap().push(Call::Resume);
            Ok(())
        }

        async fn stop(&self, guild_id: u64) -> MusicResult<()> {
            self.calls.lock().unwrap().push(Call::Stop);

            let stopped = self.playing.lock().unwrap().remove(&guild_id);
            if let (Some(ticket), Some(ended)) = (stopped, &self.ended) {
                let _ = ended.send(TrackEnded { guild_id, ticket });
            }

            Ok(())
        }
    }

    #[derive(Default)]
    struct MockVoice {
        connected: Mutex<HashSet<u64>>,
    }

    #[async_trait]
    impl VoiceConnector for MockVoice {
        async fn connect(&self, guild_id: u64, _channel_id: u64) -> MusicResult<()> {
            self.connected.lock().unwrap().insert(guild_id);
            Ok(())
        }

        async fn disconnect(&self, guild_id: u64) -> MusicResult<()> {
            self.connected.lock().unwrap().remove(&guild_id);
            Ok(())
        }

        async fn is_connected(&self, guild_id: u64) -> bool {
            self.connected.lock().unwrap().contains(&guild_id)
        }
    }

    type TestCoordinator = PlaybackCoordinator<Arc<MockEngine>, Arc<MockVoice>>;

    fn track(title: &str, seconds: u64) -> Track {
        Track::new(title, format!("https://example.com/{title}"), Some(Duration::from_secs(seconds)))
    }

    async fn connected(engine: Arc<MockEngine>) -> TestCoordinator {
        let coordinator = PlaybackCoordinator::new(Arc::new(QueueRegistry::new()), engine, Arc::new(MockVoice::default()));
        coordinator.join(GUILD, CHANNEL).await.unwrap();
        coordinator
    }

    async fn queued_titles(coordinator: &TestCoordinator) -> Vec<String> {
        coordinator.queued_tracks(GUILD).await.into_iter().map(|t| t.title).collect()
    }

    #[tokio::test]
    async fn enqueue_while_idle_plays_first_and_queues_the_rest() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("list", vec![track("A", 180), track("B", 270), track("C", 60)]);
        let coordinator = connected(engine.clone()).await;

        let result = coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();

        assert_eq!(
            result,
            EnqueueResult {
                count: 3,
                title: None,
                started: true,
                play_error: None,
            }
        );
        assert_eq!(engine.played(), vec!["A"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["B", "C"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Playing);
        assert_eq!(coordinator.now_playing(GUILD).await.map(|t| t.title), Some("A".to_string()));
    }

    #[tokio::test]
    async fn enqueue_while_playing_only_queues() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("a", vec![track("A", 180)]);
        engine.add_result("list", vec![track("B", 1), track("C", 1)]);
        let coordinator = connected(engine.clone()).await;

        coordinator.enqueue_and_maybe_start(GUILD, "a", USER).await.unwrap();
        let result = coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();

        assert!(!result.started);
        assert_eq!(result.count, 2);
        assert_eq!(engine.played(), vec!["A"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn enqueue_while_paused_does_not_play() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("a", vec![track("A", 180)]);
        engine.add_result("b", vec![track("B", 180)]);
        let coordinator = connected(engine.clone()).await;

        coordinator.enqueue_and_maybe_start(GUILD, "a", USER).await.unwrap();
        coordinator.pause(GUILD).await.unwrap();
        let result = coordinator.enqueue_and_maybe_start(GUILD, "b", USER).await.unwrap();

        assert_eq!(result.title.as_deref(), Some("B"));
        assert!(!result.started);
        assert_eq!(engine.played(), vec!["A"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Paused);
    }

    #[tokio::test]
    async fn failed_resolution_changes_nothing() {
        let engine = Arc::new(MockEngine::default());
        let coordinator = connected(engine.clone()).await;

        let result = coordinator.enqueue_and_maybe_start(GUILD, "nothing", USER).await;

        assert!(matches!(result, Err(MusicError::ResolutionFailed)));
        assert!(engine.calls().is_empty());
        assert!(coordinator.queued_tracks(GUILD).await.is_empty());
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Idle);
    }

    #[tokio::test]
    async fn enqueue_without_session_is_not_connected() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("a", vec![track("A", 1)]);
        let coordinator = PlaybackCoordinator::new(Arc::new(QueueRegistry::new()), engine.clone(), Arc::new(MockVoice::default()));

        let result = coordinator.enqueue_and_maybe_start(GUILD, "a", USER).await;

        assert!(matches!(result, Err(MusicError::NotConnected)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn track_end_pops_exactly_one_and_plays_it() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("list", vec![track("A", 1), track("B", 1), track("C", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();

        let ticket = engine.current_ticket().unwrap();
        let next = coordinator.on_track_ended(GUILD, ticket).await.unwrap();

        assert_eq!(next.map(|t| t.title), Some("B".to_string()));
        assert_eq!(engine.played(), vec!["A", "B"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["C"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Playing);
    }

    #[tokio::test]
    async fn track_end_on_empty_queue_goes_idle() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("a", vec![track("A", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "a", USER).await.unwrap();

        let ticket = engine.current_ticket().unwrap();
        let next = coordinator.on_track_ended(GUILD, ticket).await.unwrap();

        assert!(next.is_none());
        assert_eq!(engine.played(), vec!["A"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Idle);
        assert!(coordinator.now_playing(GUILD).await.is_none());
    }

    #[tokio::test]
    async fn redelivered_track_end_is_ignored() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("list", vec![track("A", 1), track("B", 1), track("C", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();
        let ticket = engine.current_ticket().unwrap();

        coordinator.on_track_ended(GUILD, ticket).await.unwrap();
        let duplicate = coordinator.on_track_ended(GUILD, ticket).await.unwrap();

        assert!(duplicate.is_none());
        assert_eq!(engine.played(), vec!["A", "B"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["C"]);
    }

    #[tokio::test]
    async fn track_end_for_unknown_guild_is_a_no_op() {
        let engine = Arc::new(MockEngine::default());
        let coordinator = connected(engine.clone()).await;

        let next = coordinator.on_track_ended(999, PlayTicket(1)).await.unwrap();

        assert!(next.is_none());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn skip_mid_track_advances_through_the_end_notification() {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine::with_end_events(ended_tx));
        engine.add_result("ab", vec![track("A", 180), track("B", 270)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "ab", USER).await.unwrap();

        coordinator.skip(GUILD).await.unwrap();
        assert_eq!(queued_titles(&coordinator).await, vec!["B"]);

        let event = ended_rx.try_recv().unwrap();
        coordinator.on_track_ended(event.guild_id, event.ticket).await.unwrap();

        assert_eq!(engine.played(), vec!["A", "B"]);
        assert!(coordinator.queued_tracks(GUILD).await.is_empty());
        assert!(coordinator.render_queue(GUILD, render::QUEUE_DISPLAY_LIMIT).await.is_empty());
    }

    #[tokio::test]
    async fn skip_without_session_is_not_connected() {
        let engine = Arc::new(MockEngine::default());
        let coordinator = PlaybackCoordinator::new(Arc::new(QueueRegistry::new()), engine.clone(), Arc::new(MockVoice::default()));

        assert!(matches!(coordinator.skip(GUILD).await, Err(MusicError::NotConnected)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn skip_end_and_duplicate_end_advance_once() {
        for _ in 0..25 {
            let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
            let engine = Arc::new(MockEngine::with_end_events(ended_tx));
            engine.add_result("abc", vec![track("A", 1), track("B", 1), track("C", 1)]);
            let coordinator = Arc::new(connected(engine.clone()).await);
            coordinator.enqueue_and_maybe_start(GUILD, "abc", USER).await.unwrap();

            coordinator.skip(GUILD).await.unwrap();
            let event = ended_rx.try_recv().unwrap();

            let deliveries: Vec<_> = (0..2)
                .map(|_| {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move { coordinator.on_track_ended(event.guild_id, event.ticket).await })
                })
                .collect();
            for delivery in deliveries {
                delivery.await.unwrap().unwrap();
            }

            assert_eq!(engine.played(), vec!["A", "B"]);
            assert_eq!(queued_titles(&coordinator).await, vec!["C"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn skip_racing_natural_end_never_skips_or_repeats_a_track() {
        for _ in 0..25 {
            let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
            let engine = Arc::new(MockEngine::with_end_events(ended_tx));
            engine.add_result("abcd", vec![track("A", 1), track("B", 1), track("C", 1), track("D", 1)]);
            let coordinator = Arc::new(connected(engine.clone()).await);
            coordinator.enqueue_and_maybe_start(GUILD, "abcd", USER).await.unwrap();
            let first = engine.current_ticket().unwrap();

            let skipper = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.skip(GUILD).await })
            };
            let natural_end = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.on_track_ended(GUILD, first).await })
            };
            skipper.await.unwrap().unwrap();
            natural_end.await.unwrap().unwrap();

            while let Ok(event) = ended_rx.try_recv() {
                coordinator.on_track_ended(event.guild_id, event.ticket).await.unwrap();
            }

            let played = engine.played();
            let queued = queued_titles(&coordinator).await;

            // Either the skip stopped A and its end event was the stale one, or A
            // ended first and the skip landed on B, which was playing by then.
            let outcome = (played.len(), queued.len());
            assert!(outcome == (2, 2) || outcome == (3, 1), "played {played:?}, queued {queued:?}");
            let seen: Vec<String> = played.into_iter().chain(queued).collect();
            assert_eq!(seen, vec!["A", "B", "C", "D"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_while_idle_start_playback_once() {
        let engine = Arc::new(MockEngine {
            resolve_delay: Some(Duration::from_millis(2)),
            ..Default::default()
        });
        for i in 0..8 {
            engine.add_result(&format!("q{i}"), vec![track(&format!("T{i}"), 1)]);
        }
        let coordinator = Arc::new(connected(engine.clone()).await);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.enqueue_and_maybe_start(GUILD, &format!("q{i}"), USER).await })
            })
            .collect();

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().started {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert_eq!(engine.played().len(), 1);
        assert_eq!(coordinator.queued_tracks(GUILD).await.len(), 7);
    }

    #[tokio::test]
    async fn stop_clears_queue_and_ignores_the_late_end_event() {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine::with_end_events(ended_tx));
        engine.add_result("list", vec![track("A", 1), track("B", 1), track("C", 1)]);
        engine.add_result("d", vec![track("D", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();

        coordinator.stop(GUILD).await;

        assert!(coordinator.render_queue(GUILD, 15).await.is_empty());
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Idle);

        coordinator.enqueue_and_maybe_start(GUILD, "d", USER).await.unwrap();
        let late = ended_rx.try_recv().unwrap();
        let next = coordinator.on_track_ended(late.guild_id, late.ticket).await.unwrap();

        assert!(next.is_none());
        assert_eq!(engine.played(), vec!["A", "D"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Playing);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let engine = Arc::new(MockEngine::default());
        let coordinator = connected(engine.clone()).await;

        coordinator.stop(GUILD).await;
        coordinator.stop(GUILD).await;
        coordinator.stop(777).await;

        assert!(coordinator.render_queue(GUILD, 15).await.is_empty());
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Idle);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_state() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("a", vec![track("A", 1)]);
        let coordinator = connected(engine.clone()).await;

        assert!(matches!(coordinator.pause(GUILD).await, Err(MusicError::NothingPlaying)));

        coordinator.enqueue_and_maybe_start(GUILD, "a", USER).await.unwrap();
        coordinator.pause(GUILD).await.unwrap();
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Paused);
        coordinator.pause(GUILD).await.unwrap();

        coordinator.resume(GUILD).await.unwrap();
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Playing);

        let calls = engine.calls();
        assert_eq!(calls.iter().filter(|call| **call == Call::Pause).count(), 1);
        assert_eq!(calls.iter().filter(|call| **call == Call::Resume).count(), 1);
        assert!(coordinator.queued_tracks(GUILD).await.is_empty());
    }

    #[tokio::test]
    async fn pause_without_session_is_not_connected() {
        let engine = Arc::new(MockEngine::default());
        let coordinator = PlaybackCoordinator::new(Arc::new(QueueRegistry::new()), engine, Arc::new(MockVoice::default()));

        assert!(matches!(coordinator.pause(GUILD).await, Err(MusicError::NotConnected)));
        assert!(matches!(coordinator.resume(GUILD).await, Err(MusicError::NotConnected)));
    }

    #[tokio::test]
    async fn refused_first_track_keeps_the_rest_queued() {
        let engine = Arc::new(MockEngine::default());
        let tracks = vec![track("A", 1), track("B", 1), track("C", 1)];
        for broken in &tracks {
            engine.break_track(broken);
        }
        engine.add_result("abc", tracks);
        let coordinator = connected(engine.clone()).await;

        let result = coordinator.enqueue_and_maybe_start(GUILD, "abc", USER).await.unwrap();

        assert_eq!(result.count, 3);
        assert!(!result.started);
        assert_eq!(result.play_error.as_deref(), Some("Audio engine error: unplayable"));
        assert_eq!(engine.played(), vec!["A"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["B", "C"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Idle);
    }

    #[tokio::test]
    async fn refused_track_on_end_surfaces_the_error_once() {
        let engine = Arc::new(MockEngine::default());
        let broken = track("B", 1);
        engine.break_track(&broken);
        engine.add_result("abc", vec![track("A", 1), broken, track("C", 1)]);
        engine.add_result("d", vec![track("D", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "abc", USER).await.unwrap();

        let ticket = engine.current_ticket().unwrap();
        let result = coordinator.on_track_ended(GUILD, ticket).await;

        assert!(matches!(result, Err(MusicError::Engine(_))));
        assert_eq!(engine.played(), vec!["A", "B"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["C"]);
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Idle);

        let queued = coordinator.enqueue_and_maybe_start(GUILD, "d", USER).await.unwrap();

        assert!(queued.started);
        assert_eq!(engine.played(), vec!["A", "B", "C"]);
        assert_eq!(queued_titles(&coordinator).await, vec!["D"]);
    }

    #[tokio::test]
    async fn leave_clears_and_disconnects() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("list", vec![track("A", 1), track("B", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();

        coordinator.leave(GUILD).await.unwrap();

        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Disconnected);
        assert!(coordinator.queued_tracks(GUILD).await.is_empty());
        assert!(matches!(coordinator.leave(GUILD).await, Err(MusicError::NotConnected)));
    }

    #[tokio::test]
    async fn losing_voice_clears_the_queue() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("list", vec![track("A", 1), track("B", 1)]);
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();
        let ticket = engine.current_ticket().unwrap();

        coordinator.on_voice_disconnected(GUILD).await;

        assert_eq!(engine.calls().last(), Some(&Call::Stop));
        assert!(engine.current_ticket().is_none());
        assert_eq!(coordinator.session_state(GUILD).await, SessionState::Disconnected);
        assert!(coordinator.queued_tracks(GUILD).await.is_empty());
        assert!(coordinator.on_track_ended(GUILD, ticket).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preresolved_tracks_start_when_idle() {
        let engine = Arc::new(MockEngine::default());
        let coordinator = connected(engine.clone()).await;

        let result = coordinator
            .enqueue_tracks_and_maybe_start(GUILD, vec![track("A", 1), track("B", 1)])
            .await
            .unwrap();

        assert!(result.started);
        assert_eq!(engine.played(), vec!["A"]);
        assert!(matches!(
            coordinator.enqueue_tracks_and_maybe_start(GUILD, vec![]).await,
            Err(MusicError::ResolutionFailed)
        ));
    }

    #[tokio::test]
    async fn shuffle_keeps_queue_length() {
        let engine = Arc::new(MockEngine::default());
        engine.add_result("list", (0..6).map(|i| track(&i.to_string(), 1)).collect());
        let coordinator = connected(engine.clone()).await;
        coordinator.enqueue_and_maybe_start(GUILD, "list", USER).await.unwrap();

        assert_eq!(coordinator.shuffle(GUILD).await, 5);
        assert_eq!(coordinator.queued_tracks(GUILD).await.len(), 5);
    }

    #[tokio::test]
    async fn dispatcher_advances_on_engine_events() {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine::with_end_events(ended_tx));
        engine.add_result("ab", vec![track("A", 1), track("B", 1)]);
        let coordinator = Arc::new(connected(engine.clone()).await);
        tokio::spawn(dispatch_track_ends(coordinator.clone(), ended_rx));

        coordinator.enqueue_and_maybe_start(GUILD, "ab", USER).await.unwrap();
        coordinator.skip(GUILD).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.played().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(engine.played(), vec!["A", "B"]);
    }
}
