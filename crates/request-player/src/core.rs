/// PlayerCore: single-owner event loop for all playback state.
///
/// Every task that learns something (push channel, mpv reader, key reader,
/// loudness measurements, timers) posts a `CoreEvent`; the core applies them
/// strictly in arrival order.  It owns the snapshot mirror and every engine
/// component, and nothing else touches them.
///
/// After each event the core publishes a `PlayerView` on a watch channel for
/// the terminal surface.
use std::sync::Arc;

use request_proto::config::Config;
use request_proto::protocol::{Command, Frame, Snapshot, Track};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::audio::{AudioElement, AudioEvent};
use crate::channel::FileEndpoint;
use crate::loudness::{gain_for_loudness, LoudnessError, LoudnessNormalizer, LoudnessSource};
use crate::notifications::{NotificationQueue, Severity};
use crate::recovery::{Outbox, PlaybackRecoveryController, PlaybackState, RecoverySettings};
use crate::scheduler::{Scheduler, TimerFired};
use crate::suppression::QueueView;

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A frame from the push channel.
    Frame(Frame),
    ChannelUp,
    ChannelDown,
    /// Something the audio element reported.
    Audio(AudioEvent),
    Timer(TimerFired),
    LoudnessMeasured {
        url: String,
        result: Result<f64, LoudnessError>,
    },
    User(UserAction),
    Shutdown,
}

/// Keyboard-level intents from the terminal surface.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    Play,
    TogglePause,
    VolumeUp,
    VolumeDown,
    MoveToTop(u64),
    MoveToEnd(u64),
    MoveDown(u64),
    Cancel(u64),
    ToggleFallback(u64),
}

const VOLUME_STEP: f64 = 0.05;

// ── PlayerView ────────────────────────────────────────────────────────────────

/// What the banner line shows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BannerLine {
    pub text: String,
    /// `None` for the idle banner.
    pub severity: Option<Severity>,
    /// The line is being replaced.
    pub fading: bool,
}

/// Render model published after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerView {
    pub connected: bool,
    pub current: Option<Track>,
    pub paused: bool,
    pub position: u64,
    pub state: PlaybackState,
    pub loudness_db: Option<f64>,
    pub target_db: f64,
    pub gain: f64,
    pub volume: f64,
    pub banner: BannerLine,
    pub queue: Vec<Track>,
    pub reordering: bool,
}

impl Default for PlayerView {
    fn default() -> Self {
        Self {
            connected: false,
            current: None,
            paused: true,
            position: 0,
            state: PlaybackState::Idle,
            loudness_db: None,
            target_db: request_proto::protocol::DEFAULT_TARGET_DB,
            gain: 1.0,
            volume: 1.0,
            banner: BannerLine::default(),
            queue: Vec::new(),
            reordering: false,
        }
    }
}

// ── PlayerCore ────────────────────────────────────────────────────────────────

pub struct PlayerCore<A: AudioElement> {
    snapshot: Snapshot,
    files: FileEndpoint,
    view: QueueView,
    banner: NotificationQueue,
    playback: PlaybackRecoveryController<A>,
    loudness: LoudnessNormalizer,
    outbox: Outbox,
    idle_rotate: std::time::Duration,
    connected: bool,
    /// URL the current gain was computed for.
    gain_url: Option<String>,
    loudness_db: Option<f64>,
    view_tx: watch::Sender<PlayerView>,
}

impl<A: AudioElement> PlayerCore<A> {
    pub fn new(
        config: &Config,
        audio: A,
        loudness_source: Arc<dyn LoudnessSource>,
        event_tx: mpsc::Sender<CoreEvent>,
        outbox: Outbox,
    ) -> anyhow::Result<Self> {
        let files = FileEndpoint::new(&config.server.file_base_url)?;
        let scheduler = Scheduler::new(event_tx.clone());
        let settings = RecoverySettings {
            retry_limit: config.playback.retry_limit,
            retry_backoff: config.playback.retry_backoff(),
            progress_interval: config.playback.progress_interval(),
            volume: config.playback.volume.clamp(0.0, 1.0),
        };
        let playback =
            PlaybackRecoveryController::new(audio, outbox.clone(), scheduler.clone(), settings);
        let loudness = LoudnessNormalizer::new(
            loudness_source,
            event_tx,
            config.playback.fallback_loudness_db,
        );
        let (view_tx, _) = watch::channel(PlayerView::default());

        Ok(Self {
            snapshot: Snapshot::default(),
            files,
            view: QueueView::new(config.queue.suppression()),
            banner: NotificationQueue::new(scheduler, config.banner.crossfade()),
            playback,
            loudness,
            outbox,
            idle_rotate: config.banner.idle_rotate(),
            connected: false,
            gain_url: None,
            loudness_db: None,
            view_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerView> {
        self.view_tx.subscribe()
    }

    pub fn queue(&self) -> &QueueView {
        &self.view
    }

    pub fn banner(&self) -> &NotificationQueue {
        &self.banner
    }

    pub fn playback(&self) -> &PlaybackRecoveryController<A> {
        &self.playback
    }

    pub fn loudness(&self) -> &LoudnessNormalizer {
        &self.loudness
    }

    /// Start periodic work.  Called once by `run`.
    pub fn start(&mut self) {
        self.banner.start_idle_rotation(self.idle_rotate);
        self.playback.set_volume(self.playback.volume());
        self.publish();
    }

    /// Run the event loop until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("PlayerCore: starting event loop");
        self.start();

        loop {
            match event_rx.recv().await {
                None => {
                    info!("PlayerCore: event channel closed, shutting down");
                    break;
                }
                Some(CoreEvent::Shutdown) => {
                    info!("PlayerCore: shutdown requested");
                    break;
                }
                Some(event) => self.handle(event),
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Apply one event.
    pub fn handle(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Frame(frame) => self.on_frame(frame),
            CoreEvent::ChannelUp => {
                self.connected = true;
                self.send(Command::Status);
            }
            CoreEvent::ChannelDown => {
                self.connected = false;
            }
            CoreEvent::Audio(evt) => self.playback.on_audio_event(evt),
            CoreEvent::Timer(fired) => {
                if !self.playback.on_timer(fired) && !self.banner.on_timer(fired) {
                    debug!("PlayerCore: stale timer {:?}", fired);
                }
            }
            CoreEvent::LoudnessMeasured { url, result } => self.on_measured(url, result),
            CoreEvent::User(action) => self.on_user(action),
            CoreEvent::Shutdown => self.cleanup(),
        }
        self.publish();
    }

    // ── frames ────────────────────────────────────────────────────────────────

    fn on_frame(&mut self, frame: Frame) {
        let Frame { command, status } = frame;
        self.apply_snapshot(status);
        if let Some(cmd) = command {
            self.on_command(cmd);
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let url = snapshot
            .current
            .as_ref()
            .map(|t| self.files.url_for(t.filename()));
        let target_changed =
            snapshot.config.target_loudness_db != self.snapshot.config.target_loudness_db;
        let url_changed = url != self.gain_url;
        self.snapshot = snapshot;

        // Gain first, so a new track starts at its normalized level when the
        // figure is already known.
        if url_changed || target_changed {
            self.gain_url = url.clone();
            self.refresh_gain();
        }
        self.view.apply_snapshot(&self.snapshot);
        self.playback.apply_snapshot(&self.snapshot, url.as_deref());
        self.preload();
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::ShowEvent(event) => self.banner.push(event),
            Command::Seek(secs) => self.playback.seek(secs),
            other => debug!("PlayerCore: command {} carried by snapshot", other.name()),
        }
    }

    // ── loudness ──────────────────────────────────────────────────────────────

    fn refresh_gain(&mut self) {
        let Some(url) = self.gain_url.clone() else {
            self.loudness_db = None;
            return;
        };
        let decibel = self.snapshot.current.as_ref().and_then(|t| t.decibel());
        match self.loudness.resolve(&url, decibel) {
            Some(db) => self.set_loudness(db),
            None => {
                // Keep the previous gain until the measurement lands.
                debug!("PlayerCore: loudness pending for {}", url);
                self.loudness_db = None;
            }
        }
    }

    fn set_loudness(&mut self, db: f64) {
        let target = self.snapshot.config.target_loudness_db;
        let gain = gain_for_loudness(db, target);
        debug!(
            "PlayerCore: loudness {} dB, target {} dB, gain {:.4}",
            db, target, gain
        );
        self.loudness_db = Some(db);
        self.playback.set_gain(gain);
    }

    fn on_measured(&mut self, url: String, result: Result<f64, LoudnessError>) {
        let db = self.loudness.on_measured(&url, result);
        if self.gain_url.as_deref() == Some(url.as_str()) {
            self.set_loudness(db);
        }
    }

    fn preload(&mut self) {
        let items: Vec<(String, Option<f64>)> = self
            .snapshot
            .playlist
            .iter()
            .map(|t| (t.filename(), t.decibel()))
            .chain(
                self.snapshot
                    .cached_songs
                    .iter()
                    .map(|s| (s.filename.as_str(), s.decibel)),
            )
            .map(|(file, db)| (self.files.url_for(file), db))
            .collect();
        self.loudness
            .preload(items.iter().map(|(url, db)| (url.as_str(), *db)));
    }

    // ── user ──────────────────────────────────────────────────────────────────

    fn on_user(&mut self, action: UserAction) {
        debug!("PlayerCore: user {:?}", action);
        let cmd = match action {
            UserAction::Play => {
                self.playback.user_play();
                None
            }
            UserAction::TogglePause => {
                self.playback.toggle_pause();
                None
            }
            UserAction::VolumeUp => {
                self.playback.set_volume(self.playback.volume() + VOLUME_STEP);
                None
            }
            UserAction::VolumeDown => {
                self.playback.set_volume(self.playback.volume() - VOLUME_STEP);
                None
            }
            UserAction::MoveToTop(id) => self.view.move_to_top(id),
            UserAction::MoveToEnd(id) => self.view.move_to_end(id),
            UserAction::MoveDown(id) => self.view.move_down(id),
            UserAction::Cancel(id) => self.view.cancel(id),
            UserAction::ToggleFallback(id) => self.view.toggle_fallback(id),
        };
        if let Some(cmd) = cmd {
            self.send(cmd);
        }
    }

    fn send(&self, cmd: Command) {
        if self.outbox.send(cmd).is_err() {
            debug!("PlayerCore: outbox closed");
        }
    }

    // ── view ──────────────────────────────────────────────────────────────────

    pub fn render_model(&self) -> PlayerView {
        let banner = match self.banner.head() {
            Some(head) => BannerLine {
                text: head.text.clone(),
                severity: Some(head.severity),
                fading: self.banner.is_replacing(),
            },
            None => BannerLine {
                text: self.banner.idle_text(&self.snapshot),
                severity: None,
                fading: false,
            },
        };
        PlayerView {
            connected: self.connected,
            current: self.view.current().cloned(),
            paused: self.view.paused(),
            position: self.playback.position(),
            state: self.playback.state(),
            loudness_db: self.loudness_db,
            target_db: self.snapshot.config.target_loudness_db,
            gain: self.playback.gain(),
            volume: self.playback.volume(),
            banner,
            queue: self.view.order().to_vec(),
            reordering: self.view.is_suppressed(),
        }
    }

    fn publish(&self) {
        let view = self.render_model();
        self.view_tx.send_if_modified(|old| {
            if *old == view {
                false
            } else {
                *old = view;
                true
            }
        });
    }

    fn cleanup(&mut self) {
        info!("PlayerCore: cleaning up");
        self.playback.teardown();
        self.loudness.teardown();
        self.banner.clear();
    }
}
