//! Playback recovery.
//!
//! Keeps the audio element in line with the authoritative snapshot and
//! handles everything the element reports back: progress, end of track,
//! errors and refused playback.  Real errors are retried a bounded number
//! of times per track; when the budget runs out the server is asked to move
//! on, once.
//!
//! ```text
//!              snapshot.paused=false           element error (real)
//!   Idle ──load──▶ Playing ◀──────────▶ Paused     Playing ──▶ Retrying ─┐
//!                    │    snapshot.paused=true                     ▲     │ backoff
//!                    │                                             └─────┘
//!                    └── play refused ──▶ AwaitingGesture ── user play ──▶ Playing
//! ```

use std::time::Duration;

use request_proto::protocol::{Command, Snapshot};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioElement, AudioEvent, PlayRejection, PlaybackError};
use crate::scheduler::{ScheduledTask, Scheduler, TimerFired, TimerKind};

/// Outgoing commands to the server.
pub type Outbox = mpsc::UnboundedSender<Command>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    AwaitingGesture,
    Retrying,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub retry_limit: u8,
    pub retry_backoff: Duration,
    pub progress_interval: Duration,
    pub volume: f64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_backoff: Duration::from_secs(1),
            progress_interval: Duration::from_secs(1),
            volume: 1.0,
        }
    }
}

pub struct PlaybackRecoveryController<A: AudioElement> {
    audio: A,
    outbox: Outbox,
    scheduler: Scheduler,
    settings: RecoverySettings,

    state: PlaybackState,
    /// Entry id and resolved URL of the loaded track.
    loaded: Option<(u64, String)>,
    /// Last paused flag from the server.
    authoritative_paused: bool,
    awaiting_gesture: bool,
    /// The element errored and has nothing playable loaded.
    needs_reload: bool,
    position: u64,

    retries_left: u8,
    retry_timer: Option<ScheduledTask>,
    /// Entry id we already asked the server to skip.
    next_requested_for: Option<u64>,

    last_progress: Option<(u64, Instant)>,

    gain: f64,
    reported_volume: Option<f64>,
}

impl<A: AudioElement> PlaybackRecoveryController<A> {
    pub fn new(audio: A, outbox: Outbox, scheduler: Scheduler, settings: RecoverySettings) -> Self {
        let retries_left = settings.retry_limit;
        Self {
            audio,
            outbox,
            scheduler,
            settings,
            state: PlaybackState::Idle,
            loaded: None,
            authoritative_paused: true,
            awaiting_gesture: false,
            needs_reload: false,
            position: 0,
            retries_left,
            retry_timer: None,
            next_requested_for: None,
            last_progress: None,
            gain: 1.0,
            reported_volume: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        if self.awaiting_gesture {
            PlaybackState::AwaitingGesture
        } else {
            self.state
        }
    }

    pub fn retries_left(&self) -> u8 {
        self.retries_left
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn volume(&self) -> f64 {
        self.settings.volume
    }

    pub fn effective_volume(&self) -> f64 {
        (self.gain * self.settings.volume).clamp(0.0, 1.0)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn loaded_url(&self) -> Option<&str> {
        self.loaded.as_ref().map(|(_, url)| url.as_str())
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }

    // ── snapshot ──────────────────────────────────────────────────────────────

    /// Reconcile with a snapshot.  `url` is the resolved URL of
    /// `snapshot.current`.  Returns true when a different track was loaded.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot, url: Option<&str>) -> bool {
        self.authoritative_paused = snapshot.paused;

        let (Some(id), Some(url)) = (snapshot.current_id(), url) else {
            if self.loaded.take().is_some() {
                debug!("recovery: queue empty, unloading");
                self.retry_timer = None;
                self.audio.stop();
            }
            self.state = PlaybackState::Idle;
            return false;
        };

        let changed = match &self.loaded {
            Some((loaded_id, loaded_url)) => *loaded_id != id || loaded_url != url,
            None => true,
        };
        if changed {
            info!("recovery: loading entry {} ({})", id, url);
            self.loaded = Some((id, url.to_string()));
            self.retries_left = self.settings.retry_limit;
            self.retry_timer = None;
            self.next_requested_for = None;
            self.needs_reload = false;
            self.last_progress = None;
            self.position = snapshot.progress;
            self.state = PlaybackState::Idle;
            self.audio.load(url, snapshot.progress);
        }

        self.reconcile_paused();
        changed
    }

    fn reconcile_paused(&mut self) {
        if self.authoritative_paused {
            if self.state != PlaybackState::Paused {
                self.retry_timer = None;
                self.audio.pause();
                self.state = PlaybackState::Paused;
            }
            return;
        }

        if self.awaiting_gesture || self.state == PlaybackState::Retrying {
            return;
        }
        if self.state != PlaybackState::Playing {
            if self.needs_reload {
                self.reload();
            }
            self.audio.play();
            self.state = PlaybackState::Playing;
        }
    }

    fn reload(&mut self) {
        if let Some((_, url)) = &self.loaded {
            debug!("recovery: reloading {} at {}s", url, self.position);
            self.audio.load(url, self.position);
            self.needs_reload = false;
        }
    }

    /// Jump to `secs`.  Not subject to retry.
    pub fn seek(&mut self, secs: u64) {
        self.position = secs;
        self.last_progress = None;
        self.audio.seek(secs);
    }

    // ── element events ────────────────────────────────────────────────────────

    pub fn on_audio_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::Playing => {
                self.needs_reload = false;
                if self.authoritative_paused {
                    debug!("recovery: element playing while paused, pausing");
                    self.audio.pause();
                } else if !self.awaiting_gesture {
                    self.state = PlaybackState::Playing;
                }
            }
            AudioEvent::Paused => {
                if self.authoritative_paused {
                    self.state = PlaybackState::Paused;
                }
            }
            AudioEvent::TimeUpdate(pos) => self.on_time_update(pos),
            AudioEvent::Ended => {
                info!("recovery: track ended");
                self.request_next();
            }
            AudioEvent::Error(e) => self.on_error(e),
            AudioEvent::PlayRejected(PlayRejection::NotAllowed) => {
                info!("recovery: playback needs a user gesture");
                self.retry_timer = None;
                self.awaiting_gesture = true;
            }
            AudioEvent::PlayRejected(PlayRejection::Unsupported(why)) => {
                self.on_error(PlaybackError::Other(why));
            }
        }
    }

    fn on_time_update(&mut self, pos: f64) {
        if pos < 0.0 || !pos.is_finite() {
            return;
        }
        let secs = pos.floor() as u64;
        self.position = secs;
        if self.state != PlaybackState::Playing || self.authoritative_paused {
            return;
        }
        let now = Instant::now();
        let due = match self.last_progress {
            Some((last_secs, at)) => {
                last_secs != secs && now.duration_since(at) >= self.settings.progress_interval
            }
            None => true,
        };
        if due {
            self.last_progress = Some((secs, now));
            self.send(Command::Progress(secs));
        }
    }

    fn on_error(&mut self, error: PlaybackError) {
        if error.is_benign() {
            debug!("recovery: ignoring benign error: {}", error);
            return;
        }
        let Some((id, _)) = &self.loaded else {
            debug!("recovery: error with nothing loaded: {}", error);
            return;
        };
        let id = *id;
        if self.state == PlaybackState::Retrying && self.retry_timer.is_some() {
            // The pending reload already answers this failure.
            debug!("recovery: entry {} failed again before retry: {}", id, error);
            return;
        }
        self.needs_reload = true;

        if self.retries_left > 0 {
            self.retries_left -= 1;
        }
        warn!(
            "recovery: entry {} failed: {} ({} retries left)",
            id, error, self.retries_left
        );

        if self.retries_left > 0 {
            self.state = PlaybackState::Retrying;
            self.retry_timer = Some(
                self.scheduler
                    .after(self.settings.retry_backoff, TimerKind::PlaybackRetry),
            );
        } else {
            self.retry_timer = None;
            self.request_next();
        }
    }

    /// Handle a timer firing.  Returns false if it was not ours.
    pub fn on_timer(&mut self, fired: TimerFired) -> bool {
        match &self.retry_timer {
            Some(task) if task.is_source_of(fired) => {}
            _ => return false,
        }
        self.retry_timer = None;

        if self.authoritative_paused {
            debug!("recovery: retry skipped, paused");
            self.state = PlaybackState::Paused;
            return true;
        }
        self.reload();
        self.audio.play();
        self.state = PlaybackState::Playing;
        true
    }

    fn request_next(&mut self) {
        let Some((id, _)) = &self.loaded else {
            return;
        };
        let id = *id;
        if self.next_requested_for == Some(id) {
            debug!("recovery: next already requested for {}", id);
            return;
        }
        self.next_requested_for = Some(id);
        info!("recovery: requesting next after entry {}", id);
        self.send(Command::Next(id));
    }

    // ── user actions ──────────────────────────────────────────────────────────

    /// Explicit play from the user.  Clears the gesture gate.
    pub fn user_play(&mut self) {
        self.awaiting_gesture = false;
        if self.authoritative_paused {
            self.send(Command::Paused(false));
            return;
        }
        if self.loaded.is_some() {
            if self.needs_reload {
                self.reload();
            }
            self.retry_timer = None;
            self.audio.play();
            self.state = PlaybackState::Playing;
        }
    }

    /// Ask the server to flip the paused flag.
    pub fn toggle_pause(&mut self) {
        let paused = !self.authoritative_paused;
        if !paused {
            self.awaiting_gesture = false;
        }
        self.send(Command::Paused(paused));
    }

    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain.clamp(0.0, 1.0);
        self.apply_volume();
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.settings.volume = volume.clamp(0.0, 1.0);
        self.apply_volume();
    }

    fn apply_volume(&mut self) {
        let effective = self.effective_volume();
        self.audio.set_volume(effective);
        let pct = (effective * 100.0).round();
        if self.reported_volume != Some(pct) {
            self.reported_volume = Some(pct);
            self.send(Command::VolumeReport(pct));
        }
    }

    pub fn teardown(&mut self) {
        self.retry_timer = None;
        if self.loaded.take().is_some() {
            self.audio.stop();
        }
        self.state = PlaybackState::Idle;
    }

    fn send(&self, command: Command) {
        debug!("recovery: -> {}", command.name());
        if self.outbox.send(command).is_err() {
            debug!("recovery: outbox closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{Call, RecordingAudio};
    use crate::scheduler::testing::{next_timer, scheduler};
    use request_proto::protocol::{Song, Track};

    fn track(id: u64, file: &str) -> Track {
        Track {
            id,
            music: Song {
                id: file.to_string(),
                filename: file.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn snapshot(current: Option<Track>, paused: bool) -> Snapshot {
        Snapshot {
            paused,
            current,
            ..Default::default()
        }
    }

    struct Rig {
        ctl: PlaybackRecoveryController<RecordingAudio>,
        audio: RecordingAudio,
        sent: mpsc::UnboundedReceiver<Command>,
        timers: mpsc::Receiver<crate::core::CoreEvent>,
    }

    fn rig() -> Rig {
        let audio = RecordingAudio::default();
        let (out_tx, sent) = mpsc::unbounded_channel();
        let (sched, timers) = scheduler();
        let ctl = PlaybackRecoveryController::new(
            audio.clone(),
            out_tx,
            sched,
            RecoverySettings::default(),
        );
        Rig {
            ctl,
            audio,
            sent,
            timers,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    fn real_error() -> AudioEvent {
        AudioEvent::Error(PlaybackError::Network("connection reset".into()))
    }

    #[tokio::test]
    async fn test_load_and_follow_paused_flag() {
        let mut r = rig();
        let t = track(1, "a.mp3");
        assert!(r.ctl.apply_snapshot(&snapshot(Some(t.clone()), false), Some("u/a")));
        assert_eq!(r.audio.calls(), vec![Call::Load("u/a".into(), 0), Call::Play]);
        assert_eq!(r.ctl.state(), PlaybackState::Playing);

        r.audio.clear();
        assert!(!r.ctl.apply_snapshot(&snapshot(Some(t.clone()), true), Some("u/a")));
        assert_eq!(r.audio.calls(), vec![Call::Pause]);
        assert_eq!(r.ctl.state(), PlaybackState::Paused);

        r.audio.clear();
        r.ctl.apply_snapshot(&snapshot(Some(t), true), Some("u/a"));
        assert!(r.audio.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_real_errors_skip_once() {
        let mut r = rig();
        let t = track(7, "a.mp3");
        r.ctl.apply_snapshot(&snapshot(Some(t.clone()), false), Some("u/a"));

        r.ctl.on_audio_event(real_error());
        assert_eq!(r.ctl.retries_left(), 2);
        assert_eq!(r.ctl.state(), PlaybackState::Retrying);
        let fired = next_timer(&mut r.timers).await;
        assert!(r.ctl.on_timer(fired));

        r.ctl.on_audio_event(real_error());
        assert_eq!(r.ctl.retries_left(), 1);
        let fired = next_timer(&mut r.timers).await;
        assert!(r.ctl.on_timer(fired));

        r.ctl.on_audio_event(real_error());
        assert_eq!(r.ctl.retries_left(), 0);
        r.ctl.on_audio_event(real_error());
        r.ctl.on_audio_event(AudioEvent::Ended);

        let nexts: Vec<_> = drain(&mut r.sent)
            .into_iter()
            .filter(|c| matches!(c, Command::Next(_)))
            .collect();
        assert_eq!(nexts, vec![Command::Next(7)]);
        // Two retries reloaded the source at the last position.
        assert_eq!(r.audio.count(|c| matches!(c, Call::Load(..))), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_during_backoff_share_one_retry() {
        let mut r = rig();
        let t = track(4, "a.mp3");
        r.ctl.apply_snapshot(&snapshot(Some(t), false), Some("u/a"));
        r.audio.clear();

        r.ctl.on_audio_event(real_error());
        r.ctl.on_audio_event(real_error());
        r.ctl.on_audio_event(real_error());
        assert_eq!(r.ctl.retries_left(), 2);
        assert_eq!(r.ctl.state(), PlaybackState::Retrying);

        let fired = next_timer(&mut r.timers).await;
        assert!(r.ctl.on_timer(fired));
        assert_eq!(r.audio.count(|c| matches!(c, Call::Load(..))), 1);
        assert!(drain(&mut r.sent)
            .iter()
            .all(|c| !matches!(c, Command::Next(_))));

        // Once the reload is under way a new failure counts again.
        r.ctl.on_audio_event(real_error());
        assert_eq!(r.ctl.retries_left(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_while_paused() {
        let mut r = rig();
        let t = track(3, "a.mp3");
        r.ctl.apply_snapshot(&snapshot(Some(t.clone()), false), Some("u/a"));
        r.ctl.on_audio_event(real_error());
        r.ctl.apply_snapshot(&snapshot(Some(t.clone()), true), Some("u/a"));
        assert_eq!(r.ctl.state(), PlaybackState::Paused);

        r.audio.clear();
        r.ctl.apply_snapshot(&snapshot(Some(t), false), Some("u/a"));
        assert_eq!(r.audio.calls(), vec![Call::Load("u/a".into(), 0), Call::Play]);
    }

    #[tokio::test]
    async fn test_benign_errors_cost_nothing() {
        let mut r = rig();
        r.ctl.apply_snapshot(&snapshot(Some(track(1, "a")), false), Some("u/a"));
        r.ctl.on_audio_event(AudioEvent::Error(PlaybackError::Interrupted));
        r.ctl.on_audio_event(AudioEvent::Error(PlaybackError::EmptySource));
        assert_eq!(r.ctl.retries_left(), 3);
        assert_eq!(r.ctl.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_track_resets_budget() {
        let mut r = rig();
        r.ctl.apply_snapshot(&snapshot(Some(track(1, "a")), false), Some("u/a"));
        r.ctl.on_audio_event(real_error());
        r.ctl.on_audio_event(real_error());
        assert_eq!(r.ctl.retries_left(), 1);

        r.ctl.apply_snapshot(&snapshot(Some(track(2, "b")), false), Some("u/b"));
        assert_eq!(r.ctl.retries_left(), 3);
        assert_eq!(r.ctl.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_gesture_gate_is_sticky() {
        let mut r = rig();
        let t = track(1, "a");
        r.ctl.apply_snapshot(&snapshot(Some(t.clone()), false), Some("u/a"));
        r.ctl
            .on_audio_event(AudioEvent::PlayRejected(PlayRejection::NotAllowed));
        assert_eq!(r.ctl.state(), PlaybackState::AwaitingGesture);

        r.audio.clear();
        r.ctl.apply_snapshot(&snapshot(Some(t.clone()), false), Some("u/a"));
        r.ctl.on_audio_event(AudioEvent::Playing);
        assert_eq!(r.ctl.state(), PlaybackState::AwaitingGesture);
        assert!(r.audio.calls().is_empty());

        r.ctl.user_play();
        assert_eq!(r.ctl.state(), PlaybackState::Playing);
        assert_eq!(r.audio.calls(), vec![Call::Play]);
    }

    #[tokio::test]
    async fn test_user_play_while_paused_asks_server() {
        let mut r = rig();
        r.ctl.apply_snapshot(&snapshot(Some(track(1, "a")), true), Some("u/a"));
        drain(&mut r.sent);
        r.ctl.user_play();
        assert_eq!(drain(&mut r.sent), vec![Command::Paused(false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_throttled_to_interval() {
        let mut r = rig();
        r.ctl.apply_snapshot(&snapshot(Some(track(1, "a")), false), Some("u/a"));
        r.ctl.on_audio_event(AudioEvent::TimeUpdate(0.2));
        r.ctl.on_audio_event(AudioEvent::TimeUpdate(0.9));
        tokio::time::advance(Duration::from_millis(400)).await;
        r.ctl.on_audio_event(AudioEvent::TimeUpdate(1.1));
        tokio::time::advance(Duration::from_millis(700)).await;
        r.ctl.on_audio_event(AudioEvent::TimeUpdate(1.5));
        r.ctl.on_audio_event(AudioEvent::TimeUpdate(2.0));
        assert_eq!(
            drain(&mut r.sent),
            vec![Command::Progress(0), Command::Progress(1)]
        );
    }

    #[tokio::test]
    async fn test_gain_and_volume_report() {
        let mut r = rig();
        r.ctl.set_volume(0.5);
        r.ctl.set_gain(0.5);
        r.ctl.set_gain(0.5);
        assert_eq!(r.ctl.effective_volume(), 0.25);
        assert_eq!(
            drain(&mut r.sent),
            vec![Command::VolumeReport(50.0), Command::VolumeReport(25.0)]
        );
        assert_eq!(r.audio.calls().last(), Some(&Call::Volume(0.25)));
    }

    #[tokio::test]
    async fn test_empty_queue_and_teardown_stop_element() {
        let mut r = rig();
        r.ctl.apply_snapshot(&snapshot(Some(track(1, "a")), false), Some("u/a"));
        r.audio.clear();
        r.ctl.apply_snapshot(&snapshot(None, false), None);
        assert_eq!(r.audio.calls(), vec![Call::Stop]);
        assert_eq!(r.ctl.state(), PlaybackState::Idle);

        r.ctl.apply_snapshot(&snapshot(Some(track(2, "b")), false), Some("u/b"));
        r.audio.clear();
        r.ctl.teardown();
        assert_eq!(r.audio.calls(), vec![Call::Stop]);
    }
}
