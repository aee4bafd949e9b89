//! End-to-end flows through `PlayerCore::handle`.
//!
//! Frames go in as the push channel would deliver them; timers and loudness
//! results that the core schedules come back out of the event channel and are
//! fed in again, so every test runs the real event path without a server,
//! mpv or the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use request_player::audio::{AudioElement, AudioEvent, PlaybackError};
use request_player::core::{CoreEvent, PlayerCore, UserAction};
use request_player::loudness::{LoudnessError, LoudnessSource};
use request_proto::config::Config;
use request_proto::protocol::{Command, Frame, NotificationEvent, Snapshot, Song, Track, UserInfo};
use tokio::sync::mpsc;

/// Audio element that only writes down what it was asked to do.
#[derive(Clone, Default)]
struct FakeAudio {
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeAudio {
    fn loads(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("load"))
            .count()
    }
}

impl AudioElement for FakeAudio {
    fn load(&mut self, url: &str, start_secs: u64) {
        self.log.lock().unwrap().push(format!("load {} {}", url, start_secs));
    }
    fn play(&mut self) {
        self.log.lock().unwrap().push("play".into());
    }
    fn pause(&mut self) {
        self.log.lock().unwrap().push("pause".into());
    }
    fn seek(&mut self, secs: u64) {
        self.log.lock().unwrap().push(format!("seek {}", secs));
    }
    fn set_volume(&mut self, volume: f64) {
        self.log.lock().unwrap().push(format!("volume {:.4}", volume));
    }
    fn stop(&mut self) {
        self.log.lock().unwrap().push("stop".into());
    }
}

/// Loudness source with canned answers that counts calls per URL.
#[derive(Default)]
struct CannedLoudness {
    answers: HashMap<String, f64>,
    calls: Mutex<HashMap<String, usize>>,
}

impl CannedLoudness {
    fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl LoudnessSource for CannedLoudness {
    fn measure(&self, url: &str) -> BoxFuture<'static, Result<f64, LoudnessError>> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let answer = self.answers.get(url).copied().ok_or(LoudnessError::Empty);
        async move { answer }.boxed()
    }
}

/// Loudness source whose measurements never finish.  Flags when the
/// pending future is dropped.
#[derive(Default)]
struct StalledLoudness {
    calls: AtomicUsize,
    dropped: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl LoudnessSource for StalledLoudness {
    fn measure(&self, _url: &str) -> BoxFuture<'static, Result<f64, LoudnessError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let guard = SetOnDrop(self.dropped.clone());
        async move {
            let _guard = guard;
            std::future::pending::<Result<f64, LoudnessError>>().await
        }
        .boxed()
    }
}

struct Harness {
    core: PlayerCore<FakeAudio>,
    audio: FakeAudio,
    loudness: Arc<CannedLoudness>,
    events: mpsc::Receiver<CoreEvent>,
    outbox: mpsc::UnboundedReceiver<Command>,
}

impl Harness {
    fn new(answers: &[(&str, f64)]) -> Self {
        let config = Config::default();
        let audio = FakeAudio::default();
        let loudness = Arc::new(CannedLoudness {
            answers: answers.iter().map(|(u, db)| (url(u), *db)).collect(),
            ..Default::default()
        });
        let (event_tx, events) = mpsc::channel(64);
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let core = PlayerCore::new(&config, audio.clone(), loudness.clone(), event_tx, outbox_tx)
            .unwrap();
        Self {
            core,
            audio,
            loudness,
            events,
            outbox,
        }
    }

    fn frame(&mut self, status: Snapshot) {
        self.core.handle(CoreEvent::Frame(Frame {
            command: None,
            status,
        }));
    }

    fn frame_with(&mut self, status: Snapshot, command: Command) {
        self.core.handle(CoreEvent::Frame(Frame {
            command: Some(command),
            status,
        }));
    }

    /// Take the next event the core scheduled for itself and apply it.
    async fn feed_back(&mut self) {
        let event = self.events.recv().await.unwrap();
        self.core.handle(event);
    }

    fn sent(&mut self) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.outbox.try_recv() {
            out.push(cmd);
        }
        out
    }
}

fn url(filename: &str) -> String {
    format!("http://127.0.0.1:8000/player/file?path={}", filename)
}

fn track(id: u64, filename: &str, decibel: Option<f64>) -> Track {
    Track {
        id,
        user: UserInfo {
            uid: 7,
            username: "alice".into(),
            ..Default::default()
        },
        music: Song {
            title: format!("song {}", id),
            filename: filename.into(),
            decibel,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn playing(current: Track, playlist: Vec<Track>) -> Snapshot {
    Snapshot {
        paused: false,
        current: Some(current),
        playlist,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_known_loudness_sets_gain_immediately() {
    let mut h = Harness::new(&[]);
    h.frame(playing(track(1, "loud.mp3", Some(-6.0)), vec![]));

    let gain = h.core.playback().gain();
    assert!((gain - 0.019953).abs() < 1e-4, "gain {}", gain);
    assert_eq!(h.core.subscribe().borrow().loudness_db, Some(-6.0));

    h.frame(playing(track(2, "quiet.mp3", Some(-50.0)), vec![]));
    assert_eq!(h.core.playback().gain(), 1.0);
    assert_eq!(h.loudness.calls_for(&url("quiet.mp3")), 0);
    assert_eq!(h.audio.loads(), 2);
}

#[tokio::test]
async fn test_unknown_loudness_measured_once() {
    let mut h = Harness::new(&[("odd.flac", -20.0)]);
    let snapshot = playing(track(1, "odd.flac", None), vec![]);

    h.frame(snapshot.clone());
    h.frame(snapshot.clone());
    assert!(h.core.subscribe().borrow().loudness_db.is_none());

    h.feed_back().await;
    h.frame(snapshot);

    assert_eq!(h.loudness.calls_for(&url("odd.flac")), 1);
    assert_eq!(h.core.loudness().cached(&url("odd.flac")), Some(-20.0));
    let gain = h.core.playback().gain();
    assert!((gain - 0.1).abs() < 1e-9, "gain {}", gain);
    assert_eq!(h.audio.loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_progress_replaces_banner() {
    let mut h = Harness::new(&[]);
    let user = UserInfo {
        uid: 42,
        username: "bob".into(),
        ..Default::default()
    };
    let idle = Snapshot::default();

    h.frame_with(
        idle.clone(),
        Command::ShowEvent(NotificationEvent::Searching {
            user: user.clone(),
            query: "never gonna".into(),
            keywords: String::new(),
            source: None,
        }),
    );
    h.frame_with(
        idle,
        Command::ShowEvent(NotificationEvent::QueryLoading {
            user,
            query: "never gonna".into(),
            keywords: String::new(),
            source: None,
        }),
    );
    assert_eq!(h.core.banner().len(), 2);
    assert!(h.core.subscribe().borrow().banner.fading);

    // Crossfade ends.
    h.feed_back().await;

    assert_eq!(h.core.banner().len(), 1);
    let view = h.core.subscribe().borrow().clone();
    assert!(view.banner.text.contains("downloading"), "{}", view.banner.text);
    assert!(!view.banner.fading);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_errors_skip_once() {
    let mut h = Harness::new(&[]);
    h.frame(playing(track(9, "broken.mp3", Some(-30.0)), vec![]));
    h.sent();

    for _ in 0..2 {
        h.core.handle(CoreEvent::Audio(AudioEvent::Error(PlaybackError::Network(
            "reset".into(),
        ))));
        // Retry backoff elapses.
        h.feed_back().await;
    }
    for _ in 0..2 {
        h.core.handle(CoreEvent::Audio(AudioEvent::Error(PlaybackError::Network(
            "reset".into(),
        ))));
    }

    let nexts: Vec<Command> = h
        .sent()
        .into_iter()
        .filter(|c| matches!(c, Command::Next(_)))
        .collect();
    assert_eq!(nexts, vec![Command::Next(9)]);
    assert_eq!(h.audio.loads(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reorder_holds_against_stale_snapshots() {
    let mut h = Harness::new(&[]);
    let queue = vec![
        track(1, "a.mp3", Some(-30.0)),
        track(2, "b.mp3", Some(-30.0)),
        track(3, "c.mp3", Some(-30.0)),
    ];
    let snapshot = playing(track(10, "now.mp3", Some(-30.0)), queue);
    h.frame(snapshot.clone());
    h.sent();

    h.core.handle(CoreEvent::User(UserAction::MoveToTop(3)));
    assert_eq!(h.sent(), vec![Command::MoveToTop(3)]);

    let ids = |h: &Harness| -> Vec<u64> {
        h.core.subscribe().borrow().queue.iter().map(|t| t.id).collect()
    };
    assert_eq!(ids(&h), vec![3, 1, 2]);
    assert!(h.core.subscribe().borrow().reordering);

    tokio::time::advance(Duration::from_millis(500)).await;
    h.frame(snapshot.clone());
    assert_eq!(ids(&h), vec![3, 1, 2]);

    tokio::time::advance(Duration::from_millis(700)).await;
    h.frame(snapshot);
    assert_eq!(ids(&h), vec![1, 2, 3]);
    assert!(!h.core.subscribe().borrow().reordering);
}

#[tokio::test]
async fn test_channel_up_requests_status() {
    let mut h = Harness::new(&[]);
    h.core.handle(CoreEvent::ChannelUp);
    assert_eq!(h.sent(), vec![Command::Status]);
    assert!(h.core.subscribe().borrow().connected);

    h.core.handle(CoreEvent::ChannelDown);
    assert!(!h.core.subscribe().borrow().connected);
}

#[tokio::test(start_paused = true)]
async fn test_same_query_from_another_user_replaces_banner() {
    let mut h = Harness::new(&[]);
    let idle = Snapshot::default();
    let user = |uid: u64, name: &str| UserInfo {
        uid,
        username: name.into(),
        ..Default::default()
    };

    h.frame_with(
        idle.clone(),
        Command::ShowEvent(NotificationEvent::Searching {
            user: user(1, "bob"),
            query: "take on me".into(),
            keywords: String::new(),
            source: None,
        }),
    );
    h.frame_with(
        idle,
        Command::ShowEvent(NotificationEvent::QueryLoading {
            user: user(2, "carol"),
            query: "take on me".into(),
            keywords: String::new(),
            source: None,
        }),
    );
    h.feed_back().await;

    assert_eq!(h.core.banner().len(), 1);
    let text = h.core.subscribe().borrow().banner.text.clone();
    assert!(text.contains("downloading"), "{}", text);
}

#[tokio::test]
async fn test_seek_command_moves_element_without_touching_retries() {
    let mut h = Harness::new(&[]);
    let snapshot = playing(track(5, "long.mp3", Some(-30.0)), vec![]);
    h.frame(snapshot.clone());
    let retries = h.core.playback().retries_left();

    h.frame_with(snapshot, Command::Seek(42));

    assert!(h.audio.log.lock().unwrap().iter().any(|l| l == "seek 42"));
    assert_eq!(h.core.playback().position(), 42);
    assert_eq!(h.core.playback().retries_left(), retries);
    assert_eq!(h.audio.loads(), 1);
}

#[tokio::test]
async fn test_target_change_alone_recomputes_gain() {
    let mut h = Harness::new(&[]);
    let mut snapshot = playing(track(1, "loud.mp3", Some(-6.0)), vec![]);
    h.frame(snapshot.clone());
    let gain = h.core.playback().gain();
    assert!((gain - 0.019953).abs() < 1e-4, "gain {}", gain);

    snapshot.config.target_loudness_db = -20.0;
    h.frame(snapshot);

    let gain = h.core.playback().gain();
    assert!((gain - 0.199526).abs() < 1e-4, "gain {}", gain);
    assert_eq!(h.audio.loads(), 1);
    assert_eq!(h.loudness.calls_for(&url("loud.mp3")), 0);
}

#[tokio::test]
async fn test_shutdown_abandons_running_measurement() {
    let config = Config::default();
    let loudness = Arc::new(StalledLoudness::default());
    let (event_tx, event_rx) = mpsc::channel(64);
    let (outbox_tx, _outbox) = mpsc::unbounded_channel();
    let core = PlayerCore::new(
        &config,
        FakeAudio::default(),
        loudness.clone(),
        event_tx.clone(),
        outbox_tx,
    )
    .unwrap();
    let running = tokio::spawn(core.run(event_rx));

    event_tx
        .send(CoreEvent::Frame(Frame {
            command: None,
            status: playing(track(1, "slow.flac", None), vec![]),
        }))
        .await
        .unwrap();
    event_tx.send(CoreEvent::Shutdown).await.unwrap();
    running.await.unwrap().unwrap();

    for _ in 0..10 {
        if loudness.dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(loudness.calls.load(Ordering::SeqCst), 1);
    assert!(loudness.dropped.load(Ordering::SeqCst));
}
