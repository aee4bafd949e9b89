//! Loudness measurement and gain.
//!
//! A track's loudness figure is the RMS level of its first channel over the
//! whole file, in whole dBFS.  Figures are written once per resolved URL and
//! never recomputed for the session.  Gain only ever attenuates: a track
//! quieter than the target plays at source level.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::CoreEvent;

/// Level reported for digital silence.
pub const FLOOR_DB: f64 = -90.0;

#[derive(Debug, Error)]
pub enum LoudnessError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("no audio samples")]
    Empty,
    #[error("measurement cancelled")]
    Cancelled,
}

/// Playback gain for a track measured at `loudness_db` against `target_db`.
/// Always in (0, 1].
pub fn gain_for_loudness(loudness_db: f64, target_db: f64) -> f64 {
    if loudness_db > target_db {
        10f64.powf((target_db - loudness_db) / 20.0)
    } else {
        1.0
    }
}

// ── RMS ───────────────────────────────────────────────────────────────────────

/// Streaming RMS over normalised f32 samples.
#[derive(Debug, Default)]
pub struct RmsAccumulator {
    sum_sq: f64,
    count: u64,
}

impl RmsAccumulator {
    pub fn push<I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = f32>,
    {
        for s in samples {
            let f = s as f64;
            self.sum_sq += f * f;
            self.count += 1;
        }
    }

    /// Rounded level in dBFS, or `None` if nothing was pushed.
    pub fn db(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let rms = (self.sum_sq / self.count as f64).sqrt();
        if rms < 1e-10 {
            return Some(FLOOR_DB);
        }
        Some((20.0 * rms.log10()).round().max(FLOOR_DB))
    }
}

/// Decode a whole in-memory file and measure its first channel.  Stops
/// between packets once `cancel` fires.
pub fn measure_bytes(
    bytes: Vec<u8>,
    extension: Option<&str>,
    cancel: &CancellationToken,
) -> Result<f64, LoudnessError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LoudnessError::Decode(format!("probe: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| LoudnessError::Decode("no audio track".to_string()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| LoudnessError::Decode(format!("codec: {}", e)))?;

    let mut acc = RmsAccumulator::default();
    loop {
        if cancel.is_cancelled() {
            return Err(LoudnessError::Cancelled);
        }
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(LoudnessError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let channels = decoded.spec().channels.count().max(1);
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                buf.copy_interleaved_ref(decoded);
                acc.push(buf.samples().iter().step_by(channels).copied());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("loudness: skipping bad packet: {}", e);
            }
            Err(e) => return Err(LoudnessError::Decode(e.to_string())),
        }
    }

    acc.db().ok_or(LoudnessError::Empty)
}

/// File extension of the `path` query parameter, used as a probe hint.
fn extension_hint(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let path = parsed
        .query_pairs()
        .find(|(k, _)| k == "path")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| parsed.path().to_string());
    let ext = std::path::Path::new(&path).extension()?.to_str()?;
    Some(ext.to_ascii_lowercase())
}

// ── sources ───────────────────────────────────────────────────────────────────

/// Produces a loudness figure for a resolved URL.
pub trait LoudnessSource: Send + Sync {
    fn measure(&self, url: &str) -> BoxFuture<'static, Result<f64, LoudnessError>>;
}

/// Fetches the file over HTTP and decodes it on a blocking thread.
pub struct HttpLoudnessSource {
    client: reqwest::Client,
}

impl HttpLoudnessSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl LoudnessSource for HttpLoudnessSource {
    fn measure(&self, url: &str) -> BoxFuture<'static, Result<f64, LoudnessError>> {
        let client = self.client.clone();
        let url = url.to_string();
        Box::pin(async move {
            let bytes = client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            debug!("loudness: fetched {} bytes from {}", bytes.len(), url);
            let ext = extension_hint(&url);
            // Dropping this future (aborted measurement) stops the decode.
            let cancel = CancellationToken::new();
            let _guard = cancel.clone().drop_guard();
            tokio::task::spawn_blocking(move || {
                measure_bytes(bytes.to_vec(), ext.as_deref(), &cancel)
            })
            .await
            .map_err(|e| LoudnessError::Decode(format!("decode task: {}", e)))?
        })
    }
}

// ── normalizer ────────────────────────────────────────────────────────────────

/// Write-once loudness cache with deduplicated background measurement.
/// Results come back to the core as `CoreEvent::LoudnessMeasured`.
pub struct LoudnessNormalizer {
    source: Arc<dyn LoudnessSource>,
    tx: mpsc::Sender<CoreEvent>,
    cache: HashMap<String, f64>,
    /// Running measurements, aborted on teardown.
    in_flight: HashMap<String, AbortHandle>,
    /// Failed last time; preload leaves these alone until asked directly.
    failed: HashSet<String>,
    fallback_db: f64,
}

impl LoudnessNormalizer {
    pub fn new(source: Arc<dyn LoudnessSource>, tx: mpsc::Sender<CoreEvent>, fallback_db: f64) -> Self {
        Self {
            source,
            tx,
            cache: HashMap::new(),
            in_flight: HashMap::new(),
            failed: HashSet::new(),
            fallback_db,
        }
    }

    pub fn cached(&self, url: &str) -> Option<f64> {
        self.cache.get(url).copied()
    }

    pub fn is_measuring(&self, url: &str) -> bool {
        self.in_flight.contains_key(url)
    }

    /// Known figure for `url`, seeding the cache from a server-provided
    /// `decibel`.  Unknown figures start a measurement and return `None`.
    pub fn resolve(&mut self, url: &str, decibel: Option<f64>) -> Option<f64> {
        if let Some(db) = self.cached(url) {
            return Some(db);
        }
        if let Some(db) = decibel {
            self.cache.insert(url.to_string(), db);
            return Some(db);
        }
        self.start_measurement(url);
        None
    }

    /// Warm the cache for upcoming tracks.
    pub fn preload<'a, I>(&mut self, items: I)
    where
        I: IntoIterator<Item = (&'a str, Option<f64>)>,
    {
        for (url, decibel) in items {
            if decibel.is_none() && self.failed.contains(url) {
                continue;
            }
            let _ = self.resolve(url, decibel);
        }
    }

    /// Record a finished measurement.  Returns the figure to use: the
    /// cached value, or the fallback when decoding failed (not cached, so
    /// the next request tries again).
    pub fn on_measured(&mut self, url: &str, result: Result<f64, LoudnessError>) -> f64 {
        self.in_flight.remove(url);
        match result {
            Ok(db) => {
                self.failed.remove(url);
                let db = *self.cache.entry(url.to_string()).or_insert(db);
                info!("loudness: {} = {} dB", url, db);
                db
            }
            Err(e) => {
                self.failed.insert(url.to_string());
                warn!(
                    "loudness: {} unavailable ({}), assuming {} dB",
                    url, e, self.fallback_db
                );
                self.fallback_db
            }
        }
    }

    fn start_measurement(&mut self, url: &str) {
        if self.in_flight.contains_key(url) {
            return;
        }
        debug!("loudness: measuring {}", url);
        let fut = self.source.measure(url);
        let tx = self.tx.clone();
        let key = url.to_string();
        let url = key.clone();
        let task = tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send(CoreEvent::LoudnessMeasured { url, result }).await;
        });
        self.in_flight.insert(key, task.abort_handle());
    }

    /// Abort every running measurement.  Their results never arrive.
    pub fn teardown(&mut self) {
        for (url, task) in self.in_flight.drain() {
            debug!("loudness: abandoning {}", url);
            task.abort();
        }
    }
}

impl Drop for LoudnessNormalizer {
    fn drop(&mut self) {
        self.teardown();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingSource;
    use super::*;

    fn wav_i16_mono(samples: &[i16], rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_gain_attenuates_loud_tracks() {
        let gain = gain_for_loudness(-6.0, -40.0);
        assert!((gain - 0.019_95).abs() < 1e-4, "gain {}", gain);
    }

    #[test]
    fn test_gain_never_amplifies() {
        assert_eq!(gain_for_loudness(-50.0, -40.0), 1.0);
        assert_eq!(gain_for_loudness(-40.0, -40.0), 1.0);
        assert_eq!(gain_for_loudness(FLOOR_DB, -40.0), 1.0);
    }

    #[test]
    fn test_rms_rounding_and_floor() {
        let mut acc = RmsAccumulator::default();
        assert_eq!(acc.db(), None);
        acc.push([0.0f32; 64]);
        assert_eq!(acc.db(), Some(FLOOR_DB));

        let mut square = RmsAccumulator::default();
        square.push((0..1000).map(|i| if i % 2 == 0 { 0.5f32 } else { -0.5 }));
        assert_eq!(square.db(), Some(-6.0));

        let mut full = RmsAccumulator::default();
        full.push([1.0f32, -1.0, 1.0, -1.0]);
        assert_eq!(full.db(), Some(0.0));
    }

    #[test]
    fn test_measure_wav_bytes() {
        let samples: Vec<i16> = (0..8000)
            .map(|i| if i % 2 == 0 { 16384 } else { -16384 })
            .collect();
        let db = measure_bytes(wav_i16_mono(&samples, 8000), Some("wav"), &CancellationToken::new()).unwrap();
        assert_eq!(db, -6.0);
    }

    #[test]
    fn test_measure_garbage_fails() {
        assert!(measure_bytes(b"definitely not audio".to_vec(), None, &CancellationToken::new()).is_err());
    }

    #[test]
    fn test_extension_hint_from_query() {
        assert_eq!(
            extension_hint("http://127.0.0.1:8000/player/file?path=BV1xx.M4A").as_deref(),
            Some("m4a")
        );
        assert_eq!(
            extension_hint("http://h/files/song.flac").as_deref(),
            Some("flac")
        );
        assert_eq!(extension_hint("http://h/player/file?path=noext"), None);
    }

    #[tokio::test]
    async fn test_measures_each_url_once() {
        let source = CountingSource::with(&[("u1", -12.0)]);
        let (tx, mut rx) = mpsc::channel(8);
        let mut norm = LoudnessNormalizer::new(source.clone(), tx, -20.0);

        assert_eq!(norm.resolve("u1", None), None);
        assert_eq!(norm.resolve("u1", None), None);
        assert!(norm.is_measuring("u1"));

        let Some(CoreEvent::LoudnessMeasured { url, result }) = rx.recv().await else {
            panic!("expected a measurement");
        };
        assert_eq!(norm.on_measured(&url, result), -12.0);
        assert_eq!(norm.resolve("u1", None), Some(-12.0));
        assert_eq!(source.calls_for("u1"), 1);
    }

    #[tokio::test]
    async fn test_server_decibel_short_circuits() {
        let source = CountingSource::with(&[]);
        let (tx, _rx) = mpsc::channel(8);
        let mut norm = LoudnessNormalizer::new(source.clone(), tx, -20.0);
        assert_eq!(norm.resolve("u2", Some(-8.5)), Some(-8.5));
        // Cached figure wins over a later, different server value.
        assert_eq!(norm.resolve("u2", Some(-3.0)), Some(-8.5));
        assert_eq!(source.calls_for("u2"), 0);
    }

    #[tokio::test]
    async fn test_failure_uses_fallback_without_caching() {
        let source = CountingSource::with(&[]);
        let (tx, mut rx) = mpsc::channel(8);
        let mut norm = LoudnessNormalizer::new(source.clone(), tx, -20.0);

        assert_eq!(norm.resolve("bad", None), None);
        let Some(CoreEvent::LoudnessMeasured { url, result }) = rx.recv().await else {
            panic!("expected a measurement");
        };
        assert_eq!(norm.on_measured(&url, result), -20.0);
        assert_eq!(norm.cached("bad"), None);

        // Preload does not hammer a URL that just failed; a direct request does.
        norm.preload([("bad", None)]);
        assert_eq!(source.calls_for("bad"), 1);
        assert_eq!(norm.resolve("bad", None), None);
        assert_eq!(source.calls_for("bad"), 2);
    }

    #[test]
    fn test_cancelled_decode_stops() {
        let samples = vec![8192i16; 4000];
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            measure_bytes(wav_i16_mono(&samples, 8000), Some("wav"), &cancel),
            Err(LoudnessError::Cancelled)
        ));
    }

    /// Never finishes; records when its future is dropped.
    struct StalledSource {
        dropped: Arc<std::sync::atomic::AtomicBool>,
    }

    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl LoudnessSource for StalledSource {
        fn measure(&self, _url: &str) -> BoxFuture<'static, Result<f64, LoudnessError>> {
            let flag = DropFlag(self.dropped.clone());
            Box::pin(async move {
                let _flag = flag;
                std::future::pending::<Result<f64, LoudnessError>>().await
            })
        }
    }

    #[tokio::test]
    async fn test_teardown_aborts_running_measurements() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source = Arc::new(StalledSource {
            dropped: dropped.clone(),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let mut norm = LoudnessNormalizer::new(source, tx, -20.0);

        assert_eq!(norm.resolve("slow", None), None);
        tokio::task::yield_now().await;
        assert!(norm.is_measuring("slow"));

        norm.teardown();
        assert!(!norm.is_measuring("slow"));
        for _ in 0..10 {
            if dropped.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
        drop(norm);
        assert!(rx.recv().await.is_none());
    }
}
