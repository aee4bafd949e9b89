/// mpv as the audio element, over its JSON IPC socket.
///
/// Architecture:
///
/// ```text
///   MpvAudio (AudioElement, sync)
///         │  MpvCommand via unbounded mpsc, in call order
///         ▼
///   dispatcher_task ── owns MpvDriver, respawns mpv when the socket dies
///         │
///         ├── writer_task   ← MpvRequest via mpsc → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── response (has request_id) → matched oneshot
///                                └── event / property-change   → translate_task
///                                                                   └── CoreEvent::Audio
/// ```
///
/// Platform notes:
/// - Unix:    Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::audio::{AudioElement, AudioEvent, PlayRejection, PlaybackError};
use crate::core::CoreEvent;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// Translate into what the recovery controller understands.
    pub fn to_audio_event(&self) -> Option<AudioEvent> {
        if let Some((id, data)) = self.as_property_change() {
            return match id {
                OBS_PAUSE => data.as_bool().map(|paused| {
                    if paused {
                        AudioEvent::Paused
                    } else {
                        AudioEvent::Playing
                    }
                }),
                OBS_TIME_POS => data.as_f64().map(AudioEvent::TimeUpdate),
                _ => None,
            };
        }
        match self.event_name()? {
            "end-file" => {
                let reason = self.raw.get("reason").and_then(|r| r.as_str()).unwrap_or("");
                let detail = self
                    .raw
                    .get("file_error")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                Some(match reason {
                    "eof" => AudioEvent::Ended,
                    "error" => AudioEvent::Error(classify_file_error(detail)),
                    // stop / redirect / quit: our own loadfile or shutdown
                    _ => AudioEvent::Error(PlaybackError::Interrupted),
                })
            }
            _ => None,
        }
    }
}

fn classify_file_error(detail: String) -> PlaybackError {
    let lower = detail.to_ascii_lowercase();
    if ["network", "http", "tcp", "timed out", "connection"]
        .iter()
        .any(|k| lower.contains(k))
    {
        PlaybackError::Network(detail)
    } else if ["format", "codec", "demux", "no audio", "loading failed"]
        .iter()
        .any(|k| lower.contains(k))
    {
        PlaybackError::Decode(detail)
    } else {
        PlaybackError::Other(detail)
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Register observe_property for everything `to_audio_event` reads.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [(OBS_PAUSE, "pause"), (OBS_TIME_POS, "time-pos")];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and manages (re)connection.
pub struct MpvDriver {
    pub socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f64,
}

impl MpvDriver {
    pub fn new(socket_name: String) -> Self {
        Self {
            socket_name,
            process: None,
            last_volume: 1.0,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        let Some(child) = self.process.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("mpv process exited: {}", status);
                false
            }
            Err(e) => {
                warn!("mpv process_alive check failed: {}", e);
                false
            }
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn command(&self) -> anyhow::Result<tokio::process::Command> {
        let mpv_binary = request_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--no-video")
            .arg("--idle=yes")
            .arg("--keep-open=no")
            .arg(request_proto::platform::mpv_socket_arg(&self.socket_name))
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    // ── spawn ─────────────────────────────────────────────────────────────────

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        let stderr_path = request_proto::platform::data_dir().join("mpv-stderr.log");
        let stderr_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)?;
        info!("mpv: spawning, stderr to {:?}", stderr_path);

        let child = self.command()?.stderr(stderr_file).spawn()?;
        info!("mpv: spawned process with pid {:?}", child.id());
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        info!("mpv: spawning");
        let child = self.command()?.stderr(std::process::Stdio::null()).spawn()?;
        self.process = Some(child);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel; writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);
    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));
    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_all(pending: &PendingMap, why: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", why)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "read error").await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── audio element ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum MpvCommand {
    Load { url: String, start: u64 },
    Play,
    Pause,
    Seek(u64),
    Volume(f64),
    Stop,
}

impl MpvCommand {
    fn requests(&self) -> Vec<Value> {
        match self {
            Self::Load { url, start } => vec![
                json!(["set_property", "start", start.to_string()]),
                json!(["loadfile", url, "replace"]),
            ],
            Self::Play => vec![json!(["set_property", "pause", false])],
            Self::Pause => vec![json!(["set_property", "pause", true])],
            Self::Seek(secs) => vec![json!(["set_property", "time-pos", secs])],
            Self::Volume(v) => vec![json!(["set_property", "volume", (v * 100.0).clamp(0.0, 100.0)])],
            Self::Stop => vec![json!(["stop"])],
        }
    }
}

/// `AudioElement` backed by an mpv process.  Calls never block; they are
/// queued to a dispatcher that talks to mpv in order.
pub struct MpvAudio {
    tx: mpsc::UnboundedSender<MpvCommand>,
}

impl MpvAudio {
    /// Spawn the dispatcher and event translation tasks.  mpv itself is
    /// started lazily by the first command.
    pub fn spawn(socket_name: String, core_tx: mpsc::Sender<CoreEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(translate_task(event_rx, core_tx.clone()));
        tokio::spawn(dispatcher_task(
            MpvDriver::new(socket_name),
            rx,
            event_tx,
            core_tx,
        ));
        Self { tx }
    }

    fn queue(&self, cmd: MpvCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("mpv: dispatcher gone");
        }
    }
}

impl AudioElement for MpvAudio {
    fn load(&mut self, url: &str, start_secs: u64) {
        self.queue(MpvCommand::Load {
            url: url.to_string(),
            start: start_secs,
        });
    }

    fn play(&mut self) {
        self.queue(MpvCommand::Play);
    }

    fn pause(&mut self) {
        self.queue(MpvCommand::Pause);
    }

    fn seek(&mut self, secs: u64) {
        self.queue(MpvCommand::Seek(secs));
    }

    fn set_volume(&mut self, volume: f64) {
        self.queue(MpvCommand::Volume(volume));
    }

    fn stop(&mut self) {
        self.queue(MpvCommand::Stop);
    }
}

async fn translate_task(mut rx: mpsc::Receiver<MpvEvent>, core_tx: mpsc::Sender<CoreEvent>) {
    while let Some(evt) = rx.recv().await {
        if let Some(audio) = evt.to_audio_event() {
            if core_tx.send(CoreEvent::Audio(audio)).await.is_err() {
                break;
            }
        }
    }
}

async fn dispatcher_task(
    mut driver: MpvDriver,
    mut rx: mpsc::UnboundedReceiver<MpvCommand>,
    event_tx: mpsc::Sender<MpvEvent>,
    core_tx: mpsc::Sender<CoreEvent>,
) {
    let mut handle: Option<MpvHandle> = None;

    while let Some(cmd) = rx.recv().await {
        if let MpvCommand::Volume(v) = cmd {
            driver.last_volume = v;
        }

        let needs_spawn = match &handle {
            Some(h) => h.is_closed() || !driver.process_alive(),
            None => true,
        };
        if needs_spawn {
            if matches!(cmd, MpvCommand::Stop) {
                continue;
            }
            handle = match driver.spawn_and_connect(event_tx.clone()).await {
                Ok(h) => {
                    h.observe_all_properties().await;
                    Some(h)
                }
                Err(e) => {
                    warn!("mpv: unavailable: {:#}", e);
                    let _ = core_tx
                        .send(CoreEvent::Audio(AudioEvent::Error(PlaybackError::Other(
                            format!("mpv unavailable: {}", e),
                        ))))
                        .await;
                    None
                }
            };
        }
        let Some(h) = &handle else {
            continue;
        };

        for request in cmd.requests() {
            if let Err(e) = h.send(request).await {
                warn!("mpv: {:?} failed: {}", cmd, e);
                if cmd == MpvCommand::Play {
                    let _ = core_tx
                        .send(CoreEvent::Audio(AudioEvent::PlayRejected(
                            PlayRejection::Unsupported(e.to_string()),
                        )))
                        .await;
                }
                break;
            }
        }
    }

    debug!("mpv: dispatcher exiting");
    driver.kill().await;
}
