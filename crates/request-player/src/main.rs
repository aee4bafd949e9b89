use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use request_player::channel::PushChannel;
use request_player::core::{CoreEvent, PlayerCore};
use request_player::loudness::HttpLoudnessSource;
use request_player::mpv::MpvAudio;
use request_player::ui::PlayerUi;
use request_proto::config::Config;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Playback client for a song-request backend.
#[derive(Parser, Debug)]
#[command(name = "request-player")]
#[command(version)]
struct Args {
    /// Push channel URL (overrides server.ws_url)
    #[arg(long)]
    server: Option<String>,

    /// Base URL of the file endpoint (overrides server.file_base_url)
    #[arg(long)]
    files: Option<String>,

    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = request_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("player.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // Allow RUST_LOG override; keep HTTP and websocket internals quiet.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        "debug,hyper_util=warn,reqwest=warn,hyper=warn,tungstenite=warn,tokio_tungstenite=warn"
            .to_string()
    });
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("request-player log: {}", log_path.display());
    tracing::info!("request-player starting…");

    // ── Load config ──────────────────────────────────────────────────────────
    let loaded = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        tracing::warn!("config: {:#}, using defaults", e);
        Config::default()
    });
    if let Some(url) = args.server {
        config.server.ws_url = url;
    }
    if let Some(url) = args.files {
        config.server.file_base_url = url;
    }

    // ── Channels ─────────────────────────────────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(1024);
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

    // ── Build PlayerCore ─────────────────────────────────────────────────────
    let audio = MpvAudio::spawn(config.playback.mpv_socket.clone(), event_tx.clone());
    let loudness = Arc::new(HttpLoudnessSource::new(reqwest::Client::new()));
    let core = PlayerCore::new(&config, audio, loudness, event_tx.clone(), outbox_tx)?;
    let view_rx = core.subscribe();

    let core_handle = tokio::spawn(async move {
        if let Err(e) = core.run(event_rx).await {
            tracing::error!("PlayerCore error: {}", e);
        }
    });

    // ── Push channel ─────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let channel = PushChannel::new(
        config.server.ws_url.clone(),
        std::time::Duration::from_millis(config.server.reconnect_ms),
        event_tx.clone(),
        outbox_rx,
        cancel.clone(),
    );
    let channel_handle = tokio::spawn(channel.run());

    // ── Terminal surface ─────────────────────────────────────────────────────
    let ui_result = PlayerUi::new(view_rx, event_tx.clone()).run().await;

    cancel.cancel();
    let _ = event_tx.send(CoreEvent::Shutdown).await;
    let _ = core_handle.await;
    let _ = channel_handle.await;

    tracing::info!("request-player exited");
    ui_result
}
