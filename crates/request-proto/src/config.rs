use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub banner: BannerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Where the player backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Push channel endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Base for the audio file endpoint; `/player/file?path=` is appended.
    #[serde(default = "default_file_base_url")]
    pub file_base_url: String,
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// User volume, 0.0..=1.0.  Loudness gain is applied on top.
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u8,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Loudness assumed for a track whose audio could not be decoded.
    #[serde(default = "default_fallback_loudness_db")]
    pub fallback_loudness_db: f64,
    #[serde(default = "platform::mpv_socket_name")]
    pub mpv_socket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerConfig {
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,
    #[serde(default = "default_idle_rotate_secs")]
    pub idle_rotate_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_suppression_ms")]
    pub suppression_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            file_base_url: default_file_base_url(),
            reconnect_ms: default_reconnect_ms(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            retry_limit: default_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            fallback_loudness_db: default_fallback_loudness_db(),
            mpv_socket: platform::mpv_socket_name(),
        }
    }
}

impl Default for BannerConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: default_crossfade_ms(),
            idle_rotate_secs: default_idle_rotate_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            suppression_ms: default_suppression_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl BannerConfig {
    pub fn crossfade(&self) -> Duration {
        Duration::from_millis(self.crossfade_ms)
    }

    pub fn idle_rotate(&self) -> Duration {
        Duration::from_secs(self.idle_rotate_secs.max(1))
    }
}

impl QueueConfig {
    pub fn suppression(&self) -> Duration {
        Duration::from_millis(self.suppression_ms)
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8000/player/ws".to_string()
}

fn default_file_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_reconnect_ms() -> u64 {
    2000
}

fn default_volume() -> f64 {
    1.0
}

fn default_retry_limit() -> u8 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_fallback_loudness_db() -> f64 {
    -20.0
}

fn default_crossfade_ms() -> u64 {
    300
}

fn default_idle_rotate_secs() -> u64 {
    8
}

fn default_suppression_ms() -> u64 {
    1000
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
