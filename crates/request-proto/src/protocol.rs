use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default loudness target when the server config omits it.
pub const DEFAULT_TARGET_DB: f64 = -40.0;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── users / songs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Owner,
    Admin,
    #[default]
    User,
}

/// The chat user an entry or event belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserInfo {
    #[serde(default)]
    pub uid: u64,
    #[serde(default)]
    pub uid_hash: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub privilege: Privilege,
}

impl UserInfo {
    pub fn display_name(&self) -> &str {
        if self.username.is_empty() {
            "???"
        } else {
            &self.username
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Song {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub singer: String,
    #[serde(default)]
    pub source: String,
    pub filename: String,
    /// Loudness precomputed by the server (dB).  Short-circuits local decode.
    #[serde(default)]
    pub decibel: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// A playlist entry as pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Track {
    /// Playlist entry id (not the song id): the key for next/cancel/move.
    pub id: u64,
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default)]
    pub is_from_control: bool,
    #[serde(default)]
    pub user: UserInfo,
    pub music: Song,
}

impl Track {
    pub fn filename(&self) -> &str {
        &self.music.filename
    }

    pub fn title(&self) -> &str {
        &self.music.title
    }

    pub fn singer(&self) -> &str {
        &self.music.singer
    }

    pub fn duration(&self) -> Option<f64> {
        self.music.duration
    }

    pub fn decibel(&self) -> Option<f64> {
        self.music.decibel
    }
}

// ── snapshot ──────────────────────────────────────────────────────────────────

/// The subset of server config the player surface reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_target_db", alias = "target_db")]
    pub target_loudness_db: f64,
    #[serde(default)]
    pub request_handler_off: bool,
    #[serde(default = "default_request_cmd")]
    pub request_cmd: String,
    #[serde(default = "default_cancel_cmd")]
    pub cancel_cmd: String,
    #[serde(default = "default_skip_cmd")]
    pub skip_cmd: String,
    #[serde(default = "default_skipend_cmd")]
    pub skipend_cmd: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            target_loudness_db: default_target_db(),
            request_handler_off: false,
            request_cmd: default_request_cmd(),
            cancel_cmd: default_cancel_cmd(),
            skip_cmd: default_skip_cmd(),
            skipend_cmd: default_skipend_cmd(),
        }
    }
}

fn default_target_db() -> f64 {
    DEFAULT_TARGET_DB
}

fn default_request_cmd() -> String {
    "点歌".to_string()
}

fn default_cancel_cmd() -> String {
    "取消点歌".to_string()
}

fn default_skip_cmd() -> String {
    "切歌".to_string()
}

fn default_skipend_cmd() -> String {
    "跳过当前".to_string()
}

/// Full authoritative player state.  Replaces the local mirror wholesale on
/// every frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Snapshot {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub current: Option<Track>,
    #[serde(default)]
    pub playlist: Vec<Track>,
    #[serde(default)]
    pub fallback: Vec<Track>,
    /// Main queue followed by fallback entries; the list users reorder.
    #[serde(default)]
    pub combined_list: Vec<Track>,
    #[serde(default)]
    pub cached_songs: Vec<Song>,
    #[serde(default)]
    pub config: PlayerConfig,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl Snapshot {
    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|t| t.id)
    }
}

// ── events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueryFailReason {
    KeywordBanned,
    Failed,
    AlreadyQueued,
    NoResource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RequestFailReason {
    RequestRateLimit,
    SuccessRateLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CancelFailReason {
    NoMatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SkipFailReason {
    NoPlaying,
    NotUser,
    UseStartcmd,
}

/// Discrete outcome of a chat request, carried by `show-event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NotificationEvent {
    Searching {
        user: UserInfo,
        query: String,
        #[serde(default)]
        keywords: String,
        #[serde(default)]
        source: Option<String>,
    },
    QueryLoading {
        user: UserInfo,
        query: String,
        #[serde(default)]
        keywords: String,
        #[serde(default)]
        source: Option<String>,
    },
    QuerySuccess {
        user: UserInfo,
        query: String,
        #[serde(default)]
        keywords: String,
        #[serde(default)]
        source: Option<String>,
        song: Song,
    },
    QueryFail {
        user: UserInfo,
        query: String,
        #[serde(default)]
        keywords: String,
        #[serde(default)]
        source: Option<String>,
        reason: QueryFailReason,
    },
    RequestFail {
        user: UserInfo,
        query: String,
        reason: RequestFailReason,
    },
    CancelFail {
        user: UserInfo,
        #[serde(default)]
        id: Option<u64>,
        reason: CancelFailReason,
    },
    CancelSuccess {
        user: UserInfo,
        id: u64,
        title: String,
    },
    SkipFail {
        user: UserInfo,
        #[serde(default)]
        id: Option<u64>,
        reason: SkipFailReason,
    },
    SkipSuccess {
        user: UserInfo,
        id: u64,
        title: String,
    },
}

/// Fieldless mirror of `NotificationEvent` variants, for rule tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Searching,
    QueryLoading,
    QuerySuccess,
    QueryFail,
    RequestFail,
    CancelFail,
    CancelSuccess,
    SkipFail,
    SkipSuccess,
}

impl NotificationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Searching { .. } => EventKind::Searching,
            Self::QueryLoading { .. } => EventKind::QueryLoading,
            Self::QuerySuccess { .. } => EventKind::QuerySuccess,
            Self::QueryFail { .. } => EventKind::QueryFail,
            Self::RequestFail { .. } => EventKind::RequestFail,
            Self::CancelFail { .. } => EventKind::CancelFail,
            Self::CancelSuccess { .. } => EventKind::CancelSuccess,
            Self::SkipFail { .. } => EventKind::SkipFail,
            Self::SkipSuccess { .. } => EventKind::SkipSuccess,
        }
    }

    pub fn user(&self) -> &UserInfo {
        match self {
            Self::Searching { user, .. }
            | Self::QueryLoading { user, .. }
            | Self::QuerySuccess { user, .. }
            | Self::QueryFail { user, .. }
            | Self::RequestFail { user, .. }
            | Self::CancelFail { user, .. }
            | Self::CancelSuccess { user, .. }
            | Self::SkipFail { user, .. }
            | Self::SkipSuccess { user, .. } => user,
        }
    }

    /// The raw query text, for events that have one.
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Searching { query, .. }
            | Self::QueryLoading { query, .. }
            | Self::QuerySuccess { query, .. }
            | Self::QueryFail { query, .. }
            | Self::RequestFail { query, .. } => Some(query),
            _ => None,
        }
    }
}

// ── commands / frames ─────────────────────────────────────────────────────────

/// `{cmd, value}` envelope.  The same type travels both ways: the server
/// attaches one to a snapshot, the player sends them on their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", content = "value", rename_all = "kebab-case")]
pub enum Command {
    Paused(bool),
    Seek(u64),
    Next(u64),
    Progress(u64),
    ShowEvent(NotificationEvent),
    VolumeReport(f64),
    MoveToTop(u64),
    MoveToEnd(u64),
    MoveDown(u64),
    Cancel(u64),
    SetIsFallback(u64),
    UnsetIsFallback(u64),
    Status,
}

impl Command {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Paused(_) => "paused",
            Self::Seek(_) => "seek",
            Self::Next(_) => "next",
            Self::Progress(_) => "progress",
            Self::ShowEvent(_) => "show-event",
            Self::VolumeReport(_) => "volume-report",
            Self::MoveToTop(_) => "move-to-top",
            Self::MoveToEnd(_) => "move-to-end",
            Self::MoveDown(_) => "move-down",
            Self::Cancel(_) => "cancel",
            Self::SetIsFallback(_) => "set-is-fallback",
            Self::UnsetIsFallback(_) => "unset-is-fallback",
            Self::Status => "status",
        }
    }
}

/// One push-channel message: a snapshot plus at most one command.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    pub status: Snapshot,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    command: Option<serde_json::Value>,
    status: Snapshot,
}

impl Frame {
    /// Decode a text frame.  A bad `status` rejects the whole frame; a bad or
    /// unknown `command` is dropped and the snapshot still applies.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let command = match raw.command {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => match serde_json::from_value::<Command>(value.clone()) {
                Ok(cmd) => Some(cmd),
                Err(e) => {
                    warn!("frame: ignoring unrecognised command {}: {}", value, e);
                    None
                }
            },
        };
        Ok(Self {
            command,
            status: raw.status,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
