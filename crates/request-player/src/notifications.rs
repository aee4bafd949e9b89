//! Request banner: one transient message at a time.
//!
//! Events from chat requests become `DisplayMessage`s in a queue whose head
//! is the only thing shown.  Progress events for the same query supersede
//! each other instead of piling up: if the old one is on screen the new one
//! slides in behind it and takes over after a short crossfade, otherwise the
//! old one is dropped quietly.
//!
//! When nothing is queued the banner falls back to an idle line.

use std::collections::VecDeque;
use std::time::Duration;

use request_proto::protocol::{
    CancelFailReason, EventKind, NotificationEvent, PlayerConfig, QueryFailReason,
    RequestFailReason, SkipFailReason, Snapshot,
};
use tracing::debug;

use crate::scheduler::{ScheduledTask, Scheduler, TimerFired, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMessage {
    pub text: String,
    pub severity: Severity,
    pub source: NotificationEvent,
    pub timeout: Duration,
}

/// How long a message stays up, and which earlier kinds it supersedes.
fn rule_for(kind: EventKind) -> (Duration, &'static [EventKind]) {
    match kind {
        EventKind::Searching => (Duration::from_millis(3000), &[]),
        EventKind::QueryLoading => (Duration::from_millis(5000), &[EventKind::Searching]),
        EventKind::QuerySuccess | EventKind::QueryFail => (
            Duration::from_millis(6000),
            &[EventKind::Searching, EventKind::QueryLoading],
        ),
        EventKind::RequestFail
        | EventKind::CancelFail
        | EventKind::CancelSuccess
        | EventKind::SkipFail
        | EventKind::SkipSuccess => (Duration::from_millis(3000), &[]),
    }
}

fn quoted(s: &str) -> String {
    format!("\u{201c}{}\u{201d}", s)
}

impl DisplayMessage {
    pub fn from_event(event: NotificationEvent) -> Self {
        let (timeout, _) = rule_for(event.kind());
        let who = event.user().display_name().to_string();
        let (severity, text) = match &event {
            NotificationEvent::Searching { query, .. } => {
                (Severity::Info, format!("{}: searching {}…", who, quoted(query)))
            }
            NotificationEvent::QueryLoading { query, .. } => {
                (Severity::Info, format!("{}: downloading {}…", who, quoted(query)))
            }
            NotificationEvent::QuerySuccess { song, .. } => {
                let title = if song.singer.is_empty() {
                    song.title.clone()
                } else {
                    format!("{} - {}", song.title, song.singer)
                };
                (Severity::Success, format!("{} requested {}", who, title))
            }
            NotificationEvent::QueryFail { query, reason, .. } => {
                let q = quoted(query);
                let text = match reason {
                    QueryFailReason::KeywordBanned => format!("{}: {} contains a banned word", who, q),
                    QueryFailReason::Failed => format!("{}: nothing found for {}", who, q),
                    QueryFailReason::AlreadyQueued => format!("{}: {} is already queued", who, q),
                    QueryFailReason::NoResource => format!("{}: {} could not be downloaded", who, q),
                };
                (Severity::Error, text)
            }
            NotificationEvent::RequestFail { reason, .. } => {
                let text = match reason {
                    RequestFailReason::RequestRateLimit => {
                        format!("{}: too many requests, try again later", who)
                    }
                    RequestFailReason::SuccessRateLimit => {
                        format!("{}: request limit reached", who)
                    }
                };
                (Severity::Error, text)
            }
            NotificationEvent::CancelFail { reason, .. } => match reason {
                CancelFailReason::NoMatch => {
                    (Severity::Error, format!("{}: nothing to cancel", who))
                }
            },
            NotificationEvent::CancelSuccess { title, .. } => {
                (Severity::Success, format!("{} cancelled {}", who, title))
            }
            NotificationEvent::SkipFail { reason, .. } => {
                let text = match reason {
                    SkipFailReason::NoPlaying => format!("{}: nothing is playing", who),
                    SkipFailReason::NotUser => {
                        format!("{}: only the requester can skip this song", who)
                    }
                    SkipFailReason::UseStartcmd => {
                        format!("{}: use the skip-current command for this song", who)
                    }
                };
                (Severity::Error, text)
            }
            NotificationEvent::SkipSuccess { title, .. } => {
                (Severity::Success, format!("{} skipped {}", who, title))
            }
        };
        Self {
            text,
            severity,
            source: event,
            timeout,
        }
    }

    /// Same request: same query text, whoever sent it.
    fn same_request(&self, event: &NotificationEvent) -> bool {
        match (self.source.query(), event.query()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

pub struct NotificationQueue {
    messages: VecDeque<DisplayMessage>,
    scheduler: Scheduler,
    crossfade: Duration,
    /// Always targets the current head.
    evict_timer: Option<ScheduledTask>,
    /// Pending drop of a head that is being replaced.
    replace_timer: Option<ScheduledTask>,
    idle_timer: Option<ScheduledTask>,
    idle_index: usize,
}

impl NotificationQueue {
    pub fn new(scheduler: Scheduler, crossfade: Duration) -> Self {
        Self {
            messages: VecDeque::new(),
            scheduler,
            crossfade,
            evict_timer: None,
            replace_timer: None,
            idle_timer: None,
            idle_index: 0,
        }
    }

    pub fn head(&self) -> Option<&DisplayMessage> {
        self.messages.front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplayMessage> {
        self.messages.iter()
    }

    /// True during a crossfade: the head is on its way out and the message
    /// behind it is about to take over.
    pub fn is_replacing(&self) -> bool {
        self.replace_timer.is_some()
    }

    pub fn push(&mut self, event: NotificationEvent) {
        let (_, supersedes) = rule_for(event.kind());
        let message = DisplayMessage::from_event(event);
        debug!("banner: push {:?} {:?}", message.source.kind(), message.text);

        let is_match = |m: &DisplayMessage| {
            supersedes.contains(&m.source.kind()) && m.same_request(&message.source)
        };

        // Only a match at the head gets the crossfade; anything further
        // back is dropped without ceremony.
        let mut head_matched = false;
        for i in (0..self.messages.len()).rev() {
            if !is_match(&self.messages[i]) {
                continue;
            }
            if i == 0 {
                head_matched = true;
            } else {
                self.messages.remove(i);
            }
        }

        if head_matched {
            self.messages.insert(1, message);
            self.start_replace();
            return;
        }

        self.messages.push_back(message);
        if self.messages.len() == 1 {
            self.schedule_evict();
        }
    }

    fn start_replace(&mut self) {
        self.evict_timer = None;
        self.replace_timer = Some(self.scheduler.after(self.crossfade, TimerKind::BannerReplace));
    }

    fn schedule_evict(&mut self) {
        self.evict_timer = self
            .messages
            .front()
            .map(|head| self.scheduler.after(head.timeout, TimerKind::BannerEvict));
    }

    /// Handle a timer firing.  Returns false if it was not ours.
    pub fn on_timer(&mut self, fired: TimerFired) -> bool {
        if self.replace_timer.as_ref().is_some_and(|t| t.is_source_of(fired)) {
            self.replace_timer = None;
            self.messages.pop_front();
            self.schedule_evict();
            return true;
        }
        if self.evict_timer.as_ref().is_some_and(|t| t.is_source_of(fired)) {
            self.evict_timer = None;
            self.messages.pop_front();
            self.schedule_evict();
            return true;
        }
        if self.idle_timer.as_ref().is_some_and(|t| t.is_source_of(fired)) {
            self.idle_index = self.idle_index.wrapping_add(1);
            return true;
        }
        false
    }

    // ── idle banner ───────────────────────────────────────────────────────────

    pub fn start_idle_rotation(&mut self, period: Duration) {
        self.idle_timer = Some(self.scheduler.every(period, TimerKind::IdleRotate));
    }

    /// Text to show when the queue is empty.
    pub fn idle_text(&self, snapshot: &Snapshot) -> String {
        if snapshot.config.request_handler_off {
            return "Requests are disabled".to_string();
        }
        if snapshot.paused {
            return "Playback paused".to_string();
        }
        let hints = idle_hints(&snapshot.config, snapshot.playlist.len());
        hints[self.idle_index % hints.len()].clone()
    }

    pub fn clear(&mut self) {
        self.evict_timer = None;
        self.replace_timer = None;
        self.idle_timer = None;
        self.messages.clear();
    }
}

fn idle_hints(config: &PlayerConfig, queued: usize) -> Vec<String> {
    let clock = chrono::Local::now().format("%H:%M");
    vec![
        format!("Send \u{201c}{} <song>\u{201d} in chat to request a song", config.request_cmd),
        format!("Send \u{201c}{}\u{201d} to cancel your last request", config.cancel_cmd),
        format!("Send \u{201c}{}\u{201d} to skip your own song", config.skip_cmd),
        match queued {
            0 => format!("{} · queue is empty", clock),
            1 => format!("{} · 1 song queued", clock),
            n => format!("{} · {} songs queued", clock, n),
        },
    ]
}
