//! Optimistic queue reordering.
//!
//! A local move is applied to the view immediately and sent to the server.
//! Snapshots keep arriving in the meantime, and the first few may still carry
//! the old order.  For a short window after the move those ordering-only
//! echoes are not applied to the list, while identity-bearing fields
//! (current track, paused, progress) always are.  A snapshot that changes
//! more than the order (a different current entry or a different set of
//! entries) applies in full and closes the window.
//!
//! The window is checked lazily on each snapshot; there is nothing to do at
//! the moment it expires.

use std::collections::BTreeSet;
use std::time::Duration;

use request_proto::protocol::{Command, Snapshot, Track};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SuppressionWindow {
    active_until: Option<Instant>,
}

impl SuppressionWindow {
    pub fn begin_suppression(&mut self, duration: Duration) {
        self.active_until = Some(Instant::now() + duration);
    }

    pub fn is_suppressed(&self) -> bool {
        self.active_until.is_some_and(|until| Instant::now() < until)
    }

    pub fn end(&mut self) {
        self.active_until = None;
    }
}

/// What an incoming snapshot did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewUpdate {
    Full,
    /// Local order kept; only identity fields were taken.
    OrderHeld,
}

/// The reorderable queue as rendered.
pub struct QueueView {
    order: Vec<Track>,
    current: Option<Track>,
    paused: bool,
    progress: u64,
    window: SuppressionWindow,
    window_len: Duration,
}

fn incoming_order(snapshot: &Snapshot) -> Vec<Track> {
    if !snapshot.combined_list.is_empty() {
        return snapshot.combined_list.clone();
    }
    snapshot
        .playlist
        .iter()
        .chain(snapshot.fallback.iter())
        .cloned()
        .collect()
}

fn id_set(tracks: &[Track]) -> BTreeSet<u64> {
    tracks.iter().map(|t| t.id).collect()
}

impl QueueView {
    pub fn new(window_len: Duration) -> Self {
        Self {
            order: Vec::new(),
            current: None,
            paused: true,
            progress: 0,
            window: SuppressionWindow::default(),
            window_len,
        }
    }

    pub fn order(&self) -> &[Track] {
        &self.order
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn is_suppressed(&self) -> bool {
        self.window.is_suppressed()
    }

    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> ViewUpdate {
        let incoming = incoming_order(snapshot);
        let current_changed =
            self.current.as_ref().map(|t| t.id) != snapshot.current_id();

        self.current = snapshot.current.clone();
        self.paused = snapshot.paused;
        self.progress = snapshot.progress;

        if self.window.is_suppressed() {
            let membership_changed = id_set(&self.order) != id_set(&incoming);
            if !current_changed && !membership_changed {
                return ViewUpdate::OrderHeld;
            }
            debug!(
                "queue: snapshot changes more than order (current: {}, members: {}), applying",
                current_changed, membership_changed
            );
            self.window.end();
        }
        self.order = incoming;
        ViewUpdate::Full
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.order.iter().position(|t| t.id == id)
    }

    fn moved(&mut self, command: Command) -> Option<Command> {
        self.window.begin_suppression(self.window_len);
        Some(command)
    }

    pub fn move_to_top(&mut self, id: u64) -> Option<Command> {
        let idx = self.position(id)?;
        let track = self.order.remove(idx);
        self.order.insert(0, track);
        self.moved(Command::MoveToTop(id))
    }

    pub fn move_to_end(&mut self, id: u64) -> Option<Command> {
        let idx = self.position(id)?;
        let track = self.order.remove(idx);
        self.order.push(track);
        self.moved(Command::MoveToEnd(id))
    }

    /// Swap with the entry below.  `None` for the last entry.
    pub fn move_down(&mut self, id: u64) -> Option<Command> {
        let idx = self.position(id)?;
        if idx + 1 >= self.order.len() {
            return None;
        }
        self.order.swap(idx, idx + 1);
        self.moved(Command::MoveDown(id))
    }

    /// Server-side removal; no local change.
    pub fn cancel(&self, id: u64) -> Option<Command> {
        self.position(id).map(|_| Command::Cancel(id))
    }

    pub fn toggle_fallback(&self, id: u64) -> Option<Command> {
        let track = self.order.iter().find(|t| t.id == id)?;
        Some(if track.is_fallback {
            Command::UnsetIsFallback(id)
        } else {
            Command::SetIsFallback(id)
        })
    }
}
