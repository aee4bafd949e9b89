//! Cancelable scheduled tasks.
//!
//! Every delayed callback in the player (banner eviction, replace crossfade,
//! retry backoff, idle rotation) is a tokio sleep task that posts
//! `CoreEvent::Timer` back into the core loop.  The owner keeps the returned
//! `ScheduledTask`; replacing or dropping it aborts the sleeper.
//!
//! Aborting cannot recall a firing that is already queued in the channel, so
//! every firing carries the token of the task that produced it and owners
//! ignore firings whose token is not the one they currently hold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::core::CoreEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The banner head reached its timeout.
    BannerEvict,
    /// The replace crossfade elapsed; drop the old head.
    BannerReplace,
    /// Rotate the idle banner hint.
    IdleRotate,
    /// Retry backoff elapsed.
    PlaybackRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub token: u64,
}

/// Handle to a pending (or periodic) timer.  Aborts on drop.
#[derive(Debug)]
pub struct ScheduledTask {
    token: u64,
    handle: AbortHandle,
}

impl ScheduledTask {
    /// True when `fired` was produced by this task.
    pub fn is_source_of(&self, fired: TimerFired) -> bool {
        self.token == fired.token
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns timer tasks that report into the core's event channel.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<CoreEvent>,
    next_token: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(tx: mpsc::Sender<CoreEvent>) -> Self {
        Self {
            tx,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Fire `kind` once after `delay`.
    pub fn after(&self, delay: Duration, kind: TimerKind) -> ScheduledTask {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx
                .send(CoreEvent::Timer(TimerFired { kind, token }))
                .await
                .is_err()
            {
                debug!("timer {:?}#{}: core gone", kind, token);
            }
        });
        ScheduledTask {
            token,
            handle: handle.abort_handle(),
        }
    }

    /// Fire `kind` every `period`, first firing one period from now.
    pub fn every(&self, period: Duration, kind: TimerKind) -> ScheduledTask {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx
                    .send(CoreEvent::Timer(TimerFired { kind, token }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        ScheduledTask {
            token,
            handle: handle.abort_handle(),
        }
    }
}
