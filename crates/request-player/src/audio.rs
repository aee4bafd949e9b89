//! The audio element seam.
//!
//! The recovery controller drives playback through `AudioElement` and learns
//! what happened through `AudioEvent`s posted into the core loop.  Calls are
//! fire-and-forget: a rejected play or a load error comes back as an event,
//! never as a return value.

use thiserror::Error;

pub trait AudioElement: Send {
    /// Replace the source and seek to `start_secs` once it loads.  Does not
    /// change the paused state.
    fn load(&mut self, url: &str, start_secs: u64);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, secs: u64);
    /// Effective output volume, 0.0..=1.0.
    fn set_volume(&mut self, volume: f64);
    /// Unload the source.  No further events are expected for it.
    fn stop(&mut self);
}

/// Error surfaced by the element for the current source.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    #[error("no source loaded")]
    EmptySource,
    #[error("load interrupted by a newer load")]
    Interrupted,
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("playback error: {0}")]
    Other(String),
}

impl PlaybackError {
    /// Benign errors are artefacts of our own source changes and are only
    /// logged.  Everything else counts against the retry budget.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::EmptySource | Self::Interrupted)
    }
}

/// Why the element refused to start playing.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayRejection {
    /// Output needs an explicit user action first.
    NotAllowed,
    /// The element cannot play this source at all.
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Playing,
    Paused,
    /// Playback position in seconds.
    TimeUpdate(f64),
    Ended,
    Error(PlaybackError),
    PlayRejected(PlayRejection),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(PlaybackError::EmptySource.is_benign());
        assert!(PlaybackError::Interrupted.is_benign());
        assert!(!PlaybackError::Network("reset".into()).is_benign());
        assert!(!PlaybackError::Decode("bad frame".into()).is_benign());
        assert!(!PlaybackError::Other("?".into()).is_benign());
    }
}
