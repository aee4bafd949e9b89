pub mod audio;
pub mod channel;
pub mod core;
pub mod loudness;
pub mod mpv;
pub mod notifications;
pub mod recovery;
pub mod scheduler;
pub mod suppression;
pub mod theme;
pub mod ui;
