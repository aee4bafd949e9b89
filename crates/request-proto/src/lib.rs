//! Wire types, client configuration and platform paths shared by the
//! request player.

pub mod config;
pub mod platform;
pub mod protocol;
