//! Color palette and style constants for the player surface.

use ratatui::style::{Color, Modifier, Style};

use crate::notifications::Severity;
use crate::recovery::PlaybackState;

// ── Color palette ─────────────────────────────────────────────────────────────

pub const C_ACCENT: Color = Color::Rgb(255, 95, 95);
pub const C_PLAYING: Color = Color::Rgb(80, 200, 120);
pub const C_PENDING: Color = Color::Rgb(255, 184, 80);
pub const C_ERROR: Color = Color::Rgb(255, 80, 80);
pub const C_MUTED: Color = Color::Rgb(72, 72, 88);
pub const C_SECONDARY: Color = Color::Rgb(115, 115, 138);
pub const C_PRIMARY: Color = Color::Rgb(210, 210, 225);
pub const C_SELECTION_BG: Color = Color::Rgb(28, 28, 40);
pub const C_PANEL_BORDER: Color = Color::Rgb(40, 40, 52);
pub const C_FALLBACK: Color = Color::Rgb(80, 140, 200);
pub const C_BANNER_INFO: Color = Color::Rgb(80, 160, 220);
pub const C_BANNER_SUCCESS: Color = Color::Rgb(80, 200, 120);
pub const C_BANNER_ERROR: Color = Color::Rgb(255, 95, 95);

// ── Predefined styles ─────────────────────────────────────────────────────────

pub fn style_default() -> Style {
    Style::default().fg(C_PRIMARY)
}

pub fn style_secondary() -> Style {
    Style::default().fg(C_SECONDARY)
}

pub fn style_muted() -> Style {
    Style::default().fg(C_MUTED)
}

pub fn style_border() -> Style {
    Style::default().fg(C_PANEL_BORDER)
}

pub fn style_selected() -> Style {
    Style::default()
        .bg(C_SELECTION_BG)
        .fg(C_PRIMARY)
        .add_modifier(Modifier::BOLD)
}

pub fn style_banner(severity: Option<Severity>, fading: bool) -> Style {
    let color = match severity {
        None => C_SECONDARY,
        Some(Severity::Info) => C_BANNER_INFO,
        Some(Severity::Success) => C_BANNER_SUCCESS,
        Some(Severity::Error) => C_BANNER_ERROR,
    };
    let style = Style::default().fg(color);
    if fading {
        style.add_modifier(Modifier::DIM)
    } else {
        style.add_modifier(Modifier::BOLD)
    }
}

pub fn state_badge(state: PlaybackState) -> (&'static str, Style) {
    match state {
        PlaybackState::Idle => ("IDLE", style_muted()),
        PlaybackState::Playing => ("PLAY", Style::default().fg(C_PLAYING)),
        PlaybackState::Paused => ("PAUSE", style_secondary()),
        PlaybackState::AwaitingGesture => (
            "PRESS SPACE",
            Style::default().fg(C_ACCENT).add_modifier(Modifier::BOLD),
        ),
        PlaybackState::Retrying => ("RETRY", Style::default().fg(C_PENDING)),
    }
}

pub fn style_offline() -> Style {
    Style::default().fg(C_ERROR)
}

pub fn style_fallback() -> Style {
    Style::default().fg(C_FALLBACK)
}
