//! Terminal surface: renders the published `PlayerView` and turns keys into
//! `UserAction`s for the core.

use std::io;
use std::time::Duration;

use ratatui::crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::Modifier,
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use request_proto::protocol::Track;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use unicode_width::UnicodeWidthChar;

use crate::core::{CoreEvent, PlayerView, UserAction};
use crate::theme::*;

const SCROLL_GAP: &str = "   ·   ";

enum UiMessage {
    Key(KeyEvent),
    Resize,
}

pub struct PlayerUi {
    view_rx: watch::Receiver<PlayerView>,
    core_tx: mpsc::Sender<CoreEvent>,
    list_state: ListState,
    /// Banner marquee offset in columns.
    scroll: usize,
    banner_text: String,
    should_quit: bool,
}

impl PlayerUi {
    pub fn new(view_rx: watch::Receiver<PlayerView>, core_tx: mpsc::Sender<CoreEvent>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));
        Self {
            view_rx,
            core_tx,
            list_state,
            scroll: 0,
            banner_text: String::new(),
            should_quit: false,
        }
    }

    // ── Main run loop ─────────────────────────────────────────────────────────

    pub async fn run(mut self) -> anyhow::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let (tx, mut rx) = mpsc::channel::<UiMessage>(256);
        // Polls so the reader notices when the surface has gone away.
        tokio::task::spawn_blocking(move || loop {
            if tx.is_closed() {
                break;
            }
            match event::poll(Duration::from_millis(200)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => break,
            }
            let msg = match event::read() {
                Ok(Event::Key(key)) => UiMessage::Key(key),
                Ok(Event::Resize(_, _)) => UiMessage::Resize,
                Ok(_) => continue,
                Err(_) => break,
            };
            if tx.blocking_send(msg).is_err() {
                break;
            }
        });

        // Banner marquee.
        let mut tick = tokio::time::interval(Duration::from_millis(150));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = self.event_loop(&mut terminal, &mut rx, &mut tick).await;

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
        rx: &mut mpsc::Receiver<UiMessage>,
        tick: &mut tokio::time::Interval,
    ) -> anyhow::Result<()> {
        let mut needs_redraw = true;
        loop {
            if needs_redraw {
                let view = self.view_rx.borrow().clone();
                terminal.draw(|f| self.draw(f, &view))?;
            }
            needs_redraw = false;

            if self.should_quit {
                break;
            }

            tokio::select! {
                changed = self.view_rx.changed() => {
                    if changed.is_err() {
                        debug!("ui: core gone");
                        break;
                    }
                    needs_redraw = true;
                }
                msg = rx.recv() => match msg {
                    Some(UiMessage::Key(key)) => {
                        needs_redraw = self.handle_key(key).await;
                    }
                    Some(UiMessage::Resize) => needs_redraw = true,
                    None => break,
                },
                _ = tick.tick() => {
                    needs_redraw = self.advance_marquee();
                }
            }
        }
        Ok(())
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    async fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        let queue_len = self.view_rx.borrow().queue.len();
        let selected = self.selected_id();

        let action = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                return true;
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
                return true;
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.select_by(1, queue_len);
                return true;
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.select_by(-1, queue_len);
                return true;
            }
            KeyCode::Char(' ') => Some(UserAction::Play),
            KeyCode::Char('p') => Some(UserAction::TogglePause),
            KeyCode::Char('+') | KeyCode::Char('=') => Some(UserAction::VolumeUp),
            KeyCode::Char('-') => Some(UserAction::VolumeDown),
            KeyCode::Char('t') => selected.map(UserAction::MoveToTop),
            KeyCode::Char('e') => selected.map(UserAction::MoveToEnd),
            KeyCode::Char('d') => selected.map(UserAction::MoveDown),
            KeyCode::Char('x') => selected.map(UserAction::Cancel),
            KeyCode::Char('f') => selected.map(UserAction::ToggleFallback),
            _ => None,
        };

        if let Some(action) = action {
            debug!("ui: {:?}", action);
            if self.core_tx.send(CoreEvent::User(action)).await.is_err() {
                self.should_quit = true;
            }
        }
        false
    }

    fn selected_id(&self) -> Option<u64> {
        let view = self.view_rx.borrow();
        let id = self
            .list_state
            .selected()
            .and_then(|i| view.queue.get(i))
            .map(|t| t.id);
        id
    }

    fn select_by(&mut self, delta: isize, len: usize) {
        if len == 0 {
            self.list_state.select(Some(0));
            return;
        }
        let cur = self.list_state.selected().unwrap_or(0) as isize;
        let next = (cur + delta).clamp(0, len as isize - 1);
        self.list_state.select(Some(next as usize));
    }

    fn advance_marquee(&mut self) -> bool {
        let text = self.view_rx.borrow().banner.text.clone();
        if text != self.banner_text {
            self.banner_text = text;
            self.scroll = 0;
            return true;
        }
        if self.banner_text.is_empty() {
            return false;
        }
        self.scroll = self.scroll.wrapping_add(1);
        true
    }

    // ── Drawing ───────────────────────────────────────────────────────────────

    fn draw(&mut self, frame: &mut Frame, view: &PlayerView) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(4),
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(frame.area());

        self.draw_header(frame, rows[0], view);
        self.draw_now_playing(frame, rows[1], view);
        self.draw_banner(frame, rows[2], view);
        self.draw_queue(frame, rows[3], view);
        draw_help(frame, rows[4]);
    }

    fn draw_header(&self, frame: &mut Frame, area: Rect, view: &PlayerView) {
        let (badge, badge_style) = state_badge(view.state);
        let mut spans = vec![
            Span::styled(" request-player ", style_default().add_modifier(Modifier::BOLD)),
            Span::styled(format!("[{}]", badge), badge_style),
        ];
        if !view.connected {
            spans.push(Span::styled("  offline", style_offline()));
        }
        if view.reordering {
            spans.push(Span::styled("  reordering…", style_secondary()));
        }
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn draw_now_playing(&self, frame: &mut Frame, area: Rect, view: &PlayerView) {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(style_border())
            .title(Span::styled(" now playing ", style_secondary()));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let lines = match &view.current {
            None => vec![Line::from(Span::styled("nothing queued", style_muted()))],
            Some(track) => {
                let duration = track
                    .duration()
                    .map(|d| format_secs(d.max(0.0) as u64))
                    .unwrap_or_else(|| "--:--".to_string());
                let loudness = match view.loudness_db {
                    Some(db) => format!("{:.1} dB", db),
                    None => "measuring".to_string(),
                };
                vec![
                    Line::from(vec![
                        Span::styled(track.title().to_string(), style_default().add_modifier(Modifier::BOLD)),
                        Span::styled(format!("  {}", track.singer()), style_secondary()),
                        Span::styled(format!("  ({})", track.user.display_name()), style_muted()),
                    ]),
                    Line::from(vec![
                        Span::styled(
                            format!("{} / {}", format_secs(view.position), duration),
                            style_default(),
                        ),
                        Span::styled(
                            format!(
                                "   loudness {}  target {:.0} dB  gain {:.3}  vol {:.0}%",
                                loudness,
                                view.target_db,
                                view.gain,
                                view.volume * 100.0
                            ),
                            style_secondary(),
                        ),
                    ]),
                ]
            }
        };
        frame.render_widget(Paragraph::new(lines), inner);
    }

    fn draw_banner(&self, frame: &mut Frame, area: Rect, view: &PlayerView) {
        let style = style_banner(view.banner.severity, view.banner.fading);
        let text = marquee(&view.banner.text, area.width as usize, self.scroll);
        frame.render_widget(Paragraph::new(Line::from(Span::styled(text, style))), area);
    }

    fn draw_queue(&mut self, frame: &mut Frame, area: Rect, view: &PlayerView) {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(style_border())
            .title(Span::styled(format!(" queue ({}) ", view.queue.len()), style_secondary()));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        if view.queue.is_empty() {
            frame.render_widget(
                Paragraph::new(Span::styled("queue is empty", style_muted())),
                inner,
            );
            return;
        }
        if self.list_state.selected().map_or(true, |i| i >= view.queue.len()) {
            self.list_state.select(Some(view.queue.len() - 1));
        }

        let items: Vec<ListItem> = view.queue.iter().enumerate().map(|(i, t)| queue_item(i, t)).collect();
        let list = List::new(items).highlight_style(style_selected());
        frame.render_stateful_widget(list, inner, &mut self.list_state);
    }
}

fn queue_item(index: usize, track: &Track) -> ListItem<'static> {
    let marker = if track.is_fallback {
        Span::styled(" F ", style_fallback())
    } else {
        Span::raw("   ")
    };
    ListItem::new(Line::from(vec![
        Span::styled(format!("{:>3}", index + 1), style_muted()),
        marker,
        Span::styled(track.title().to_string(), style_default()),
        Span::styled(format!("  {}", track.singer()), style_secondary()),
        Span::styled(format!("  {}", track.user.display_name()), style_muted()),
    ]))
}

fn draw_help(frame: &mut Frame, area: Rect) {
    let help = "space play  p pause  j/k select  t top  e end  d down  x cancel  f fallback  +/- vol  q quit";
    frame.render_widget(Paragraph::new(Span::styled(help, style_muted())), area);
}

fn format_secs(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Fit `text` into `width` columns.  Text that already fits is returned as
/// is; longer text scrolls left by `offset` columns and wraps around.
fn marquee(text: &str, width: usize, offset: usize) -> String {
    let total: usize = text.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= width || width == 0 {
        return text.to_string();
    }

    let cycle: Vec<char> = text.chars().chain(SCROLL_GAP.chars()).collect();
    let cycle_width: usize = cycle.iter().map(|c| c.width().unwrap_or(0)).sum();
    let mut skip = offset % cycle_width.max(1);

    let mut start = 0;
    while skip > 0 && start < cycle.len() {
        skip = skip.saturating_sub(cycle[start].width().unwrap_or(0));
        start += 1;
    }

    let mut out = String::new();
    let mut used = 0;
    for c in cycle.iter().cycle().skip(start) {
        let w = c.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        out.push(*c);
        used += w;
    }
    out
}
