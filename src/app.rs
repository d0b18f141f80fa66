use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};

use crate::actions::Action;
use crate::error::SessionError;
use crate::session::{Session, SessionKind, SessionSpec, SessionStatus};
use crate::view::TerminalView;

pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(97, 175, 239),
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Creating,
    Renaming,
    Confirming,
    /// Masked password entry for a pending remote session
    Password,
    /// Keystrokes go to the selected session
    Attached,
}

/// A parsed new-session prompt
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub spec: SessionSpec,
    /// `-p`: ask for a password before opening
    pub ask_password: bool,
}

/// Parse the new-session prompt: `user@host[:port] [-i keyfile] [-p]` or `local[:cwd]`
pub fn parse_session_target(input: &str) -> crate::error::Result<SessionTarget> {
    let input = input.trim();
    if input == "local" {
        return Ok(SessionTarget {
            spec: SessionSpec::local(None),
            ask_password: false,
        });
    }
    if let Some(cwd) = input.strip_prefix("local:") {
        let cwd = cwd.trim();
        let cwd = (!cwd.is_empty()).then(|| PathBuf::from(cwd));
        return Ok(SessionTarget {
            spec: SessionSpec::local(cwd),
            ask_password: false,
        });
    }

    let mut words = input.split_whitespace();
    let target = words
        .next()
        .ok_or_else(|| SessionError::InvalidSpec("expected user@host[:port]".to_string()))?;
    let mut key = None;
    let mut ask_password = false;
    while let Some(word) = words.next() {
        match word {
            "-i" => {
                let path = words
                    .next()
                    .ok_or_else(|| SessionError::InvalidSpec("-i needs a key file".to_string()))?;
                key = Some(path);
            }
            "-p" => ask_password = true,
            other => {
                return Err(SessionError::InvalidSpec(format!("unknown option '{}'", other)));
            }
        }
    }

    let (principal, rest) = target
        .split_once('@')
        .ok_or_else(|| SessionError::InvalidSpec("expected user@host[:port]".to_string()))?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u32>()
                .map_err(|_| SessionError::InvalidSpec(format!("bad port '{}'", port)))?;
            (host, port)
        }
        None => (rest, 22),
    };

    let mut spec = SessionSpec::remote(host, port, principal);
    if let Some(key) = key {
        spec = spec.with_key(key);
    }
    spec.validate()?;
    Ok(SessionTarget { spec, ask_password })
}

/// Bytes a terminal would send for `key`
pub fn key_to_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    let bytes: Vec<u8> = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            if !c.is_ascii_alphabetic() {
                return None;
            }
            vec![c.to_ascii_lowercase() as u8 - b'a' + 1]
        }
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            let mut out = Vec::new();
            if key.modifiers.contains(KeyModifiers::ALT) {
                out.push(0x1b);
            }
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            out
        }
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => b"\t".to_vec(),
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        _ => return None,
    };
    Some(bytes)
}

/// Coarse relative time, e.g. "3s ago"
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

fn is_detach(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char(']') && key.modifiers.contains(KeyModifiers::CONTROL)
}

/// Main application state
pub struct App {
    pub sessions: Vec<Session>,
    pub list_state: ListState,
    /// Current message to display (info or error)
    pub error_message: Option<String>,
    pub theme: Theme,
    pub input_mode: InputMode,
    pub input_buffer: String,
    pub pending_actions: Vec<Action>,
    /// Remote session waiting on its password
    pending_spec: Option<SessionSpec>,
    view: Arc<TerminalView>,
    /// Inner size of the output pane at the last draw
    output_size: (u16, u16),
}

impl App {
    pub fn new(view: Arc<TerminalView>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            sessions: Vec::new(),
            list_state,
            error_message: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            pending_actions: Vec::new(),
            pending_spec: None,
            view,
            output_size: (0, 0),
        }
    }

    pub fn selected_session(&self) -> Option<&Session> {
        self.list_state
            .selected()
            .and_then(|i| self.sessions.get(i))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::SessionsUpdated(sessions) => {
                self.sessions = sessions;
                if let Some(selected) = self.list_state.selected() {
                    if selected >= self.sessions.len() && !self.sessions.is_empty() {
                        self.list_state.select(Some(self.sessions.len() - 1));
                    }
                }
                // the attached session went away or stopped accepting input
                if self.input_mode == InputMode::Attached
                    && self.selected_session().map(|s| s.status) != Some(SessionStatus::Connected)
                {
                    self.input_mode = InputMode::Normal;
                    self.error_message = Some("Detached: session is no longer connected".to_string());
                }
                Ok(false)
            }
            Action::Error(msg) => {
                self.error_message = Some(msg);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if self.error_message.is_some() && self.input_mode == InputMode::Normal {
            self.error_message = None;
        }

        match self.input_mode {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Creating | InputMode::Renaming => self.handle_text_key(key),
            InputMode::Confirming => self.handle_confirming_key(key),
            InputMode::Password => self.handle_password_key(key),
            InputMode::Attached => self.handle_attached_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        let selected = self.selected_session().cloned();
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(true);
            }
            KeyCode::Char('j') | KeyCode::Down => self.next_session(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_session(),
            KeyCode::Char('n') => {
                self.input_mode = InputMode::Creating;
                self.input_buffer.clear();
            }
            KeyCode::Enter => match selected {
                Some(session) if session.status == SessionStatus::Connected => {
                    self.input_mode = InputMode::Attached;
                    let (cols, rows) = self.output_size;
                    if cols > 0 && rows > 0 {
                        self.pending_actions
                            .push(Action::ResizeSession(session.id, cols, rows));
                    }
                }
                Some(_) => {
                    self.error_message = Some("Session is not connected".to_string());
                }
                None => {}
            },
            KeyCode::Char('r') => {
                if let Some(session) = selected {
                    self.pending_actions.push(Action::RetrySession(session.id));
                }
            }
            KeyCode::Char('c') => {
                if let Some(session) = selected.filter(|s| s.reconnect.is_some()) {
                    self.pending_actions.push(Action::CancelReconnect(session.id));
                }
            }
            KeyCode::Char('x') => {
                if let Some(session) = selected {
                    self.pending_actions
                        .push(Action::DisconnectSession(session.id));
                }
            }
            KeyCode::Char('e') => {
                if let Some(session) = selected {
                    self.input_buffer = session.label;
                    self.input_mode = InputMode::Renaming;
                }
            }
            KeyCode::Char('d') => {
                if selected.is_some() {
                    self.input_mode = InputMode::Confirming;
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_text_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let text = std::mem::take(&mut self.input_buffer);
                let mode = std::mem::replace(&mut self.input_mode, InputMode::Normal);
                if text.trim().is_empty() {
                    return Ok(false);
                }
                if mode == InputMode::Renaming {
                    if let Some(session) = self.selected_session() {
                        self.pending_actions
                            .push(Action::RenameSession(session.id, text));
                    }
                } else {
                    match parse_session_target(&text) {
                        Ok(SessionTarget {
                            spec,
                            ask_password: true,
                        }) => {
                            self.pending_spec = Some(spec);
                            self.input_mode = InputMode::Password;
                        }
                        Ok(target) => self.pending_actions.push(Action::OpenSession(target.spec)),
                        Err(e) => self.error_message = Some(e.to_string()),
                    }
                }
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => {
                if !c.is_control() {
                    self.input_buffer.push(c);
                }
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_password_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let password = std::mem::take(&mut self.input_buffer);
                self.input_mode = InputMode::Normal;
                if let Some(spec) = self.pending_spec.take() {
                    self.pending_actions
                        .push(Action::OpenSession(spec.with_password(password)));
                }
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.pending_spec = None;
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => {
                if !c.is_control() {
                    self.input_buffer.push(c);
                }
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                if let Some(session) = self.selected_session() {
                    self.pending_actions.push(Action::RemoveSession(session.id));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_attached_key(&mut self, key: KeyEvent) -> Result<bool> {
        if is_detach(&key) {
            self.input_mode = InputMode::Normal;
            return Ok(false);
        }
        let Some(id) = self.selected_session().map(|s| s.id) else {
            self.input_mode = InputMode::Normal;
            return Ok(false);
        };
        if let Some(bytes) = key_to_bytes(key) {
            self.pending_actions.push(Action::SendInput(id, bytes));
        }
        Ok(false)
    }

    fn next_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i + 1 < self.sessions.len() => i + 1,
            _ => 0,
        };
        self.list_state.select(Some(i));
    }

    fn previous_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.sessions.len() - 1,
            Some(i) => i - 1,
        };
        self.list_state.select(Some(i));
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        match self.input_mode {
            InputMode::Creating => self.render_text_dialog(
                frame,
                " New Session ",
                "user@host[:port] [-i keyfile] [-p] or local[:cwd]",
            ),
            InputMode::Password => self.render_text_dialog(frame, " Password ", "Password:"),
            InputMode::Renaming => self.render_text_dialog(frame, " Rename Session ", "New label:"),
            InputMode::Confirming => self.render_confirm_dialog(frame),
            InputMode::Normal | InputMode::Attached => {}
        }
    }

    fn status_style(&self, status: SessionStatus) -> (&'static str, Style) {
        match status {
            SessionStatus::Connected => ("● ", Style::default().fg(self.theme.success)),
            SessionStatus::Connecting => ("◌ ", Style::default().fg(self.theme.warning)),
            SessionStatus::Disconnected => ("○ ", Style::default().fg(self.theme.dim)),
            SessionStatus::Error => ("✗ ", Style::default().fg(self.theme.error)),
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let connected = self
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Connected)
            .count();
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " shelldeck ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("│ {} sessions, {} connected", self.sessions.len(), connected),
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(30), // Session list
                Constraint::Percentage(70), // Detail + output
            ])
            .split(area);

        self.render_session_list(frame, chunks[0]);
        self.render_detail_pane(frame, chunks[1]);
    }

    fn render_session_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.sessions.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No sessions. Press 'n' to open one.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.sessions
                .iter()
                .map(|session| {
                    let (icon, style) = self.status_style(session.status);
                    let mut spans = vec![
                        Span::styled(icon, style),
                        Span::styled(session.label.clone(), Style::default().fg(self.theme.fg)),
                    ];
                    if let Some(reconnect) = &session.reconnect {
                        spans.push(Span::styled(
                            format!(" ↻ {}s", reconnect.next_attempt_delay_ms.div_ceil(1000)),
                            Style::default().fg(self.theme.warning),
                        ));
                    }
                    ListItem::new(Line::from(spans))
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Sessions ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn detail_lines(&self, session: &Session) -> Vec<Line<'static>> {
        let label = |text: &'static str| Span::styled(text, Style::default().fg(self.theme.dim));
        let value = |text: String| Span::styled(text, Style::default().fg(self.theme.fg));
        let (_, status_style) = self.status_style(session.status);

        let target = match (&session.kind, &session.endpoint) {
            (SessionKind::Remote, Some(endpoint)) => endpoint.to_string(),
            _ => session
                .cwd
                .as_ref()
                .map(|cwd| format!("local shell in {}", cwd.display()))
                .unwrap_or_else(|| "local shell".to_string()),
        };

        let mut lines = vec![
            Line::from(vec![label("Target: "), value(target)]),
            Line::from(vec![label("ID: "), value(session.id.short())]),
            Line::from(vec![
                label("Status: "),
                Span::styled(session.status.to_string(), status_style),
            ]),
            Line::from(vec![
                label("Last activity: "),
                value(format_age(session.last_activity, Utc::now())),
            ]),
        ];
        if let Some(ms) = session.latency_ms {
            lines.push(Line::from(vec![label("Latency: "), value(format!("{} ms", ms))]));
        }
        if let Some(reconnect) = &session.reconnect {
            lines.push(Line::from(vec![
                label("Reconnect: "),
                Span::styled(
                    format!(
                        "reconnecting in {}s, attempt {}/{} ({})",
                        reconnect.next_attempt_delay_ms.div_ceil(1000),
                        reconnect.attempt_number,
                        reconnect.max_attempts,
                        reconnect.reason
                    ),
                    Style::default().fg(self.theme.warning),
                ),
            ]));
        }
        if session.dropped_bytes_total > 0 {
            lines.push(Line::from(vec![
                label("Dropped output: "),
                value(format!("{} bytes", session.dropped_bytes_total)),
            ]));
        }
        if let Some(error) = &session.error_message {
            lines.push(Line::from(vec![
                label("Error: "),
                Span::styled(error.clone(), Style::default().fg(self.theme.error)),
            ]));
        }
        lines
    }

    fn render_detail_pane(&mut self, frame: &mut Frame, area: Rect) {
        let Some(session) = self.selected_session().cloned() else {
            let hint = Paragraph::new(vec![
                Line::from(Span::styled(
                    "No session selected",
                    Style::default().fg(self.theme.dim),
                )),
                Line::from(""),
                Line::from(Span::styled(
                    "Press 'n' to open a session",
                    Style::default().fg(self.theme.dim),
                )),
            ])
            .block(
                Block::default()
                    .title(" Details ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            );
            frame.render_widget(hint, area);
            return;
        };

        let lines = self.detail_lines(&session);
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(lines.len() as u16 + 2),
                Constraint::Min(0),
            ])
            .split(area);

        let detail = Paragraph::new(lines).block(
            Block::default()
                .title(format!(" {} ", session.label))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(detail, chunks[0]);

        let attached = self.input_mode == InputMode::Attached;
        let block = Block::default()
            .title(if attached {
                " Output (attached, Ctrl-] to detach) "
            } else {
                " Output "
            })
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if attached {
                self.theme.accent
            } else {
                self.theme.dim
            }));
        let inner = block.inner(chunks[1]);

        let size = (inner.width, inner.height);
        if size != self.output_size {
            self.output_size = size;
            if attached && size.0 > 0 && size.1 > 0 {
                self.pending_actions
                    .push(Action::ResizeSession(session.id, size.0, size.1));
            }
        }

        let output: Vec<Line> = self
            .view
            .tail(session.id, inner.height as usize)
            .into_iter()
            .map(Line::from)
            .collect();
        frame.render_widget(Paragraph::new(output).block(block), chunks[1]);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text = match self.input_mode {
            InputMode::Attached => " Ctrl-]: Detach │ keys are sent to the session ",
            _ => " q: Quit │ j/k: Navigate │ Enter: Attach │ n: New │ r: Retry │ c: Cancel reconnect │ x: Disconnect │ e: Rename │ d: Remove ",
        };

        let content = if let Some(ref msg) = self.error_message {
            Line::from(Span::styled(
                format!(" {} ", msg),
                Style::default().fg(self.theme.error),
            ))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_text_dialog(&self, frame: &mut Frame, title: &str, prompt: &str) {
        let area = centered_rect(50, 20, frame.area());
        let shown = match self.input_mode {
            InputMode::Password => "•".repeat(self.input_buffer.chars().count()),
            _ => self.input_buffer.clone(),
        };

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(title.to_string())
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                prompt.to_string(),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                format!("▶ {}_", shown),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press Enter to confirm, Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Confirm Remove ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let session_label = self
            .selected_session()
            .map(|s| s.label.as_str())
            .unwrap_or("unknown");

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Remove session '{}'?", session_label),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "The connection is closed and its output discarded.",
                Style::default().fg(self.theme.warning),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
