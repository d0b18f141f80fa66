use crossterm::event::KeyEvent;

use crate::session::{Session, SessionId, SessionSpec};

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// The session manager published a new list
    SessionsUpdated(Vec<Session>),
    /// An error occurred
    Error(String),
    /// Redraw; output may have arrived
    Tick,
    OpenSession(SessionSpec),
    RetrySession(SessionId),
    CancelReconnect(SessionId),
    DisconnectSession(SessionId),
    RemoveSession(SessionId),
    RenameSession(SessionId, String),
    /// Keystrokes for an attached session
    SendInput(SessionId, Vec<u8>),
    /// New output pane size (cols, rows)
    ResizeSession(SessionId, u16, u16),
}
