use crate::error::{Result, SessionError};
use crate::transport::CloseReason;

use super::SessionStatus;

/// Triggers that move a session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Manual retry of a settled session
    Retry,
    /// The transport reported a successful open
    Connected,
    /// The transport rejected the open or it timed out
    ConnectFailed,
    /// The transport closed an established channel
    Closed(CloseReason),
    /// The reconnect scheduler took over a dropped session
    ReconnectStarted,
    /// A scheduled attempt failed; `exhausted` when it was the last one
    AttemptFailed { exhausted: bool },
    /// User disconnect or reconnect cancellation
    Disconnect,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Retry => "retry",
            LifecycleEvent::Connected => "connected",
            LifecycleEvent::ConnectFailed => "connect-failed",
            LifecycleEvent::Closed(_) => "closed",
            LifecycleEvent::ReconnectStarted => "reconnect-started",
            LifecycleEvent::AttemptFailed { .. } => "attempt-failed",
            LifecycleEvent::Disconnect => "disconnect",
        }
    }
}

/// The transition function. Anything not listed is illegal.
///
/// ```text
/// connecting   --connected-------------> connected
/// connecting   --connect-failed--------> error
/// connecting   --attempt-failed--------> connecting | error (exhausted)
/// connected    --closed(user)----------> disconnected
/// connected    --closed(auth)----------> error
/// connected    --closed(other)---------> disconnected
/// disconnected --reconnect-started-----> connecting
/// disconnected | error --retry---------> connecting
/// any          --disconnect------------> disconnected
/// ```
pub fn transition(from: SessionStatus, event: LifecycleEvent) -> Result<SessionStatus> {
    use LifecycleEvent as E;
    use SessionStatus as S;

    let next = match (from, event) {
        (S::Connecting, E::Connected) => S::Connected,
        (S::Connecting, E::ConnectFailed) => S::Error,
        (S::Connecting, E::AttemptFailed { exhausted: false }) => S::Connecting,
        (S::Connecting, E::AttemptFailed { exhausted: true }) => S::Error,
        (S::Connected, E::Closed(CloseReason::Auth)) => S::Error,
        (S::Connected, E::Closed(_)) => S::Disconnected,
        (S::Disconnected, E::ReconnectStarted) => S::Connecting,
        (S::Disconnected | S::Error, E::Retry) => S::Connecting,
        (_, E::Disconnect) => S::Disconnected,
        (from, event) => {
            return Err(SessionError::IllegalTransition {
                from,
                event: event.name(),
            })
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_paths() {
        assert_eq!(
            transition(SessionStatus::Connecting, LifecycleEvent::Connected).unwrap(),
            SessionStatus::Connected
        );
        assert_eq!(
            transition(SessionStatus::Connecting, LifecycleEvent::ConnectFailed).unwrap(),
            SessionStatus::Error
        );
    }

    #[test]
    fn test_close_reasons() {
        let from = SessionStatus::Connected;
        assert_eq!(
            transition(from, LifecycleEvent::Closed(CloseReason::User)).unwrap(),
            SessionStatus::Disconnected
        );
        assert_eq!(
            transition(from, LifecycleEvent::Closed(CloseReason::Auth)).unwrap(),
            SessionStatus::Error
        );
        assert_eq!(
            transition(from, LifecycleEvent::Closed(CloseReason::Network)).unwrap(),
            SessionStatus::Disconnected
        );
    }

    #[test]
    fn test_reconnect_attempts() {
        let s = transition(SessionStatus::Disconnected, LifecycleEvent::ReconnectStarted).unwrap();
        assert_eq!(s, SessionStatus::Connecting);
        let s = transition(s, LifecycleEvent::AttemptFailed { exhausted: false }).unwrap();
        assert_eq!(s, SessionStatus::Connecting);
        let s = transition(s, LifecycleEvent::AttemptFailed { exhausted: true }).unwrap();
        assert_eq!(s, SessionStatus::Error);
    }

    #[test]
    fn test_retry_only_from_settled_states() {
        assert!(transition(SessionStatus::Error, LifecycleEvent::Retry).is_ok());
        assert!(transition(SessionStatus::Disconnected, LifecycleEvent::Retry).is_ok());
        assert!(transition(SessionStatus::Connected, LifecycleEvent::Retry).is_err());
        assert!(transition(SessionStatus::Connecting, LifecycleEvent::Retry).is_err());
    }

    #[test]
    fn test_late_close_while_connecting_is_illegal() {
        let err = transition(
            SessionStatus::Connecting,
            LifecycleEvent::Closed(CloseReason::Network),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition { .. }));
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        for from in [
            SessionStatus::Connecting,
            SessionStatus::Connected,
            SessionStatus::Disconnected,
            SessionStatus::Error,
        ] {
            assert_eq!(
                transition(from, LifecycleEvent::Disconnect).unwrap(),
                SessionStatus::Disconnected
            );
        }
    }
}
