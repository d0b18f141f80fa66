use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::stream::StreamBuffer;

use super::lifecycle::{self, LifecycleEvent};
use super::{
    Endpoint, ReconnectState, Secret, Session, SessionId, SessionKind, SessionSpec, SessionStatus,
};

/// Field changes applied on top of the current record.
///
/// `None` leaves a field as is; the nested options of `error_message` and
/// `reconnect` allow clearing.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub label: Option<String>,
    pub error_message: Option<Option<String>>,
    pub reconnect: Option<Option<ReconnectState>>,
    pub latency_ms: Option<u64>,
    pub dropped_bytes_total: Option<u64>,
}

impl SessionPatch {
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn with_reconnect(mut self, reconnect: Option<ReconnectState>) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn with_dropped_total(mut self, total: u64) -> Self {
        self.dropped_bytes_total = Some(total);
        self
    }

    fn apply(self, session: &Session, status: SessionStatus) -> Session {
        let mut next = session.clone();
        next.status = status;
        next.last_activity = Utc::now();
        if status != SessionStatus::Error {
            next.error_message = None;
        }
        if let Some(label) = self.label {
            next.label = label;
        }
        if let Some(message) = self.error_message {
            next.error_message = message;
        }
        if let Some(reconnect) = self.reconnect {
            next.reconnect = reconnect;
        }
        if let Some(ms) = self.latency_ms {
            next.latency_ms = Some(ms);
        }
        if let Some(total) = self.dropped_bytes_total {
            next.dropped_bytes_total = total;
        }
        next
    }
}

/// Cancellable background work owned by one session
pub(crate) struct TaskHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(work(token.clone()));
        Self { token, handle }
    }

    pub fn cancel(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// What the transport needs to (re)open a session
#[derive(Debug, Clone)]
pub(crate) enum ConnectTarget {
    Remote { endpoint: Endpoint, secret: Secret },
    Local { cwd: Option<PathBuf> },
}

/// Registry record: the read model plus what the session exclusively owns
pub(crate) struct SessionEntry {
    pub session: Session,
    pub secret: Secret,
    pub task: Option<TaskHandle>,
    pub buffer: Option<StreamBuffer>,
    /// Bumped whenever a task is armed or cancelled; late results carry a stale value
    pub epoch: u64,
}

impl SessionEntry {
    /// Cancel pending work and invalidate its outstanding results
    pub fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        self.epoch += 1;
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn target(&self) -> ConnectTarget {
        match &self.session.endpoint {
            Some(endpoint) => ConnectTarget::Remote {
                endpoint: endpoint.clone(),
                secret: self.secret.clone(),
            },
            None => ConnectTarget::Local {
                cwd: self.session.cwd.clone(),
            },
        }
    }
}

/// In-memory store of sessions, the single source of truth for their state.
///
/// Not shared: it lives inside the session manager task and every mutation
/// goes through that task's queue.
#[derive(Default)]
pub struct SessionRegistry {
    entries: HashMap<SessionId, SessionEntry>,
    order: Vec<SessionId>,
    changed: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record in `connecting`. Invalid specs are rejected untouched.
    pub fn open(&mut self, spec: SessionSpec) -> Result<SessionId> {
        let endpoint = spec.endpoint()?;
        let id = SessionId::new();
        let label = spec.label.clone().unwrap_or_else(|| spec.default_label());

        let session = Session {
            id,
            kind: spec.kind,
            label,
            endpoint,
            cwd: match spec.kind {
                SessionKind::Local => spec.cwd.clone(),
                SessionKind::Remote => None,
            },
            status: SessionStatus::Connecting,
            last_activity: Utc::now(),
            error_message: None,
            reconnect: None,
            latency_ms: None,
            dropped_bytes_total: 0,
        };

        self.entries.insert(
            id,
            SessionEntry {
                session,
                secret: spec.secret,
                task: None,
                buffer: None,
                epoch: 0,
            },
        );
        self.order.push(id);
        self.changed = true;
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.entries.get(&id).map(|e| &e.session)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Snapshot in creation order
    pub fn list_all(&self) -> Vec<Session> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.session.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace a record's non-status fields
    pub fn update(&mut self, id: SessionId, patch: SessionPatch) -> Result<&Session> {
        let entry = self.entries.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        entry.session = patch.apply(&entry.session, entry.session.status);
        self.changed = true;
        Ok(&entry.session)
    }

    /// Move a record through the state machine, applying `patch` alongside
    pub fn transition(
        &mut self,
        id: SessionId,
        event: LifecycleEvent,
        patch: SessionPatch,
    ) -> Result<&Session> {
        let entry = self.entries.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        let status = lifecycle::transition(entry.session.status, event)?;
        entry.session = patch.apply(&entry.session, status);
        self.changed = true;
        Ok(&entry.session)
    }

    /// Refresh `last_activity` on data flow without flagging a snapshot
    pub fn touch(&mut self, id: SessionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.session.last_activity = Utc::now();
        }
    }

    /// Delete a record, cancelling its pending work and dropping its buffer
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let mut entry = self.entries.remove(&id)?;
        entry.cancel_task();
        entry.buffer = None;
        self.order.retain(|other| *other != id);
        self.changed = true;
        Some(entry.session)
    }

    /// Whether anything observable changed since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub(crate) fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub(crate) fn entry(&self, id: SessionId) -> Option<&SessionEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: SessionId) -> Option<&mut SessionEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = (&SessionId, &mut SessionEntry)> {
        self.entries.iter_mut()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CloseReason;

    fn remote() -> SessionSpec {
        SessionSpec::remote("10.0.0.5", 22, "admin")
    }

    #[test]
    fn test_open_creates_connecting_record() {
        let mut registry = SessionRegistry::new();
        let id = registry.open(remote()).unwrap();
        let session = registry.get(id).unwrap();

        assert_eq!(session.status, SessionStatus::Connecting);
        assert_eq!(session.label, "admin@10.0.0.5");
        assert_eq!(session.endpoint.as_ref().unwrap().port, 22);
        assert!(session.reconnect.is_none());
        assert!(registry.take_changed());
    }

    #[test]
    fn test_open_rejects_invalid_spec_without_mutation() {
        let mut registry = SessionRegistry::new();
        for spec in [
            SessionSpec::remote("", 22, "admin"),
            SessionSpec::remote("host", 22, "  "),
            SessionSpec::remote("host", 0, "admin"),
            SessionSpec::remote("host", 70_000, "admin"),
        ] {
            assert!(matches!(
                registry.open(spec),
                Err(SessionError::InvalidSpec(_))
            ));
        }
        assert!(registry.is_empty());
        assert!(!registry.take_changed());
    }

    #[test]
    fn test_local_spec_needs_no_endpoint() {
        let mut registry = SessionRegistry::new();
        let id = registry
            .open(SessionSpec::local(Some(PathBuf::from("/tmp"))))
            .unwrap();
        let session = registry.get(id).unwrap();
        assert_eq!(session.kind, SessionKind::Local);
        assert!(session.endpoint.is_none());
        assert_eq!(session.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_transition_replaces_record_and_clears_error() {
        let mut registry = SessionRegistry::new();
        let id = registry.open(remote()).unwrap();

        registry
            .transition(
                id,
                LifecycleEvent::ConnectFailed,
                SessionPatch::default().with_error("refused"),
            )
            .unwrap();
        let failed = registry.get(id).unwrap().clone();
        assert_eq!(failed.status, SessionStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("refused"));

        let retried = registry
            .transition(id, LifecycleEvent::Retry, SessionPatch::default())
            .unwrap();
        assert_eq!(retried.status, SessionStatus::Connecting);
        assert!(retried.error_message.is_none());
        assert!(retried.last_activity >= failed.last_activity);
    }

    #[test]
    fn test_illegal_transition_leaves_record_alone() {
        let mut registry = SessionRegistry::new();
        let id = registry.open(remote()).unwrap();
        registry.take_changed();

        let err = registry
            .transition(
                id,
                LifecycleEvent::Closed(CloseReason::Network),
                SessionPatch::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition { .. }));
        assert_eq!(registry.get(id).unwrap().status, SessionStatus::Connecting);
        assert!(!registry.take_changed());
    }

    #[test]
    fn test_update_keeps_status() {
        let mut registry = SessionRegistry::new();
        let id = registry.open(remote()).unwrap();
        let session = registry
            .update(id, SessionPatch::default().with_label("db primary"))
            .unwrap();
        assert_eq!(session.label, "db primary");
        assert_eq!(session.status, SessionStatus::Connecting);
    }

    #[test]
    fn test_remove_and_unknown_ids() {
        let mut registry = SessionRegistry::new();
        let a = registry.open(remote()).unwrap();
        let b = registry.open(SessionSpec::local(None)).unwrap();

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert!(matches!(
            registry.update(a, SessionPatch::default()),
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(registry.ids(), vec![b]);
        assert_eq!(registry.list_all().len(), 1);
    }
}
