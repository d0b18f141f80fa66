use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::stream::StreamBuffer;
use crate::transport::{CloseReason, Transport, TransportEvent};
use crate::view::RenderSink;

use super::lifecycle::LifecycleEvent;
use super::reconnect::ReconnectScheduler;
use super::registry::{ConnectTarget, SessionPatch, SessionRegistry, TaskHandle};
use super::{Session, SessionId, SessionSpec, SessionStatus};

/// One open attempt against the transport, bounded by `timeout`
pub(crate) async fn connect(
    transport: &dyn Transport,
    id: SessionId,
    target: &ConnectTarget,
    timeout: Duration,
) -> Result<()> {
    let attempt = async {
        match target {
            ConnectTarget::Remote { endpoint, secret } => {
                transport.open_remote(id, endpoint, secret).await
            }
            ConnectTarget::Local { cwd } => transport.open_local(id, cwd.as_deref()).await,
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err @ SessionError::ConnectFailure(_))) => Err(err),
        Ok(Err(other)) => Err(SessionError::ConnectFailure(other.to_string())),
        Err(_) => Err(SessionError::ConnectTimeout(timeout.as_secs())),
    }
}

/// Results reported back by per-session background tasks
#[derive(Debug)]
pub(crate) enum Internal {
    ConnectResolved {
        id: SessionId,
        epoch: u64,
        outcome: Result<()>,
    },
    ReconnectCountdown {
        id: SessionId,
        epoch: u64,
        remaining_ms: u64,
    },
    ReconnectAttempt {
        id: SessionId,
        epoch: u64,
        outcome: Result<()>,
    },
}

#[derive(Debug)]
enum Control {
    Retry,
    CancelReconnect,
    Disconnect,
    Remove,
    Rename(String),
}

#[derive(Debug)]
enum Command {
    Open {
        spec: SessionSpec,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    Control {
        id: SessionId,
        op: Control,
        reply: oneshot::Sender<Result<()>>,
    },
    Input {
        id: SessionId,
        data: Vec<u8>,
    },
    Resize {
        id: SessionId,
        cols: u16,
        rows: u16,
    },
}

/// Handle for the UI layer. Cheap to clone.
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Vec<Session>>,
}

impl SessionClient {
    /// Open a session; invalid specs fail here without reaching the manager
    pub async fn open(&self, spec: SessionSpec) -> Result<SessionId> {
        spec.validate()?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Open { spec, reply })
            .map_err(|_| SessionError::ManagerClosed)?;
        rx.await.map_err(|_| SessionError::ManagerClosed)?
    }

    pub async fn retry(&self, id: SessionId) -> Result<()> {
        self.control(id, Control::Retry).await
    }

    pub async fn cancel_reconnect(&self, id: SessionId) -> Result<()> {
        self.control(id, Control::CancelReconnect).await
    }

    /// Tear down the transport and buffer but keep the record
    pub async fn disconnect(&self, id: SessionId) -> Result<()> {
        self.control(id, Control::Disconnect).await
    }

    pub async fn remove(&self, id: SessionId) -> Result<()> {
        self.control(id, Control::Remove).await
    }

    pub async fn rename(&self, id: SessionId, label: impl Into<String>) -> Result<()> {
        self.control(id, Control::Rename(label.into())).await
    }

    /// Forward keystrokes to the transport
    pub fn send_input(&self, id: SessionId, data: Vec<u8>) -> Result<()> {
        self.commands
            .send(Command::Input { id, data })
            .map_err(|_| SessionError::ManagerClosed)
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        self.commands
            .send(Command::Resize { id, cols, rows })
            .map_err(|_| SessionError::ManagerClosed)
    }

    /// Observe the session list; a new value is published after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<Session>> {
        self.snapshot.clone()
    }

    #[cfg(test)]
    pub fn sessions(&self) -> Vec<Session> {
        self.snapshot.borrow().clone()
    }

    async fn control(&self, id: SessionId, op: Control) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Control { id, op, reply })
            .map_err(|_| SessionError::ManagerClosed)?;
        rx.await.map_err(|_| SessionError::ManagerClosed)?
    }
}

/// Owns every session and serializes all mutation through one task.
///
/// UI commands, transport events and background task results are queued and
/// handled one at a time, so two handlers never touch the same record
/// concurrently. Output is flushed to the sink on a fixed tick.
pub struct SessionManager {
    config: Arc<Config>,
    registry: SessionRegistry,
    scheduler: ReconnectScheduler,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn RenderSink>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    snapshot: watch::Sender<Vec<Session>>,
}

impl SessionManager {
    /// Start the manager task. It stops once every [`SessionClient`] is dropped.
    pub fn spawn(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn RenderSink>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (SessionClient, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(Vec::new());

        let scheduler = ReconnectScheduler::new(
            &config.reconnect,
            config.connect_timeout(),
            transport.clone(),
            internal_tx.clone(),
        );

        let manager = Self {
            config,
            registry: SessionRegistry::new(),
            scheduler,
            transport,
            sink,
            commands,
            events,
            internal_tx,
            internal_rx,
            snapshot,
        };
        let handle = tokio::spawn(manager.run());

        let client = SessionClient {
            commands: command_tx,
            snapshot: snapshot_rx,
        };
        (client, handle)
    }

    async fn run(mut self) {
        let mut flush_tick = tokio::time::interval(self.config.stream.flush_interval());
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // task results before transport events, so a success is applied
            // before a close that raced it
            tokio::select! {
                biased;
                _ = flush_tick.tick() => self.flush(),
                Some(msg) = self.internal_rx.recv() => self.handle_internal(msg),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_transport_event(event),
            }
            self.publish();
        }

        self.shutdown();
    }

    fn publish(&mut self) {
        if self.registry.take_changed() {
            self.snapshot.send_replace(self.registry.list_all());
        }
    }

    fn shutdown(&mut self) {
        for id in self.registry.ids() {
            self.registry.remove(id);
            self.transport.forget(id);
        }
        info!("session manager stopped");
    }

    // ---- commands ----

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { spec, reply } => {
                let _ = reply.send(self.open(spec));
            }
            Command::Control { id, op, reply } => {
                let result = match op {
                    Control::Retry => self.retry(id),
                    Control::CancelReconnect => self.cancel_reconnect(id),
                    Control::Disconnect => self.disconnect(id),
                    Control::Remove => self.remove(id),
                    Control::Rename(label) => self.rename(id, label),
                };
                if let Err(ref err) = result {
                    debug!(session = %id, "command rejected: {}", err);
                }
                let _ = reply.send(result);
            }
            Command::Input { id, data } => {
                match self.registry.get(id).map(|s| s.status) {
                    Some(SessionStatus::Connected) => self.transport.write_input(id, data),
                    _ => trace!(session = %id, "input dropped, session not connected"),
                }
            }
            Command::Resize { id, cols, rows } => {
                if self.registry.contains(id) {
                    self.transport.resize(id, cols, rows);
                }
            }
        }
    }

    fn open(&mut self, spec: SessionSpec) -> Result<SessionId> {
        let id = self.registry.open(spec)?;
        info!(session = %id, "session opened");
        self.start_connect(id);
        Ok(id)
    }

    fn start_connect(&mut self, id: SessionId) {
        let Some(entry) = self.registry.entry_mut(id) else {
            return;
        };
        entry.cancel_task();
        let epoch = entry.next_epoch();
        let target = entry.target();

        let transport = self.transport.clone();
        let internal = self.internal_tx.clone();
        let timeout = self.config.connect_timeout();

        entry.task = Some(TaskHandle::spawn(move |token| async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = connect(transport.as_ref(), id, &target, timeout) => outcome,
            };
            let _ = internal.send(Internal::ConnectResolved { id, epoch, outcome });
        }));
    }

    fn retry(&mut self, id: SessionId) -> Result<()> {
        // a live backoff timer must not race the manual attempt
        if self.scheduler.cancel(&mut self.registry, id)? {
            self.transport.close(id);
        }
        self.registry.transition(
            id,
            LifecycleEvent::Retry,
            SessionPatch::default().with_reconnect(None),
        )?;
        info!(session = %id, "manual retry");
        self.start_connect(id);
        Ok(())
    }

    fn cancel_reconnect(&mut self, id: SessionId) -> Result<()> {
        if self.scheduler.cancel(&mut self.registry, id)? {
            self.transport.close(id);
        }
        Ok(())
    }

    fn disconnect(&mut self, id: SessionId) -> Result<()> {
        let entry = self
            .registry
            .entry_mut(id)
            .ok_or(SessionError::NotFound(id))?;
        entry.cancel_task();
        entry.buffer = None;
        self.transport.close(id);
        self.registry.transition(
            id,
            LifecycleEvent::Disconnect,
            SessionPatch::default().with_reconnect(None),
        )?;
        info!(session = %id, "disconnected by user");
        Ok(())
    }

    fn remove(&mut self, id: SessionId) -> Result<()> {
        self.registry
            .remove(id)
            .ok_or(SessionError::NotFound(id))?;
        self.transport.forget(id);
        self.sink.release(id);
        info!(session = %id, "session removed");
        Ok(())
    }

    fn rename(&mut self, id: SessionId, label: String) -> Result<()> {
        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(SessionError::InvalidSpec("label must not be empty".to_string()));
        }
        self.registry
            .update(id, SessionPatch::default().with_label(label))?;
        Ok(())
    }

    // ---- transport events ----

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data { id, bytes } => self.on_data(id, &bytes),
            TransportEvent::Closed {
                id,
                reason,
                exit_code,
            } => self.on_closed(id, reason, exit_code),
            TransportEvent::Latency { id, ms } => {
                if self.registry.contains(id) {
                    let _ = self
                        .registry
                        .update(id, SessionPatch::default().with_latency(ms));
                }
            }
        }
    }

    fn on_data(&mut self, id: SessionId, bytes: &[u8]) {
        let Some(entry) = self.registry.entry_mut(id) else {
            trace!(session = %id, "data for unknown session dropped");
            return;
        };
        if !matches!(
            entry.session.status,
            SessionStatus::Connecting | SessionStatus::Connected
        ) {
            trace!(session = %id, status = %entry.session.status, "data for inactive session dropped");
            return;
        }

        let limits = &self.config.stream;
        let buffer = entry
            .buffer
            .get_or_insert_with(|| StreamBuffer::new(limits.clone()));
        let dropped_before = buffer.total_dropped_bytes();
        let warning = buffer.enqueue(bytes, Instant::now());
        buffer.schedule_flush();

        // evicted output will never reach the sink; return its credit now
        let evicted = buffer.total_dropped_bytes() - dropped_before;
        if evicted > 0 {
            self.transport.notify_consumed(id, evicted as usize);
        }

        if let Some(warning) = warning {
            warn!(
                session = %id,
                total_dropped = warning.total_dropped_bytes,
                "{}",
                SessionError::BufferOverflow(warning.dropped_bytes)
            );
            let _ = self.registry.update(
                id,
                SessionPatch::default().with_dropped_total(warning.total_dropped_bytes),
            );
        } else {
            self.registry.touch(id);
        }
    }

    fn on_closed(&mut self, id: SessionId, reason: CloseReason, exit_code: Option<i32>) {
        let Some(entry) = self.registry.entry_mut(id) else {
            debug!(session = %id, %reason, "close for removed session ignored");
            return;
        };
        if entry.session.status != SessionStatus::Connected {
            debug!(session = %id, %reason, status = %entry.session.status, "late close ignored");
            return;
        }

        // queued output keeps draining on the tick; flush drops the buffer once empty
        let patch = match reason {
            CloseReason::Auth => SessionPatch::default().with_error(
                SessionError::UnexpectedClose("authentication rejected".to_string()).to_string(),
            ),
            _ => SessionPatch::default(),
        };
        if let Err(err) = self
            .registry
            .transition(id, LifecycleEvent::Closed(reason), patch)
        {
            warn!(session = %id, "close not applied: {}", err);
            return;
        }
        info!(session = %id, %reason, ?exit_code, "transport closed");

        if reason.is_recoverable() {
            if let Err(err) = self.scheduler.start(&mut self.registry, id, reason) {
                warn!(session = %id, "reconnect not started: {}", err);
            }
        }
    }

    // ---- background results ----

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ConnectResolved { id, epoch, outcome } => {
                self.on_connect_resolved(id, epoch, outcome)
            }
            Internal::ReconnectCountdown {
                id,
                epoch,
                remaining_ms,
            } => self
                .scheduler
                .on_countdown(&mut self.registry, id, epoch, remaining_ms),
            Internal::ReconnectAttempt { id, epoch, outcome } => {
                if let Err(err) = self
                    .scheduler
                    .on_attempt(&mut self.registry, id, epoch, outcome)
                {
                    warn!(session = %id, "attempt result not applied: {}", err);
                }
            }
        }
    }

    fn on_connect_resolved(&mut self, id: SessionId, epoch: u64, outcome: Result<()>) {
        let Some(entry) = self.registry.entry_mut(id) else {
            debug!(session = %id, "connect result for removed session ignored");
            return;
        };
        if entry.epoch != epoch {
            debug!(session = %id, "stale connect result ignored");
            return;
        }
        entry.task = None;

        let result = match outcome {
            Ok(()) => {
                info!(session = %id, "connected");
                self.registry
                    .transition(id, LifecycleEvent::Connected, SessionPatch::default())
            }
            Err(err) => {
                entry.buffer = None;
                if matches!(err, SessionError::ConnectTimeout(_)) {
                    self.transport.close(id);
                }
                warn!(session = %id, "connect failed: {}", err);
                self.registry.transition(
                    id,
                    LifecycleEvent::ConnectFailed,
                    SessionPatch::default().with_error(err.to_string()),
                )
            }
        };
        if let Err(err) = result {
            warn!(session = %id, "connect result not applied: {}", err);
        }
    }

    // ---- flushing ----

    /// One render tick: each armed buffer delivers at most one batch
    fn flush(&mut self) {
        let mut delivered = false;
        let mut dropped = Vec::new();
        for (id, entry) in self.registry.entries_mut() {
            let Some(buffer) = entry.buffer.as_mut() else {
                continue;
            };
            if let Some(batch) = buffer.take_batch() {
                trace!(session = %id, bytes = batch.len(), "flush");
                self.sink.write(*id, &batch);
                self.transport.notify_consumed(*id, batch.len());
                delivered = true;
            }
            if buffer.total_dropped_bytes() != entry.session.dropped_bytes_total {
                dropped.push((*id, buffer.total_dropped_bytes()));
            }
            let active = matches!(
                entry.session.status,
                SessionStatus::Connecting | SessionStatus::Connected
            );
            if !active && buffer.is_empty() {
                entry.buffer = None;
            }
        }

        for (id, total) in dropped {
            let _ = self
                .registry
                .update(id, SessionPatch::default().with_dropped_total(total));
        }
        if delivered {
            self.registry.mark_changed();
        }
    }
}
