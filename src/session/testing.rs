//! Scripted collaborators for exercising the session manager

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::transport::{CloseReason, Transport, TransportEvent};
use crate::view::RenderSink;

use super::{Endpoint, Secret, Session, SessionClient, SessionId, SessionManager};

/// What the next open call does
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Succeed,
    Fail(String),
    /// Succeed after a pause
    Delay(Duration),
    /// Never resolves
    Hang,
}

#[derive(Default)]
pub struct MockState {
    pub script: VecDeque<OpenOutcome>,
    pub opens: Vec<(SessionId, Instant)>,
    pub closes: Vec<SessionId>,
    pub inputs: Vec<(SessionId, Vec<u8>)>,
    pub resizes: Vec<(SessionId, u16, u16)>,
    pub consumed: HashMap<SessionId, usize>,
    pub forgotten: Vec<SessionId>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Queue outcomes for upcoming open calls; unscripted calls succeed
    pub fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        self.state().script.extend(outcomes);
    }

    pub fn open_count(&self) -> usize {
        self.state().opens.len()
    }

    pub fn emit_data(&self, id: SessionId, bytes: &[u8]) {
        let _ = self.events.send(TransportEvent::Data {
            id,
            bytes: bytes.to_vec(),
        });
    }

    pub fn emit_closed(&self, id: SessionId, reason: CloseReason) {
        let _ = self.events.send(TransportEvent::Closed {
            id,
            reason,
            exit_code: None,
        });
    }

    pub fn emit_latency(&self, id: SessionId, ms: u64) {
        let _ = self.events.send(TransportEvent::Latency { id, ms });
    }

    async fn open(&self, id: SessionId) -> Result<()> {
        let outcome = {
            let mut state = self.state();
            state.opens.push((id, Instant::now()));
            state.script.pop_front().unwrap_or(OpenOutcome::Succeed)
        };
        match outcome {
            OpenOutcome::Succeed => Ok(()),
            OpenOutcome::Fail(message) => Err(SessionError::ConnectFailure(message)),
            OpenOutcome::Delay(pause) => {
                tokio::time::sleep(pause).await;
                Ok(())
            }
            OpenOutcome::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_remote(&self, id: SessionId, _endpoint: &Endpoint, _secret: &Secret) -> Result<()> {
        self.open(id).await
    }

    async fn open_local(&self, id: SessionId, _cwd: Option<&Path>) -> Result<()> {
        self.open(id).await
    }

    fn close(&self, id: SessionId) {
        self.state().closes.push(id);
    }

    fn write_input(&self, id: SessionId, data: Vec<u8>) {
        self.state().inputs.push((id, data));
    }

    fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        self.state().resizes.push((id, cols, rows));
    }

    fn notify_consumed(&self, id: SessionId, bytes: usize) {
        *self.state().consumed.entry(id).or_default() += bytes;
    }

    fn forget(&self, id: SessionId) {
        self.state().forgotten.push(id);
    }
}

/// Sink that keeps every write
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(SessionId, Vec<u8>)>>,
    released: Mutex<Vec<SessionId>>,
}

impl RecordingSink {
    pub fn writes(&self) -> Vec<(SessionId, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn delivered(&self, id: SessionId) -> Vec<u8> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(other, _)| *other == id)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    pub fn released(&self) -> Vec<SessionId> {
        self.released.lock().unwrap().clone()
    }
}

impl RenderSink for RecordingSink {
    fn write(&self, id: SessionId, data: &[u8]) {
        self.writes.lock().unwrap().push((id, data.to_vec()));
    }

    fn release(&self, id: SessionId) {
        self.released.lock().unwrap().push(id);
    }
}

pub struct Harness {
    pub client: SessionClient,
    pub transport: Arc<MockTransport>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::new(events_tx));
        let sink = Arc::new(RecordingSink::default());
        let (client, _handle) = SessionManager::spawn(
            Arc::new(config),
            transport.clone(),
            sink.clone(),
            events_rx,
        );
        Self {
            client,
            transport,
            sink,
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.client.sessions().into_iter().find(|s| s.id == id)
    }

    /// Wait until the published sessions satisfy `pred`
    pub async fn wait_for<F>(&self, mut pred: F) -> Vec<Session>
    where
        F: FnMut(&[Session]) -> bool,
    {
        let mut rx: watch::Receiver<Vec<Session>> = self.client.subscribe();
        let found = tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if pred(&current) {
                        return current.clone();
                    }
                }
                if rx.changed().await.is_err() {
                    panic!("session manager stopped");
                }
            }
        })
        .await;
        found.expect("condition not reached")
    }

    /// Wait until session `id` satisfies `pred`
    pub async fn wait_session<F>(&self, id: SessionId, mut pred: F) -> Session
    where
        F: FnMut(&Session) -> bool,
    {
        let sessions = self
            .wait_for(|all| all.iter().any(|s| s.id == id && pred(s)))
            .await;
        sessions.into_iter().find(|s| s.id == id).unwrap()
    }
}

/// Counts overflow warnings emitted through `tracing`
#[derive(Clone, Default)]
pub struct OverflowWarnings(pub Arc<AtomicUsize>);

impl OverflowWarnings {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for OverflowWarnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        if visitor.0.contains("buffer overflow") {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}
