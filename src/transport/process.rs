use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Result, SessionError};
use crate::session::{Endpoint, Secret, SessionId};

use super::{CloseReason, Transport, TransportEvent};

const READ_CHUNK: usize = 8192;
const STDERR_TAIL: usize = 4096;

static RE_AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)(permission denied|authentication failed|too many authentication failures|host key verification failed|incorrect password)").unwrap()
});

static RE_TIMEOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)(timed out|timeout, server .* not responding)").unwrap()
});

static RE_NETWORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)(connection reset|connection refused|broken pipe|no route to host|network is unreachable|connection closed by|could not resolve hostname|connection to .* closed)").unwrap()
});

/// Why a child process ended. Remote channels are judged by ssh's own
/// diagnostics; local shells only by their exit code.
pub fn classify_exit(code: Option<i32>, stderr: &str, remote: bool) -> CloseReason {
    if remote {
        if RE_AUTH.is_match(stderr) {
            return CloseReason::Auth;
        }
        if RE_TIMEOUT.is_match(stderr) {
            return CloseReason::Timeout;
        }
        if RE_NETWORK.is_match(stderr) {
            return CloseReason::Network;
        }
    }
    match code {
        Some(0) => CloseReason::User,
        // sshpass: wrong password
        Some(5) if remote => CloseReason::Auth,
        // ssh: connection-level failure
        Some(255) if remote => CloseReason::Network,
        _ => CloseReason::Unknown,
    }
}

/// Program and arguments for a remote channel
pub fn remote_argv(config: &TransportConfig, endpoint: &Endpoint, secret: &Secret) -> Vec<String> {
    let mut argv = Vec::new();
    if secret.password.is_some() {
        argv.push("sshpass".to_string());
        argv.push("-e".to_string());
    }
    argv.push(config.ssh_program.clone());
    argv.push("-tt".to_string());
    argv.push("-p".to_string());
    argv.push(endpoint.port.to_string());
    if secret.password.is_none() {
        argv.push("-o".to_string());
        argv.push("BatchMode=yes".to_string());
    }
    if let Some(key) = &secret.key_path {
        argv.push("-i".to_string());
        argv.push(key.display().to_string());
    }
    argv.push(format!("{}@{}", endpoint.principal, endpoint.host));
    argv
}

/// Bytes handed to the manager but not yet rendered.
///
/// The reader stops pulling from the child while the window is full, so a
/// slow sink backs up into the pipe instead of into memory.
struct FlowCredit {
    window: usize,
    in_flight: AtomicUsize,
    notify: Notify,
}

impl FlowCredit {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    async fn acquire(&self, bytes: usize) {
        loop {
            let notified = self.notify.notified();
            if self.in_flight.load(Ordering::Acquire) < self.window {
                self.in_flight.fetch_add(bytes, Ordering::AcqRel);
                return;
            }
            notified.await;
        }
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(bytes))
            });
        self.notify.notify_one();
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

struct Channel {
    generation: u64,
    input: mpsc::UnboundedSender<Vec<u8>>,
    credit: Arc<FlowCredit>,
    closing: CancellationToken,
}

type Channels = Arc<Mutex<HashMap<SessionId, Channel>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Transport backed by child processes: `ssh` for remote sessions, the
/// configured shell for local ones.
pub struct ProcessTransport {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    channels: Channels,
    sizes: Mutex<HashMap<SessionId, (u16, u16)>>,
    generation: AtomicU64,
}

impl ProcessTransport {
    pub fn new(config: TransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            config,
            events,
            channels: Arc::new(Mutex::new(HashMap::new())),
            sizes: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn apply_size(&self, id: SessionId, command: &mut Command) {
        if let Some((cols, rows)) = lock(&self.sizes).get(&id).copied() {
            command.env("COLUMNS", cols.to_string());
            command.env("LINES", rows.to_string());
        }
    }

    /// Spawn `command` and start pumping its output. `ready` resolves once
    /// the channel counts as connected.
    fn start(
        &self,
        id: SessionId,
        mut command: Command,
        remote: bool,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        // a reopen replaces whatever the session had
        self.close(id);

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.apply_size(id, &mut command);

        let child = command.spawn().map_err(|err| {
            SessionError::ConnectFailure(format!(
                "{}: {}",
                command.as_std().get_program().to_string_lossy(),
                err
            ))
        })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(FlowCredit::new(self.config.flow_window_bytes));
        let closing = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        lock(&self.channels).insert(
            id,
            Channel {
                generation,
                input: input_tx,
                credit: credit.clone(),
                closing: closing.clone(),
            },
        );

        // local shells are usable as soon as they exist
        let ready = if remote {
            Some(ready_tx)
        } else {
            let _ = ready_tx.send(Ok(()));
            None
        };

        tokio::spawn(run_channel(ChannelJob {
            id,
            generation,
            remote,
            child,
            input: input_rx,
            credit,
            closing,
            ready,
            events: self.events.clone(),
            channels: self.channels.clone(),
        }));
        debug!(session = %id, generation, remote, "channel spawned");
        Ok(ready_rx)
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn open_remote(&self, id: SessionId, endpoint: &Endpoint, secret: &Secret) -> Result<()> {
        let argv = remote_argv(&self.config, endpoint, secret);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        if let Some(password) = &secret.password {
            command.env("SSHPASS", password.expose_secret());
        }

        info!(session = %id, %endpoint, "opening remote channel");
        let ready = self.start(id, command, true)?;
        match ready.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::ConnectFailure(
                "channel closed before connecting".to_string(),
            )),
        }
    }

    async fn open_local(&self, id: SessionId, cwd: Option<&Path>) -> Result<()> {
        let mut command = Command::new(&self.config.shell);
        command.arg("-i").env("TERM", "dumb");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        info!(session = %id, shell = %self.config.shell, "opening local shell");
        let ready = self.start(id, command, false)?;
        ready.await.map_err(|_| {
            SessionError::ConnectFailure("shell exited during startup".to_string())
        })?
    }

    fn close(&self, id: SessionId) {
        if let Some(channel) = lock(&self.channels).remove(&id) {
            debug!(session = %id, generation = channel.generation, "closing channel");
            channel.closing.cancel();
        }
    }

    fn write_input(&self, id: SessionId, data: Vec<u8>) {
        match lock(&self.channels).get(&id) {
            Some(channel) => {
                let _ = channel.input.send(data);
            }
            None => trace!(session = %id, "input for closed channel dropped"),
        }
    }

    fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        debug!(session = %id, cols, rows, "size recorded for next spawn");
        lock(&self.sizes).insert(id, (cols, rows));
    }

    fn notify_consumed(&self, id: SessionId, bytes: usize) {
        if let Some(channel) = lock(&self.channels).get(&id) {
            channel.credit.release(bytes);
            trace!(session = %id, in_flight = channel.credit.in_flight(), "credit returned");
        }
    }

    fn forget(&self, id: SessionId) {
        self.close(id);
        lock(&self.sizes).remove(&id);
    }
}

struct ChannelJob {
    id: SessionId,
    generation: u64,
    remote: bool,
    child: Child,
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    credit: Arc<FlowCredit>,
    closing: CancellationToken,
    ready: Option<oneshot::Sender<Result<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    channels: Channels,
}

async fn run_channel(job: ChannelJob) {
    let ChannelJob {
        id,
        generation,
        remote,
        mut child,
        mut input,
        credit,
        closing,
        mut ready,
        events,
        channels,
    } = job;
    let started = Instant::now();

    let writer = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            while let Some(data) = input.recv().await {
                if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        })
    });

    // ssh reports its own failures on stderr; a local shell prompts there
    let stderr = child.stderr.take().map(|stderr| {
        let forward = (!remote).then(|| StderrForward {
            events: events.clone(),
            credit: credit.clone(),
            closing: closing.clone(),
        });
        tokio::spawn(collect_stderr(id, stderr, forward))
    });

    let requested = match child.stdout.take() {
        Some(mut stdout) => {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = tokio::select! {
                    biased;
                    _ = closing.cancelled() => break true,
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break false,
                        Ok(n) => n,
                    },
                };
                if let Some(ready) = ready.take() {
                    let ms = started.elapsed().as_millis() as u64;
                    let _ = ready.send(Ok(()));
                    let _ = events.send(TransportEvent::Latency { id, ms });
                }
                tokio::select! {
                    biased;
                    _ = closing.cancelled() => break true,
                    _ = credit.acquire(n) => {}
                }
                let _ = events.send(TransportEvent::Data {
                    id,
                    bytes: buf[..n].to_vec(),
                });
            }
        }
        None => false,
    };

    if requested {
        let _ = child.start_kill();
    }
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(session = %id, "waiting for child failed: {}", err);
            None
        }
    };
    if let Some(writer) = writer {
        writer.abort();
    }
    let tail = match stderr {
        Some(task) => tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or_default(),
        None => String::new(),
    };

    if requested {
        debug!(session = %id, generation, ?code, "channel closed on request");
        return;
    }

    let current = {
        let mut channels = lock(&channels);
        match channels.get(&id) {
            Some(channel) if channel.generation == generation => {
                channels.remove(&id);
                true
            }
            _ => false,
        }
    };

    if let Some(ready) = ready {
        let message = tail
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| match code {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            });
        let _ = ready.send(Err(SessionError::ConnectFailure(message)));
        return;
    }

    if !current {
        debug!(session = %id, generation, "superseded channel ended");
        return;
    }

    let reason = classify_exit(code, &tail, remote);
    debug!(session = %id, generation, ?code, %reason, "channel ended");
    let _ = events.send(TransportEvent::Closed {
        id,
        reason,
        exit_code: code,
    });
}

/// Where forwarded stderr goes; it draws on the same credit as stdout
struct StderrForward {
    events: mpsc::UnboundedSender<TransportEvent>,
    credit: Arc<FlowCredit>,
    closing: CancellationToken,
}

/// Keep the last few KiB of stderr, optionally forwarding it as output
async fn collect_stderr<R>(id: SessionId, mut stderr: R, forward: Option<StderrForward>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(forward) = &forward {
                    tokio::select! {
                        biased;
                        _ = forward.closing.cancelled() => break,
                        _ = forward.credit.acquire(n) => {}
                    }
                    let _ = forward.events.send(TransportEvent::Data {
                        id,
                        bytes: buf[..n].to_vec(),
                    });
                }
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            host: "10.0.0.5".to_string(),
            port,
            principal: "admin".to_string(),
        }
    }

    #[test]
    fn test_classify_ssh_diagnostics() {
        assert_eq!(
            classify_exit(Some(255), "admin@10.0.0.5: Permission denied (publickey).", true),
            CloseReason::Auth
        );
        assert_eq!(
            classify_exit(Some(255), "ssh: connect to host 10.0.0.5 port 22: Connection timed out", true),
            CloseReason::Timeout
        );
        assert_eq!(
            classify_exit(Some(255), "client_loop: send disconnect: Broken pipe", true),
            CloseReason::Network
        );
        assert_eq!(classify_exit(Some(255), "", true), CloseReason::Network);
        assert_eq!(classify_exit(Some(5), "", true), CloseReason::Auth);
        assert_eq!(classify_exit(Some(0), "logout", true), CloseReason::User);
        assert_eq!(classify_exit(None, "", true), CloseReason::Unknown);
    }

    #[test]
    fn test_classify_local_ignores_stderr() {
        assert_eq!(
            classify_exit(Some(0), "cat: secret: Permission denied", false),
            CloseReason::User
        );
        assert_eq!(classify_exit(Some(255), "", false), CloseReason::Unknown);
    }

    #[test]
    fn test_remote_argv_with_key() {
        let secret = Secret {
            password: None,
            key_path: Some(PathBuf::from("/home/admin/.ssh/id_ed25519")),
        };
        let argv = remote_argv(&TransportConfig::default(), &endpoint(2222), &secret);
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-tt",
                "-p",
                "2222",
                "-o",
                "BatchMode=yes",
                "-i",
                "/home/admin/.ssh/id_ed25519",
                "admin@10.0.0.5"
            ]
        );
    }

    #[test]
    fn test_remote_argv_with_password_uses_env() {
        let spec = crate::session::SessionSpec::remote("10.0.0.5", 22, "admin").with_password("hunter2");
        let argv = remote_argv(&TransportConfig::default(), &endpoint(22), &spec.secret);
        assert_eq!(argv[..3], ["sshpass", "-e", "ssh"]);
        assert!(!argv.iter().any(|arg| arg.contains("hunter2")));
        assert!(!argv.iter().any(|arg| arg == "BatchMode=yes"));
    }

    #[tokio::test]
    async fn test_credit_blocks_until_released() {
        let credit = Arc::new(FlowCredit::new(10));
        credit.acquire(10).await;
        assert_eq!(credit.in_flight(), 10);

        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move { credit.acquire(4).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        credit.release(6);
        waiter.await.unwrap();
        assert_eq!(credit.in_flight(), 8);
    }

    #[tokio::test]
    async fn test_forwarded_stderr_draws_credit() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(FlowCredit::new(64));
        let id = SessionId::new();
        let forward = StderrForward {
            events: events_tx,
            credit: credit.clone(),
            closing: CancellationToken::new(),
        };

        let tail = collect_stderr(id, &b"sh: 1: nope: not found\n"[..], Some(forward)).await;
        assert_eq!(tail, "sh: 1: nope: not found\n");
        assert_eq!(credit.in_flight(), 23);

        let Some(TransportEvent::Data { bytes, .. }) = events_rx.recv().await else {
            panic!("stderr not forwarded");
        };
        credit.release(bytes.len());
        assert_eq!(credit.in_flight(), 0);
    }

    #[test]
    fn test_forget_drops_recorded_size() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = ProcessTransport::new(TransportConfig::default(), events_tx);
        let id = SessionId::new();

        transport.resize(id, 120, 40);
        assert_eq!(lock(&transport.sizes).get(&id), Some(&(120, 40)));

        transport.forget(id);
        assert!(lock(&transport.sizes).is_empty());
    }

    #[tokio::test]
    async fn test_local_shell_output_and_exit() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let config = TransportConfig {
            shell: "/bin/sh".to_string(),
            ..TransportConfig::default()
        };
        let transport = ProcessTransport::new(config, events_tx);
        let id = SessionId::new();

        transport.open_local(id, None).await.unwrap();
        transport.write_input(id, b"echo shelldeck-ok; exit 0\n".to_vec());

        let mut output = Vec::new();
        let reason = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events_rx.recv().await {
                match event {
                    TransportEvent::Data { bytes, .. } => {
                        output.extend_from_slice(&bytes);
                        transport.notify_consumed(id, bytes.len());
                    }
                    TransportEvent::Closed { reason, .. } => return reason,
                    TransportEvent::Latency { .. } => {}
                }
            }
            CloseReason::Unknown
        })
        .await
        .unwrap();

        assert!(String::from_utf8_lossy(&output).contains("shelldeck-ok"));
        assert_eq!(reason, CloseReason::User);
    }
}
