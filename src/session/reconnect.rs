use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::{Result, SessionError};
use crate::transport::{CloseReason, Transport};

use super::lifecycle::LifecycleEvent;
use super::manager::{connect, Internal};
use super::registry::{ConnectTarget, SessionPatch, SessionRegistry, TaskHandle};
use super::{ReconnectState, SessionId, SessionKind};

/// Exponential backoff: `min(max, initial * multiplier^n)` after the n-th failure
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.backoff_multiplier,
            max: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial.min(self.max)
    }

    /// Delay before the next attempt once attempt `attempt_number` has failed
    pub fn delay_after(&self, attempt_number: u32) -> Duration {
        let exponent = i32::try_from(attempt_number).unwrap_or(i32::MAX);
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max.as_millis() as f64;
        Duration::from_millis(ms.min(max_ms) as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Drives automatic reconnects for dropped remote sessions.
///
/// Each session has at most one armed attempt, held as a cancellable task on
/// its registry entry. `reconnect` on the record is set exactly while that
/// task exists.
pub(crate) struct ReconnectScheduler {
    policy: BackoffPolicy,
    countdown_tick: Duration,
    connect_timeout: Duration,
    transport: Arc<dyn Transport>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl ReconnectScheduler {
    pub fn new(
        config: &ReconnectConfig,
        connect_timeout: Duration,
        transport: Arc<dyn Transport>,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        Self {
            policy: BackoffPolicy::from_config(config),
            countdown_tick: Duration::from_millis(config.countdown_tick_ms),
            connect_timeout,
            transport,
            internal,
        }
    }

    /// Begin a reconnect sequence. Returns false when `reason` or the session
    /// kind rules it out.
    pub fn start(
        &self,
        registry: &mut SessionRegistry,
        id: SessionId,
        reason: CloseReason,
    ) -> Result<bool> {
        let session = registry.get(id).ok_or(SessionError::NotFound(id))?;
        if !reason.is_recoverable() || session.kind == SessionKind::Local {
            return Ok(false);
        }

        let delay = self.policy.initial_delay();
        let state = ReconnectState {
            is_active: true,
            attempt_number: 1,
            max_attempts: self.policy.max_attempts(),
            next_attempt_delay_ms: delay.as_millis() as u64,
            reason,
        };
        registry.transition(
            id,
            LifecycleEvent::ReconnectStarted,
            SessionPatch::default().with_reconnect(Some(state)),
        )?;
        self.arm(registry, id, delay);

        info!(session = %id, %reason, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        Ok(true)
    }

    /// Stop any pending attempt and settle on `disconnected`.
    ///
    /// Returns false (and does nothing) when no reconnect is active.
    pub fn cancel(&self, registry: &mut SessionRegistry, id: SessionId) -> Result<bool> {
        let entry = registry.entry_mut(id).ok_or(SessionError::NotFound(id))?;
        if entry.session.reconnect.is_none() {
            return Ok(false);
        }

        entry.cancel_task();
        registry.transition(
            id,
            LifecycleEvent::Disconnect,
            SessionPatch::default().with_reconnect(None),
        )?;
        info!(session = %id, "reconnect cancelled");
        Ok(true)
    }

    /// Countdown refresh from the armed task; display only
    pub fn on_countdown(
        &self,
        registry: &mut SessionRegistry,
        id: SessionId,
        epoch: u64,
        remaining_ms: u64,
    ) {
        let Some(entry) = registry.entry(id) else {
            return;
        };
        if entry.epoch != epoch {
            return;
        }
        if let Some(mut state) = entry.session.reconnect.clone() {
            state.next_attempt_delay_ms = remaining_ms;
            let _ = registry.update(id, SessionPatch::default().with_reconnect(Some(state)));
        }
    }

    /// Apply the result of an attempt: connect, re-arm, or give up
    pub fn on_attempt(
        &self,
        registry: &mut SessionRegistry,
        id: SessionId,
        epoch: u64,
        outcome: Result<()>,
    ) -> Result<()> {
        let Some(entry) = registry.entry_mut(id) else {
            debug!(session = %id, "attempt result for removed session ignored");
            return Ok(());
        };
        if entry.epoch != epoch {
            debug!(session = %id, "stale attempt result ignored");
            return Ok(());
        }
        entry.task = None;

        let Some(state) = entry.session.reconnect.clone() else {
            return Ok(());
        };

        match outcome {
            Ok(()) => {
                registry.transition(
                    id,
                    LifecycleEvent::Connected,
                    SessionPatch::default().with_reconnect(None),
                )?;
                info!(session = %id, attempt = state.attempt_number, "reconnected");
            }
            Err(err) if state.attempt_number < state.max_attempts => {
                if matches!(err, SessionError::ConnectTimeout(_)) {
                    self.transport.close(id);
                }
                let delay = self.policy.delay_after(state.attempt_number);
                let next = ReconnectState {
                    attempt_number: state.attempt_number + 1,
                    next_attempt_delay_ms: delay.as_millis() as u64,
                    ..state
                };
                warn!(
                    session = %id,
                    attempt = next.attempt_number - 1,
                    retry_in_ms = next.next_attempt_delay_ms,
                    "reconnect attempt failed: {}", err
                );
                registry.transition(
                    id,
                    LifecycleEvent::AttemptFailed { exhausted: false },
                    SessionPatch::default().with_reconnect(Some(next)),
                )?;
                self.arm(registry, id, delay);
            }
            Err(err) => {
                if matches!(err, SessionError::ConnectTimeout(_)) {
                    self.transport.close(id);
                }
                let exhausted = SessionError::ReconnectExhausted(state.max_attempts);
                warn!(session = %id, "{} (last error: {})", exhausted, err);
                registry.transition(
                    id,
                    LifecycleEvent::AttemptFailed { exhausted: true },
                    SessionPatch::default()
                        .with_reconnect(None)
                        .with_error(exhausted.to_string()),
                )?;
            }
        }
        Ok(())
    }

    fn arm(&self, registry: &mut SessionRegistry, id: SessionId, delay: Duration) {
        let Some(entry) = registry.entry_mut(id) else {
            return;
        };
        entry.cancel_task();
        let epoch = entry.next_epoch();
        let target = entry.target();

        let transport = self.transport.clone();
        let internal = self.internal.clone();
        let tick = self.countdown_tick;
        let timeout = self.connect_timeout;

        entry.task = Some(TaskHandle::spawn(move |token| {
            run_attempt(AttemptJob {
                token,
                transport,
                internal,
                id,
                epoch,
                target,
                delay,
                tick,
                timeout,
            })
        }));
    }
}

struct AttemptJob {
    token: CancellationToken,
    transport: Arc<dyn Transport>,
    internal: mpsc::UnboundedSender<Internal>,
    id: SessionId,
    epoch: u64,
    target: ConnectTarget,
    delay: Duration,
    tick: Duration,
    timeout: Duration,
}

/// Wait out the delay (reporting the countdown), then try once
async fn run_attempt(job: AttemptJob) {
    let AttemptJob {
        token,
        transport,
        internal,
        id,
        epoch,
        target,
        delay,
        tick,
        timeout,
    } = job;

    let deadline = Instant::now() + delay;
    let mut countdown = interval_at(Instant::now() + tick, tick);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = sleep_until(deadline) => break,
            _ = countdown.tick() => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = internal.send(Internal::ReconnectCountdown {
                    id,
                    epoch,
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
        }
    }

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        outcome = connect(transport.as_ref(), id, &target, timeout) => outcome,
    };
    let _ = internal.send(Internal::ReconnectAttempt { id, epoch, outcome });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles_and_caps() {
        let policy = BackoffPolicy::from_config(&ReconnectConfig::default());
        assert_eq!(policy.initial_delay(), Duration::from_millis(1000));

        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_after(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000]);
        assert_eq!(policy.delay_after(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_respects_custom_settings() {
        let config = ReconnectConfig {
            initial_delay_ms: 500,
            backoff_multiplier: 3.0,
            max_delay_ms: 10_000,
            ..ReconnectConfig::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.delay_after(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(4500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(10_000));
    }
}
