//! Per-session serialization kernel.
//!
//! One single-writer lane per session key: at any instant at most one turn
//! runs for a key, later enqueues wait FIFO. Lanes are created on first
//! use and reaped after idleness. Interruption cancels the active turn and
//! drops not-yet-started turns with no side effects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mozi_sessions::{SessionKey, SessionStatus, SessionStore};

use crate::driver::{DriverError, PromptDriver, TurnEvent, TurnRequest};

/// Default prompt-driver inactivity timeout.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(30);
/// How long an empty lane lingers before its worker is reaped.
const LANE_IDLE_REAP: Duration = Duration::from_secs(300);
/// Queued turns per lane before enqueue awaits (backpressure).
const LANE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Cancellation fires when the driver stays silent this long.
    pub turn_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        }
    }
}

/// Passed to `on_fallback` before each retry.
#[derive(Debug, Clone)]
pub struct FallbackNotice {
    pub from_model: String,
    pub to_model: String,
    pub attempt: u32,
    pub error: String,
}

pub type FallbackHook = Arc<dyn Fn(FallbackNotice) + Send + Sync>;

/// One unit of work for a session lane.
pub struct TurnSpec {
    pub request: TurnRequest,
    /// Fallback models tried in order after `request.model`.
    pub fallback_models: Vec<String>,
    /// Sink the kernel forwards every driver event into; the caller
    /// consumes it for streaming edits.
    pub events: mpsc::Sender<TurnEvent>,
    pub on_fallback: Option<FallbackHook>,
}

/// Terminal state of one turn.
#[derive(Debug)]
pub enum TurnOutcome {
    Ok {
        /// The driver's final assistant message, when it produced one.
        final_text: Option<String>,
        /// Model that actually completed the turn.
        model: String,
    },
    Failed(DriverError),
    Interrupted {
        reason: String,
    },
    Timeout,
}

/// Outcome of forwarding one turn's driver events.
enum PumpResult {
    Done { final_text: Option<String> },
    Interrupted,
    TimedOut,
    Errored(DriverError),
}

struct QueuedTurn {
    turn_id: u64,
    spec: TurnSpec,
    cancel: CancellationToken,
    outcome_tx: oneshot::Sender<TurnOutcome>,
}

struct Lane {
    tx: mpsc::Sender<QueuedTurn>,
    /// Tokens of every queued or running turn on this lane, by turn id.
    tokens: Arc<Mutex<Vec<(u64, CancellationToken)>>>,
    /// Reason reported by turns dropped via [`DispatchKernel::interrupt`].
    interrupt_reason: Arc<Mutex<String>>,
}

/// The dispatch kernel. Shared as `Arc<DispatchKernel>` across the host.
pub struct DispatchKernel {
    driver: Arc<dyn PromptDriver>,
    sessions: Arc<SessionStore>,
    config: KernelConfig,
    lanes: Arc<DashMap<String, Lane>>,
    next_turn_id: std::sync::atomic::AtomicU64,
}

impl DispatchKernel {
    pub fn new(
        driver: Arc<dyn PromptDriver>,
        sessions: Arc<SessionStore>,
        config: KernelConfig,
    ) -> Self {
        Self {
            driver,
            sessions,
            config,
            lanes: Arc::new(DashMap::new()),
            next_turn_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Enqueue a turn on its session's lane. Returns a receiver that
    /// resolves with the turn's terminal outcome.
    pub async fn dispatch(&self, spec: TurnSpec) -> oneshot::Receiver<TurnOutcome> {
        let key = spec.request.session_key.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let turn_id = self
            .next_turn_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut queued = QueuedTurn {
            turn_id,
            spec,
            cancel: cancel.clone(),
            outcome_tx,
        };

        // Stamp the queue transition before the worker picks it up.
        let _ = self.sessions.set_status(&key, SessionStatus::Queued);

        loop {
            let lane_tx = {
                let lane = self
                    .lanes
                    .entry(key.as_str().to_string())
                    .or_insert_with(|| self.spawn_lane(&key));
                lane.tokens
                    .lock()
                    .expect("lane token lock poisoned")
                    .push((turn_id, cancel.clone()));
                lane.tx.clone()
            };

            match lane_tx.send(queued).await {
                Ok(()) => break,
                // The lane worker was reaped between lookup and send;
                // retry against a fresh lane.
                Err(mpsc::error::SendError(turn)) => {
                    debug!(key = %key, "lane reaped mid-dispatch; respawning");
                    self.lanes.remove(key.as_str());
                    queued = turn;
                }
            }
        }

        outcome_rx
    }

    /// Signal the active turn (and drop queued turns) for `key`.
    ///
    /// Returns `true` when at least one turn was signalled.
    pub fn interrupt(&self, key: &SessionKey, reason: &str) -> bool {
        let Some(lane) = self.lanes.get(key.as_str()) else {
            return false;
        };
        *lane
            .interrupt_reason
            .lock()
            .expect("lane reason lock poisoned") = reason.to_string();

        let tokens = lane.tokens.lock().expect("lane token lock poisoned");
        let mut signalled = false;
        for (_, token) in tokens.iter() {
            if !token.is_cancelled() {
                token.cancel();
                signalled = true;
            }
        }
        if signalled {
            info!(key = %key, reason, "session interrupted");
        }
        signalled
    }

    /// Whether a turn is currently running or queued for `key`.
    pub fn is_busy(&self, key: &SessionKey) -> bool {
        self.lanes
            .get(key.as_str())
            .map(|lane| {
                lane.tokens
                    .lock()
                    .expect("lane token lock poisoned")
                    .iter()
                    .any(|(_, t)| !t.is_cancelled())
            })
            .unwrap_or(false)
    }

    fn spawn_lane(&self, key: &SessionKey) -> Lane {
        let (tx, rx) = mpsc::channel(LANE_CAPACITY);
        let lane = Lane {
            tx,
            tokens: Arc::new(Mutex::new(Vec::new())),
            interrupt_reason: Arc::new(Mutex::new("interrupted".to_string())),
        };

        let worker = LaneWorker {
            key: key.clone(),
            driver: Arc::clone(&self.driver),
            sessions: Arc::clone(&self.sessions),
            config: self.config.clone(),
            tokens: Arc::clone(&lane.tokens),
            interrupt_reason: Arc::clone(&lane.interrupt_reason),
            lanes: Arc::clone(&self.lanes),
        };
        tokio::spawn(worker.run(rx));

        debug!(key = %key, "session lane created");
        lane
    }
}

struct LaneWorker {
    key: SessionKey,
    driver: Arc<dyn PromptDriver>,
    sessions: Arc<SessionStore>,
    config: KernelConfig,
    tokens: Arc<Mutex<Vec<(u64, CancellationToken)>>>,
    interrupt_reason: Arc<Mutex<String>>,
    lanes: Arc<DashMap<String, Lane>>,
}

impl LaneWorker {
    async fn run(self, mut rx: mpsc::Receiver<QueuedTurn>) {
        loop {
            tokio::select! {
                turn = rx.recv() => {
                    match turn {
                        Some(turn) => self.process(turn).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(LANE_IDLE_REAP) => {
                    // Reap: deregister first so no new sender can grab the
                    // handle, then drain anything that raced in.
                    self.lanes.remove(self.key.as_str());
                    rx.close();
                    while let Ok(turn) = rx.try_recv() {
                        self.process(turn).await;
                    }
                    debug!(key = %self.key, "session lane reaped");
                    break;
                }
            }
        }
    }

    async fn process(&self, turn: QueuedTurn) {
        let QueuedTurn {
            turn_id,
            spec,
            cancel,
            outcome_tx,
        } = turn;
        let trace_id = spec.request.trace_id.clone();

        // Dropped before it started: interrupted, no side effects.
        if cancel.is_cancelled() {
            let reason = self.current_reason();
            debug!(key = %self.key, trace_id, "queued turn dropped before start");
            self.forget_token(turn_id);
            let _ = outcome_tx.send(TurnOutcome::Interrupted { reason });
            return;
        }

        let _ = self.sessions.set_status(&self.key, SessionStatus::Running);
        let outcome = self.run_with_fallbacks(&spec, &cancel).await;

        let final_status = match &outcome {
            TurnOutcome::Interrupted { .. } => SessionStatus::Cancelled,
            _ => SessionStatus::Idle,
        };
        let _ = self.sessions.set_status(&self.key, final_status);
        self.forget_token(turn_id);

        debug!(key = %self.key, trace_id, outcome = outcome_kind(&outcome), "turn finished");
        let _ = outcome_tx.send(outcome);
    }

    async fn run_with_fallbacks(&self, spec: &TurnSpec, cancel: &CancellationToken) -> TurnOutcome {
        let chain: Vec<&String> = std::iter::once(&spec.request.model)
            .chain(spec.fallback_models.iter())
            .collect();

        let mut last_error = DriverError::Model("no models attempted".into());
        for (attempt, model) in chain.iter().enumerate() {
            if attempt > 0 {
                let notice = FallbackNotice {
                    from_model: chain[attempt - 1].to_string(),
                    to_model: model.to_string(),
                    attempt: attempt as u32,
                    error: last_error.to_string(),
                };
                warn!(
                    key = %self.key,
                    from = %notice.from_model,
                    to = %notice.to_model,
                    attempt = notice.attempt,
                    "model fallback"
                );
                if let Some(hook) = &spec.on_fallback {
                    hook(notice);
                }
            }

            let mut request = spec.request.clone();
            request.model = model.to_string();

            let events = match self.driver.run_turn(request, cancel.clone()).await {
                Ok(events) => events,
                Err(e) => {
                    if !e.retryable() || attempt + 1 == chain.len() {
                        return TurnOutcome::Failed(e);
                    }
                    last_error = e;
                    continue;
                }
            };

            match self.pump(spec, events, cancel).await {
                PumpResult::Done { final_text } => {
                    return TurnOutcome::Ok {
                        final_text,
                        model: model.to_string(),
                    }
                }
                PumpResult::Interrupted => {
                    return TurnOutcome::Interrupted {
                        reason: self.current_reason(),
                    }
                }
                PumpResult::TimedOut => {
                    // The driver is obliged to abort at its next checkpoint.
                    cancel.cancel();
                    return TurnOutcome::Timeout;
                }
                PumpResult::Errored(e) => {
                    if !e.retryable() || attempt + 1 == chain.len() {
                        return TurnOutcome::Failed(e);
                    }
                    last_error = e;
                }
            }
        }

        TurnOutcome::Failed(last_error)
    }

    /// Forward driver events to the caller until the stream ends, errors,
    /// times out, or is cancelled.
    async fn pump(
        &self,
        spec: &TurnSpec,
        mut events: mpsc::Receiver<TurnEvent>,
        cancel: &CancellationToken,
    ) -> PumpResult {
        let mut final_text: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PumpResult::Interrupted,
                next = tokio::time::timeout(self.config.turn_timeout, events.recv()) => {
                    match next {
                        Err(_) => return PumpResult::TimedOut,
                        Ok(None) => return PumpResult::Done { final_text },
                        Ok(Some(event)) => {
                            match &event {
                                TurnEvent::Final(text) => final_text = Some(text.clone()),
                                TurnEvent::Error(e) => {
                                    let e = e.clone();
                                    // Drain-forward the error for observers,
                                    // then let the fallback chain decide.
                                    let _ = spec.events.send(event).await;
                                    return PumpResult::Errored(e);
                                }
                                _ => {}
                            }
                            // Stream order is the contract: deltas reach the
                            // transport in arrival order.
                            let _ = spec.events.send(event).await;
                        }
                    }
                }
            }
        }
    }

    fn current_reason(&self) -> String {
        self.interrupt_reason
            .lock()
            .expect("lane reason lock poisoned")
            .clone()
    }

    fn forget_token(&self, turn_id: u64) {
        self.tokens
            .lock()
            .expect("lane token lock poisoned")
            .retain(|(id, _)| *id != turn_id);
    }
}

fn outcome_kind(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Ok { .. } => "ok",
        TurnOutcome::Failed(_) => "failed",
        TurnOutcome::Interrupted { .. } => "interrupted",
        TurnOutcome::Timeout => "timeout",
    }
}
