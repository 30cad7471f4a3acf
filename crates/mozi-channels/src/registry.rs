use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    channel::ChannelAdapter,
    error::ChannelError,
    types::{ChannelEvent, ChannelStatus, EventSink},
};

/// Backoff floor between reconnect attempts.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling between reconnect attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// How long a supervisor keeps retrying before giving up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectPolicy {
    /// Total retry budget; `None` retries until cancelled.
    pub max_retry_time: Option<Duration>,
}

/// Holds every registered adapter and the single inbound event lane.
///
/// Registration happens during host assembly; afterwards the registry is
/// shared immutably (`Arc<ChannelRegistry>`) across tasks.
pub struct ChannelRegistry {
    adapters: HashMap<String, (Arc<dyn ChannelAdapter>, ConnectPolicy)>,
    events_tx: mpsc::Sender<ChannelEvent>,
}

impl ChannelRegistry {
    /// Create a registry plus the receiver for its inbound event lane.
    ///
    /// The host loop owns the receiver; every adapter's `message`, `error`
    /// and `status` events funnel through it.
    pub fn new(event_capacity: usize) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(event_capacity);
        (
            Self {
                adapters: HashMap::new(),
                events_tx: tx,
            },
            rx,
        )
    }

    /// Sink for an adapter to emit events through. Hand one to each
    /// adapter at construction time.
    pub fn sink(&self, channel_id: &str) -> EventSink {
        EventSink::new(channel_id, self.events_tx.clone())
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.register_with_policy(adapter, ConnectPolicy::default());
    }

    pub fn register_with_policy(&mut self, adapter: Arc<dyn ChannelAdapter>, policy: ConnectPolicy) {
        let id = adapter.id().to_string();
        info!(channel = %id, name = %adapter.display_name(), "registering channel adapter");
        self.adapters.insert(id, (adapter, policy));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(id).map(|(a, _)| Arc::clone(a))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current status of every adapter, sorted by id for stable output.
    pub fn statuses(&self) -> Vec<(String, ChannelStatus)> {
        let mut out: Vec<(String, ChannelStatus)> = self
            .adapters
            .iter()
            .map(|(id, (a, _))| (id.clone(), a.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Spawn one connect supervisor per adapter and return immediately.
    ///
    /// Each supervisor applies jittered exponential backoff within
    /// [`BACKOFF_BASE`, `BACKOFF_CAP`], honors `cancel`, and stops on
    /// fatal errors so a bad token can't cause a connection storm.
    pub fn connect_all(&self, cancel: &CancellationToken) {
        for (id, (adapter, policy)) in &self.adapters {
            let adapter = Arc::clone(adapter);
            let policy = *policy;
            let cancel = cancel.clone();
            let id = id.clone();
            let sink = self.sink(&id);
            tokio::spawn(async move {
                supervise_connect(&id, adapter, policy, cancel, sink).await;
            });
        }
    }

    pub async fn disconnect_all(&self) {
        for (id, (adapter, _)) in &self.adapters {
            info!(channel = %id, "disconnecting channel");
            if let Err(e) = adapter.disconnect().await {
                warn!(channel = %id, error = %e, "error while disconnecting channel");
            }
        }
    }
}

/// Drive one adapter to a connected state, retrying with backoff.
async fn supervise_connect(
    id: &str,
    adapter: Arc<dyn ChannelAdapter>,
    policy: ConnectPolicy,
    cancel: CancellationToken,
    sink: EventSink,
) {
    let started = tokio::time::Instant::now();
    let mut delay = BACKOFF_BASE;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        sink.status(ChannelStatus::Connecting).await;
        match adapter.connect().await {
            Ok(()) => {
                info!(channel = %id, attempt, "channel connected");
                sink.status(ChannelStatus::Connected).await;
                return;
            }
            Err(e @ ChannelError::Fatal(_)) => {
                // Invalid credentials: retrying only hammers the vendor.
                error!(channel = %id, error = %e, "fatal connect error; supervision stopped");
                sink.status(ChannelStatus::Error(e.to_string())).await;
                sink.error(e.to_string()).await;
                return;
            }
            Err(e) => {
                if let Some(budget) = policy.max_retry_time {
                    if started.elapsed() >= budget {
                        error!(channel = %id, error = %e, "retry budget exhausted");
                        sink.status(ChannelStatus::Error(e.to_string())).await;
                        return;
                    }
                }
                let total = delay + jitter(delay);
                warn!(
                    channel = %id,
                    attempt,
                    error = %e,
                    retry_after_ms = total.as_millis() as u64,
                    "channel connect failed, retrying with backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(total) => {}
                    _ = cancel.cancelled() => {
                        info!(channel = %id, "connect supervision cancelled");
                        return;
                    }
                }
                delay = (delay * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// Jitter offset in `[0, JITTER_FRACTION * base)`, derived from the clock
/// so we avoid a rand dependency.
fn jitter(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let max_jitter_ms = (base.as_millis() as f64 * JITTER_FRACTION) as u64;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(nanos % max_jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mozi_core::types::OutboundMessage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyAdapter {
        attempts_before_success: u32,
        attempts: AtomicU32,
        fatal: bool,
        status: Mutex<ChannelStatus>,
    }

    impl FlakyAdapter {
        fn new(attempts_before_success: u32, fatal: bool) -> Self {
            Self {
                attempts_before_success,
                attempts: AtomicU32::new(0),
                fatal,
                status: Mutex::new(ChannelStatus::Disconnected),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for FlakyAdapter {
        fn id(&self) -> &str {
            "flaky"
        }
        fn display_name(&self) -> &str {
            "Flaky"
        }
        async fn connect(&self) -> Result<(), ChannelError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fatal {
                return Err(ChannelError::Fatal("401 unauthorized".into()));
            }
            if n <= self.attempts_before_success {
                return Err(ChannelError::Recoverable("connection refused".into()));
            }
            *self.status.lock().unwrap() = ChannelStatus::Connected;
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ChannelError> {
            *self.status.lock().unwrap() = ChannelStatus::Disconnected;
            Ok(())
        }
        fn status(&self) -> ChannelStatus {
            self.status.lock().unwrap().clone()
        }
        async fn send(&self, _peer: &str, _msg: &OutboundMessage) -> Result<String, ChannelError> {
            Ok("m1".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_retries_until_connected() {
        let (registry, mut rx) = ChannelRegistry::new(16);
        let adapter = Arc::new(FlakyAdapter::new(2, false));
        let sink = registry.sink("flaky");
        let cancel = CancellationToken::new();
        let a2 = Arc::clone(&adapter);
        let task = tokio::spawn(async move {
            supervise_connect("flaky", a2, ConnectPolicy::default(), cancel, sink).await;
        });

        // Drain status events until Connected; advance virtual time so the
        // backoff sleeps complete.
        loop {
            tokio::select! {
                ev = rx.recv() => {
                    if let Some(ChannelEvent::Status { status: ChannelStatus::Connected, .. }) = ev {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        task.await.unwrap();
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_supervision() {
        let (registry, mut rx) = ChannelRegistry::new(16);
        let adapter = Arc::new(FlakyAdapter::new(0, true));
        let sink = registry.sink("flaky");
        supervise_connect(
            "flaky",
            Arc::clone(&adapter) as Arc<dyn ChannelAdapter>,
            ConnectPolicy::default(),
            CancellationToken::new(),
            sink,
        )
        .await;

        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
        let mut saw_error_status = false;
        while let Ok(ev) = rx.try_recv() {
            if let ChannelEvent::Status {
                status: ChannelStatus::Error(_),
                ..
            } = ev
            {
                saw_error_status = true;
            }
        }
        assert!(saw_error_status);
    }

    #[tokio::test]
    async fn statuses_are_sorted_by_id() {
        let (mut registry, _rx) = ChannelRegistry::new(4);
        registry.register(Arc::new(FlakyAdapter::new(0, false)));
        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, "flaky");
    }
}
