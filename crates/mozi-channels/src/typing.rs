//! Ref-counted typing indicator.
//!
//! Several concurrent turns for the same peer (a queued turn starting as
//! another finishes, a heartbeat overlapping a user prompt) must not fight
//! over the indicator. Each caller acquires a guard; the underlying
//! adapter indicator starts on the first acquire and stops when the last
//! guard drops, on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::channel::{ChannelAdapter, TypingStop};

#[derive(Default)]
struct PeerTyping {
    count: usize,
    stop: Option<TypingStop>,
}

/// Shared per-peer typing state for one channel.
#[derive(Clone, Default)]
pub struct TypingShare {
    peers: Arc<Mutex<HashMap<String, PeerTyping>>>,
}

impl TypingShare {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the indicator for `peer_id`, starting it on 0→1.
    ///
    /// Channels without typing support yield an inert guard — callers
    /// never need to branch on capability.
    pub async fn acquire(&self, adapter: &dyn ChannelAdapter, peer_id: &str) -> TypingGuard {
        let first = {
            let mut peers = self.peers.lock().expect("typing lock poisoned");
            let entry = peers.entry(peer_id.to_string()).or_default();
            entry.count += 1;
            entry.count == 1
        };

        if first {
            match adapter.begin_typing(peer_id).await {
                Ok(stop) => {
                    let mut peers = self.peers.lock().expect("typing lock poisoned");
                    match peers.get_mut(peer_id) {
                        // Normal case: still held, park the stop handle.
                        Some(entry) if entry.count > 0 => entry.stop = Some(stop),
                        // Released while we awaited; stop immediately.
                        _ => stop.stop(),
                    }
                }
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "typing indicator unavailable");
                }
            }
        }

        TypingGuard {
            share: Arc::clone(&self.peers),
            peer_id: peer_id.to_string(),
        }
    }
}

/// RAII guard for one acquisition; release happens on drop.
pub struct TypingGuard {
    share: Arc<Mutex<HashMap<String, PeerTyping>>>,
    peer_id: String,
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        let mut peers = self.share.lock().expect("typing lock poisoned");
        if let Some(entry) = peers.get_mut(&self.peer_id) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                if let Some(stop) = entry.stop.take() {
                    stop.stop();
                }
                peers.remove(&self.peer_id);
            }
        }
    }
}
