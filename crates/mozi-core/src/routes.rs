//! Last-route ledger: where each agent most recently spoke.
//!
//! The heartbeat scheduler re-enters the dispatch pipeline through the last
//! channel/peer an agent was active on. The ledger has explicit lifecycle —
//! constructed at runtime start, dropped at stop — rather than living in a
//! lazy global.

use std::collections::HashMap;
use std::sync::RwLock;

/// The channel/peer pair an agent last handled a prompt on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRoute {
    pub channel: String,
    pub peer_id: String,
    pub peer_kind: crate::types::PeerKind,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct RouteLedger {
    routes: RwLock<HashMap<String, LastRoute>>,
}

impl RouteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent_id: &str, route: LastRoute) {
        self.routes
            .write()
            .expect("route ledger lock poisoned")
            .insert(agent_id.to_string(), route);
    }

    pub fn get(&self, agent_id: &str) -> Option<LastRoute> {
        self.routes
            .read()
            .expect("route ledger lock poisoned")
            .get(agent_id)
            .cloned()
    }
}
