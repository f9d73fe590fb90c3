use std::{collections::HashMap, time::Duration};

use tracing::{debug, warn};

use crate::{
    matcher::{RawTable, is_running},
    session::{ForwardingSession, Phase, SessionId},
};

/// Timing and budget of the reconnection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before each reconnection attempt
    pub attempt_delay: Duration,
    /// Failed attempts tolerated before the run gives up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_delay: Duration::from_millis(5000),
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow `failed` failed attempts
    pub fn should_retry(&self, failed: u32) -> bool {
        failed < self.max_attempts
    }
}

/// Pod listings of one reconciliation tick, keyed by namespace override
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    tables: HashMap<Option<String>, RawTable>,
}

impl ClusterSnapshot {
    pub fn insert(&mut self, namespace: Option<String>, table: RawTable) {
        self.tables.insert(namespace, table);
    }

    pub fn contains(&self, namespace: &Option<String>) -> bool {
        self.tables.contains_key(namespace)
    }

    pub fn table_for(&self, namespace: &Option<String>) -> Option<&RawTable> {
        self.tables.get(namespace)
    }
}

/// Sessions whose pod is gone or whose tunnel is not forwarding.
///
/// Restarting sessions already have a reconnection in flight and are
/// skipped, as are sessions that are no longer running at all.
pub fn dead_sessions<'a>(
    snapshot: &ClusterSnapshot,
    sessions: impl IntoIterator<Item = (&'a SessionId, &'a ForwardingSession)>,
) -> Vec<SessionId> {
    let mut dead = Vec::new();

    for (&id, session) in sessions {
        if !session.phase().is_forwarding() {
            continue;
        }

        let pod_running = snapshot
            .table_for(&session.spec.namespace)
            .is_some_and(|table| is_running(table, &session.instance_id));

        if !pod_running {
            warn!(pod = %session.spec.name, "Pod {} is no longer running", session.instance_id);
            dead.push(id);
        } else if session.phase() != Phase::Active {
            warn!(pod = %session.spec.name, "Tunnel to {} is not forwarding", session.instance_id);
            dead.push(id);
        } else {
            debug!(pod = %session.spec.name, "Pod {} healthy", session.instance_id);
        }
    }

    dead
}
