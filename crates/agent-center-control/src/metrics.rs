//! Connection and frame counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Per-agent frame counters, held by the agent's session
#[derive(Debug, Default)]
pub struct AgentCounters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
}

impl AgentCounters {
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

/// Agent center counters
#[derive(Debug, Default)]
pub struct Metrics {
    admitted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    agents: DashMap<String, Arc<AgentCounters>>,
}

/// Serializable copy of the global counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub tracked_agents: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, agent: &AgentCounters) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        agent.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, agent: &AgentCounters) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        agent.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Create the counters for a newly active agent session
    pub fn register_agent(&self, agent_id: &str) -> Arc<AgentCounters> {
        let counters = Arc::new(AgentCounters::default());
        self.agents.insert(agent_id.to_string(), counters.clone());
        counters
    }

    /// Drop an agent's counters, unless a newer session already replaced them
    pub fn release_agent(&self, agent_id: &str, counters: &Arc<AgentCounters>) {
        self.agents
            .remove_if(agent_id, |_, current| Arc::ptr_eq(current, counters));
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<AgentCounters>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            tracked_agents: self.agents.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_admitted();
        metrics.record_admitted();
        metrics.record_rejected();

        let agent = metrics.register_agent("agent-1");
        metrics.record_received(&agent);
        metrics.record_received(&agent);
        metrics.record_sent(&agent);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.admitted, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.frames_sent, 1);
        assert_eq!(snapshot.tracked_agents, 1);
        assert_eq!(agent.frames_received(), 2);
        assert_eq!(agent.frames_sent(), 1);
    }

    #[test]
    fn test_release_only_own_counters() {
        let metrics = Metrics::new();
        let old = metrics.register_agent("agent-1");
        let new = metrics.register_agent("agent-1");

        metrics.release_agent("agent-1", &old);
        assert!(Arc::ptr_eq(&metrics.agent("agent-1").unwrap(), &new));

        metrics.release_agent("agent-1", &new);
        assert!(metrics.agent("agent-1").is_none());
        assert_eq!(metrics.snapshot().tracked_agents, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(Metrics::new().snapshot()).unwrap();
        assert_eq!(json["admitted"], 0);
        assert_eq!(json["tracked_agents"], 0);
    }
}
