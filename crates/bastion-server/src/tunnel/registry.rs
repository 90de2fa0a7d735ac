//! Agent registry for reverse tunnels.
//!
//! Stores live agent connections indexed by the id each agent registered
//! under. The id is the routing key the backend dialer resolves targets to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connection::{AgentConnection, AgentTransport, TunnelOptions};

/// Summary of one registered agent, as served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub sessions: usize,
}

/// Registry of connected agents.
///
/// The table mutex guards registration, lookup and removal only; it is never
/// held while talking to an agent.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<AgentConnection>>>,
    next_conn_id: AtomicU64,
    options: TunnelOptions,
}

impl AgentRegistry {
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            options,
        }
    }

    /// Register `transport` under `agent_id` and start its read loop.
    ///
    /// A connection already registered under the same id is replaced and
    /// shut down, closing every session it hosted. When the new connection's
    /// read loop ends it removes itself, unless it has been replaced in turn.
    pub async fn register_agent(
        self: &Arc<Self>,
        agent_id: &str,
        transport: AgentTransport,
    ) -> Arc<AgentConnection> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (conn, read_loop) =
            AgentConnection::start(agent_id, conn_id, transport, self.options);

        let previous = self
            .agents
            .lock()
            .await
            .insert(agent_id.to_string(), conn.clone());
        if let Some(previous) = previous {
            warn!(
                agent_id,
                old_conn = previous.conn_id(),
                new_conn = conn_id,
                sessions = previous.session_count(),
                "agent re-registered, closing previous connection"
            );
            previous.shutdown().await;
        }
        info!(agent_id, conn_id, "agent registered");

        let registry = Arc::clone(self);
        let id = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = read_loop.await {
                warn!(agent_id = %id, error = %e, "agent read loop panicked");
            }
            registry.unregister(&id, conn_id).await;
        });

        conn
    }

    /// Remove `agent_id` if it is still served by connection `conn_id`.
    pub async fn unregister(&self, agent_id: &str, conn_id: u64) -> bool {
        let mut agents = self.agents.lock().await;
        match agents.get(agent_id) {
            Some(conn) if conn.conn_id() == conn_id => {
                agents.remove(agent_id);
                info!(agent_id, conn_id, "agent unregistered");
                true
            }
            _ => {
                debug!(agent_id, conn_id, "stale unregister ignored");
                false
            }
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.agents.lock().await.contains_key(agent_id)
    }

    /// All registered agents, ordered by id.
    pub async fn list(&self) -> Vec<AgentSummary> {
        let agents = self.agents.lock().await;
        let mut list: Vec<AgentSummary> = agents
            .values()
            .map(|conn| AgentSummary {
                agent_id: conn.agent_id().to_string(),
                connected_at: conn.connected_at(),
                sessions: conn.session_count(),
            })
            .collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }
}

#[cfg(test)]
impl AgentRegistry {
    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::tests::transport;
    use super::*;
    use std::time::Duration;

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(TunnelOptions {
            channel_capacity: 8,
            ack_timeout: Duration::from_secs(2),
        }))
    }

    async fn wait_until_gone(registry: &AgentRegistry, agent_id: &str) {
        for _ in 0..100 {
            if !registry.contains(agent_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {agent_id} still registered");
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = registry();
        let (t, _agent) = transport();
        registry.register_agent("agentA", t).await;
        assert!(registry.get("agentA").await.is_some());
        assert!(registry.get("agentB").await.is_none());

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].agent_id, "agentA");
        assert_eq!(list[0].sessions, 0);
    }

    #[tokio::test]
    async fn transport_error_removes_agent() {
        let registry = registry();
        let (t, agent) = transport();
        let conn = registry.register_agent("agentA", t).await;
        agent.fail();
        wait_until_gone(&registry, "agentA").await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn re_registration_replaces_and_closes_previous() {
        let registry = registry();
        let (t1, mut agent1) = transport();
        let old = registry.register_agent("agentA", t1).await;
        let opening = {
            let old = old.clone();
            tokio::spawn(async move { old.create_session("s1", "127.0.0.1:22").await })
        };
        agent1.accept_forward().await;
        let mut s1 = opening.await.unwrap().unwrap();

        let (t2, _agent2) = transport();
        let new = registry.register_agent("agentA", t2).await;

        assert!(s1.rx.recv().await.is_none());
        assert!(old.is_closed());
        assert!(!new.is_closed());

        // The old loop's exit must not evict the replacement.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = registry.get("agentA").await.unwrap();
        assert_eq!(current.conn_id(), new.conn_id());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_unregister_is_ignored() {
        let registry = registry();
        let (t, _agent) = transport();
        let conn = registry.register_agent("agentA", t).await;
        assert!(!registry.unregister("agentA", conn.conn_id() + 100).await);
        assert!(registry.unregister("agentA", conn.conn_id()).await);
        assert!(!registry.contains("agentA").await);
    }
}
