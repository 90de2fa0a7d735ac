//! Target routing: direct dial or through a registered agent.

use bastion_core::identity::host_part;
use bastion_core::{BastionError, BastionResult, TargetPattern};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::RouteEntry;
use crate::tunnel::AgentRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Plain TCP to `host:port`.
    Direct,
    /// Through the agent registered under this id.
    Agent(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

/// Resolves targets to routes.
///
/// Order: configured `[[routes]]` (first match wins, against `host:port` or
/// the bare host), then an agent registered under the exact `host:port` or
/// bare host, then direct.
pub struct RouteTable {
    routes: Vec<(TargetPattern, String)>,
    registry: Arc<AgentRegistry>,
}

impl RouteTable {
    pub fn new(entries: &[RouteEntry], registry: Arc<AgentRegistry>) -> Self {
        Self {
            routes: entries
                .iter()
                .map(|e| (TargetPattern::parse(&e.pattern), e.agent.clone()))
                .collect(),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn resolve(&self, target: &str) -> BastionResult<Route> {
        let host = host_part(target);
        if let Some((pattern, agent)) = self
            .routes
            .iter()
            .find(|(p, _)| p.matches(target) || p.matches(host))
        {
            if !self.registry.contains(agent).await {
                return Err(BastionError::Tunnel(format!(
                    "target {target} routes to agent '{agent}', which is not registered"
                )));
            }
            debug!(target, pattern = %pattern, agent = %agent, "configured route");
            return Ok(Route::Agent(agent.clone()));
        }
        for candidate in [target, host] {
            if self.registry.contains(candidate).await {
                return Ok(Route::Agent(candidate.to_string()));
            }
        }
        Ok(Route::Direct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::connection::tests::transport;
    use crate::tunnel::TunnelOptions;

    fn routes() -> Vec<RouteEntry> {
        vec![RouteEntry {
            pattern: "192.168.50.*".into(),
            agent: "branch".into(),
        }]
    }

    #[tokio::test]
    async fn unrouted_target_is_direct() {
        let registry = Arc::new(AgentRegistry::new(TunnelOptions::default()));
        let table = RouteTable::new(&routes(), registry);
        assert_eq!(table.resolve("10.0.0.5:22").await.unwrap(), Route::Direct);
    }

    #[tokio::test]
    async fn configured_route_needs_registered_agent() {
        let registry = Arc::new(AgentRegistry::new(TunnelOptions::default()));
        let table = RouteTable::new(&routes(), registry.clone());
        let err = table.resolve("192.168.50.7:22").await.unwrap_err();
        assert!(matches!(err, BastionError::Tunnel(_)));

        let (t, _agent) = transport();
        registry.register_agent("branch", t).await;
        assert_eq!(
            table.resolve("192.168.50.7:22").await.unwrap(),
            Route::Agent("branch".into())
        );
    }

    #[tokio::test]
    async fn agent_registered_under_target_name() {
        let registry = Arc::new(AgentRegistry::new(TunnelOptions::default()));
        let table = RouteTable::new(&[], registry.clone());
        let (t1, _a1) = transport();
        let (t2, _a2) = transport();
        registry.register_agent("db.internal", t1).await;
        registry.register_agent("cache:2222", t2).await;

        assert_eq!(
            table.resolve("db.internal:22").await.unwrap(),
            Route::Agent("db.internal".into())
        );
        assert_eq!(
            table.resolve("cache:2222").await.unwrap(),
            Route::Agent("cache:2222".into())
        );
        assert_eq!(table.resolve("cache:22").await.unwrap(), Route::Direct);
    }
}
