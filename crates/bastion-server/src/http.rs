//! HTTP surface: agent registration and the admin endpoints.
//!
//! - `GET /ws?agent_id=<id>` upgrades to a WebSocket and registers the agent
//! - `GET|POST /admin/rbac/reload?path=<p>` reloads the policy store
//! - `GET /admin/rbac/list` returns the policy mapping
//! - `GET /admin/agents` lists registered agents

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::policy::PolicyStore;
use crate::tunnel::{websocket, AgentRegistry};

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<PolicyStore>,
    pub registry: Arc<AgentRegistry>,
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReloadParams {
    path: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(register_agent))
        .route("/admin/rbac/reload", get(reload_policy).post(reload_policy))
        .route("/admin/rbac/list", get(list_policy))
        .route("/admin/agents", get(list_agents))
        .with_state(state)
}

async fn register_agent(
    State(state): State<AppState>,
    Query(params): Query<RegisterParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(agent_id) = params.agent_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing agent_id").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        state
            .registry
            .register_agent(&agent_id, websocket::agent_transport(socket))
            .await;
    })
}

async fn reload_policy(
    State(state): State<AppState>,
    Query(params): Query<ReloadParams>,
) -> Response {
    let Some(path) = params.path.filter(|p| !p.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing path").into_response();
    };
    match state.policy.reload(Path::new(&path)) {
        Ok(users) => {
            info!(path = %path, users, "policy reloaded via admin API");
            "reloaded".into_response()
        }
        Err(e) => {
            error!(path = %path, error = %e, "policy reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("reload failed: {e}"),
            )
                .into_response()
        }
    }
}

async fn list_policy(State(state): State<AppState>) -> Response {
    Json(state.policy.list()).into_response()
}

async fn list_agents(State(state): State<AppState>) -> Response {
    Json(state.registry.list().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelOptions;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    async fn serve() -> (String, AppState) {
        let policy = PolicyStore::new();
        policy
            .reload_from_str(r#"[{"user":"alice","role":"admin-role","targets":["10.0.0.5"]}]"#)
            .unwrap();
        let state = AppState {
            policy: Arc::new(policy),
            registry: Arc::new(AgentRegistry::new(TunnelOptions::default())),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("127.0.0.1:{}", addr.port()), state)
    }

    #[tokio::test]
    async fn registration_requires_agent_id() {
        let (addr, _) = serve().await;
        let response = reqwest::get(format!("http://{addr}/ws")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(response.text().await.unwrap(), "missing agent_id");

        let response = reqwest::get(format!("http://{addr}/ws?agent_id=")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn websocket_registers_and_forwards() {
        let (addr, state) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?agent_id=agentA"))
            .await
            .unwrap();

        let mut conn = None;
        for _ in 0..100 {
            conn = state.registry.get("agentA").await;
            if conn.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let conn = conn.expect("agent registered");

        let agents: serde_json::Value = reqwest::get(format!("http://{addr}/admin/agents"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agents[0]["agent_id"], "agentA");

        let open = tokio::spawn(async move { conn.open_stream("127.0.0.1:22").await });
        let forward = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => bastion_core::ControlMessage::decode(text.as_str()).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        let id = forward.id().to_string();
        assert_eq!(
            forward,
            bastion_core::ControlMessage::forward(id.clone(), "127.0.0.1:22")
        );
        let ack = bastion_core::ControlMessage::ack_ok(id.clone()).encode().unwrap();
        ws.send(Message::Text(ack.into())).await.unwrap();
        let stream = open.await.unwrap().unwrap();
        assert_eq!(stream.session_id(), id);
    }

    #[tokio::test]
    async fn reload_endpoint_reports_outcome() {
        let (addr, state) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("policies.json");
        std::fs::write(
            &good,
            r#"[{"user":"bob","role":"dev-role","targets":["10.0.1.*"]}]"#,
        )
        .unwrap();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/admin/rbac/reload"))
            .query(&[("path", good.to_str().unwrap())])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "reloaded");
        assert!(state.policy.lookup("bob").is_some());
        assert!(state.policy.lookup("alice").is_none());

        let response = client
            .get(format!("http://{addr}/admin/rbac/reload"))
            .query(&[("path", dir.path().join("missing.json").to_str().unwrap())])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.text().await.unwrap().starts_with("reload failed:"));
        assert!(state.policy.lookup("bob").is_some());

        let response = client
            .get(format!("http://{addr}/admin/rbac/reload"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_endpoint_returns_mapping() {
        let (addr, _) = serve().await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/admin/rbac/list"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["alice"]["role"], "admin-role");
        assert_eq!(body["alice"]["targets"][0], "10.0.0.5");
    }
}
