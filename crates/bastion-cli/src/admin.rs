//! Client for the bastion's HTTP admin API.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub role: String,
    pub targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub connected_at: String,
    pub sessions: usize,
}

pub struct AdminClient {
    base: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{url} returned {status}: {}", body.trim());
        }
        response
            .json()
            .await
            .with_context(|| format!("unexpected response from {url}"))
    }

    pub async fn policies(&self) -> Result<BTreeMap<String, PolicyEntry>> {
        self.get_json("/admin/rbac/list").await
    }

    pub async fn agents(&self) -> Result<Vec<AgentSummary>> {
        self.get_json("/admin/agents").await
    }

    /// Ask the bastion to reload its policy from `path` (a path on the
    /// bastion host).
    pub async fn reload(&self, path: &str) -> Result<String> {
        let url = self.url("/admin/rbac/reload");
        let response = self
            .http
            .post(&url)
            .query(&[("path", path)])
            .send()
            .await
            .with_context(|| format!("cannot reach {url}"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("{}", body.trim());
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = AdminClient::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(client.url("/admin/agents"), "http://127.0.0.1:8080/admin/agents");
    }

    #[test]
    fn decodes_admin_payloads() {
        let policies: BTreeMap<String, PolicyEntry> = serde_json::from_str(
            r#"{"alice":{"role":"admin-role","targets":["10.0.0.5"]}}"#,
        )
        .unwrap();
        assert_eq!(policies["alice"].role, "admin-role");

        let agents: Vec<AgentSummary> = serde_json::from_str(
            r#"[{"agent_id":"agentA","connected_at":"2024-06-10T08:00:00Z","sessions":2}]"#,
        )
        .unwrap();
        assert_eq!(agents[0].sessions, 2);
    }
}
