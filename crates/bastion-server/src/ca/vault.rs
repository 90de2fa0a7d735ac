//! HashiCorp Vault SSH secrets engine client.
//!
//! Signing is `POST {address}/v1/{mount}/sign/{role}`; the Vault role of the
//! same name controls TTL and allowed extensions.

use async_trait::async_trait;
use bastion_core::{BastionError, BastionResult};
use serde::{Deserialize, Serialize};
use ssh_key::Certificate;
use std::time::Duration;
use tracing::{debug, info};

use super::{parse_certificate, CertificateAuthority, SignRequest};

pub struct VaultCa {
    client: reqwest::Client,
    address: String,
    mount: String,
    token: String,
}

#[derive(Serialize)]
struct SignBody<'a> {
    public_key: &'a str,
    valid_principals: &'a str,
    cert_type: &'a str,
}

#[derive(Deserialize)]
struct SignResponse {
    data: SignData,
}

#[derive(Deserialize)]
struct SignData {
    signed_key: String,
}

#[derive(Deserialize)]
struct VaultErrors {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultCa {
    pub fn new(address: &str, mount: &str, token: &str, timeout: Duration) -> BastionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BastionError::Config(format!("vault client: {e}")))?;
        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn sign_url(&self, role: &str) -> String {
        format!("{}/v1/{}/sign/{}", self.address, self.mount, role)
    }

    /// Check the token is accepted before serving traffic.
    pub async fn lookup_self(&self) -> BastionResult<()> {
        let url = format!("{}/v1/auth/token/lookup-self", self.address);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| BastionError::Certificate(format!("vault unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BastionError::Certificate(vault_error(status, &body)));
        }
        info!(address = %self.address, "vault token accepted");
        Ok(())
    }
}

fn vault_error(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<VaultErrors>(body)
        .ok()
        .filter(|e| !e.errors.is_empty())
        .map(|e| e.errors.join("; "))
        .unwrap_or_else(|| body.trim().to_string());
    format!("vault returned {status}: {detail}")
}

#[async_trait]
impl CertificateAuthority for VaultCa {
    async fn sign(&self, request: &SignRequest) -> BastionResult<Certificate> {
        let body = SignBody {
            public_key: &request.public_key,
            valid_principals: &request.principal,
            cert_type: "user",
        };
        let response = self
            .client
            .post(self.sign_url(&request.role))
            .header("X-Vault-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BastionError::Certificate(format!("vault request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BastionError::Certificate(format!("vault response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(BastionError::Certificate(vault_error(status, &text)));
        }

        let parsed: SignResponse = serde_json::from_str(&text)
            .map_err(|e| BastionError::Certificate(format!("unexpected vault response: {e}")))?;
        let cert = parse_certificate(&parsed.data.signed_key)?;
        debug!(role = %request.role, principal = %request.principal, "vault signed certificate");
        Ok(cert)
    }

    fn name(&self) -> &'static str {
        "vault"
    }

    async fn ready(&self) -> BastionResult<()> {
        self.lookup_self().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::LocalCa;
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use rand::rngs::OsRng;
    use ssh_key::{Algorithm, PrivateKey};
    use std::collections::HashMap;
    use std::sync::Arc;

    const TOKEN: &str = "s.test-token";

    async fn fake_sign(
        State(ca): State<Arc<LocalCa>>,
        Path((mount, role)): Path<(String, String)>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if headers.get("X-Vault-Token").and_then(|v| v.to_str().ok()) != Some(TOKEN) {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({"errors": ["permission denied"]})),
            );
        }
        if mount != "ssh-client-signer" || role == "unknown-role" {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"errors": [format!("unknown role: {role}")]})),
            );
        }
        assert_eq!(body["cert_type"], "user");
        let request = SignRequest {
            public_key: body["public_key"].as_str().unwrap().to_string(),
            role,
            principal: body["valid_principals"].as_str().unwrap().to_string(),
        };
        let cert = ca.sign(&request).await.unwrap();
        (
            StatusCode::OK,
            Json(serde_json::json!({"data": {"signed_key": cert.to_openssh().unwrap()}})),
        )
    }

    async fn fake_lookup(headers: HeaderMap) -> StatusCode {
        if headers.get("X-Vault-Token").and_then(|v| v.to_str().ok()) == Some(TOKEN) {
            StatusCode::OK
        } else {
            StatusCode::FORBIDDEN
        }
    }

    async fn fake_vault() -> String {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let ca = Arc::new(LocalCa::new(key, Duration::from_secs(600), HashMap::new()));
        let app = Router::new()
            .route("/v1/{mount}/sign/{role}", post(fake_sign))
            .route("/v1/auth/token/lookup-self", get(fake_lookup))
            .with_state(ca);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(role: &str) -> SignRequest {
        SignRequest {
            public_key: PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                .unwrap()
                .public_key()
                .to_openssh()
                .unwrap(),
            role: role.into(),
            principal: "root".into(),
        }
    }

    #[tokio::test]
    async fn signs_through_vault() {
        let address = fake_vault().await;
        let vault =
            VaultCa::new(&address, "ssh-client-signer", TOKEN, Duration::from_secs(5)).unwrap();
        vault.lookup_self().await.unwrap();
        let cert = vault.sign(&request("admin-role")).await.unwrap();
        assert_eq!(cert.valid_principals(), &["root".to_string()]);
    }

    #[tokio::test]
    async fn vault_rejection_is_certificate_error() {
        let address = fake_vault().await;
        let vault =
            VaultCa::new(&address, "ssh-client-signer", TOKEN, Duration::from_secs(5)).unwrap();
        let err = vault.sign(&request("unknown-role")).await.unwrap_err();
        assert!(matches!(err, BastionError::Certificate(_)));
        assert!(err.to_string().contains("unknown role"));
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let address = fake_vault().await;
        let vault =
            VaultCa::new(&address, "ssh-client-signer", "wrong", Duration::from_secs(5)).unwrap();
        assert!(vault.lookup_self().await.is_err());
        let err = vault.sign(&request("admin-role")).await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn url_layout() {
        let vault = VaultCa::new(
            "http://vault:8200/",
            "/ssh-client-signer/",
            TOKEN,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            vault.sign_url("dev-role"),
            "http://vault:8200/v1/ssh-client-signer/sign/dev-role"
        );
    }
}
