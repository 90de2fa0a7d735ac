//! The bastion session state machine, independent of the inbound transport.
//!
//! ```text
//! AwaitHandshake -> ParseIdentity -> AuthorizeRbac -> IssueCertificate
//!     -> DialBackend -> BridgeChannels -> Closed
//! ```
//!
//! Every failure goes straight to `Closed` with a tagged [`BastionError`];
//! nothing is retried. The handshake and bridge stages are driven by the
//! SSH front-end; this module covers the stages in between.

use bastion_core::identity::target_with_port;
use bastion_core::{BastionError, BastionResult, PrincipalRequest};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::credential::EphemeralKey;
use crate::backend::{BackendDialer, BackendStream, DialRequest, PtyRequest};
use crate::ca::{CertificateAuthority, SignRequest};
use crate::config::AccountsSection;
use crate::policy::PolicyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    AwaitHandshake,
    ParseIdentity,
    AuthorizeRbac,
    IssueCertificate,
    DialBackend,
    BridgeChannels,
    Closed,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStage::AwaitHandshake => "await_handshake",
            SessionStage::ParseIdentity => "parse_identity",
            SessionStage::AuthorizeRbac => "authorize_rbac",
            SessionStage::IssueCertificate => "issue_certificate",
            SessionStage::DialBackend => "dial_backend",
            SessionStage::BridgeChannels => "bridge_channels",
            SessionStage::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Static role to backend OS account mapping.
#[derive(Debug, Clone)]
pub struct AccountMap {
    privileged_role: String,
    privileged_account: String,
    default_account: String,
}

impl AccountMap {
    pub fn account_for(&self, role: &str) -> &str {
        if role == self.privileged_role {
            &self.privileged_account
        } else {
            &self.default_account
        }
    }
}

impl From<&AccountsSection> for AccountMap {
    fn from(section: &AccountsSection) -> Self {
        Self {
            privileged_role: section.privileged_role.clone(),
            privileged_account: section.privileged_account.clone(),
            default_account: section.default_account.clone(),
        }
    }
}

/// Result of a successful pipeline run.
pub struct EstablishedSession {
    pub request: PrincipalRequest,
    /// Target with port.
    pub target: String,
    pub role: String,
    pub account: String,
    pub backend: BackendStream,
}

pub struct SessionPipeline {
    policy: Arc<PolicyStore>,
    ca: Arc<dyn CertificateAuthority>,
    dialer: Arc<dyn BackendDialer>,
    accounts: AccountMap,
    default_port: u16,
    ca_timeout: Duration,
}

impl SessionPipeline {
    pub fn new(
        policy: Arc<PolicyStore>,
        ca: Arc<dyn CertificateAuthority>,
        dialer: Arc<dyn BackendDialer>,
        accounts: AccountMap,
        default_port: u16,
        ca_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            ca,
            dialer,
            accounts,
            default_port,
            ca_timeout,
        }
    }

    /// Resolve `user+target` to `(role, account)`.
    pub fn authorize(&self, request: &PrincipalRequest) -> BastionResult<(String, String)> {
        let role = self
            .policy
            .authorize(&request.proxy_user, &request.target_host)?;
        let account = self.accounts.account_for(&role).to_string();
        Ok((role, account))
    }

    async fn issue(
        &self,
        key: &EphemeralKey,
        request: &PrincipalRequest,
        role: &str,
        account: &str,
    ) -> BastionResult<ssh_key::Certificate> {
        let sign = SignRequest {
            public_key: key.public_openssh(&format!("{}@bastion", request.proxy_user))?,
            role: role.to_string(),
            principal: account.to_string(),
        };
        match tokio::time::timeout(self.ca_timeout, self.ca.sign(&sign)).await {
            Ok(result) => result,
            Err(_) => Err(BastionError::Certificate(format!(
                "{} CA did not answer within {:?}",
                self.ca.name(),
                self.ca_timeout
            ))),
        }
    }

    /// Run parse, authorize, issue and dial for `identity`.
    pub async fn establish(
        &self,
        identity: &str,
        pty: PtyRequest,
    ) -> BastionResult<EstablishedSession> {
        let mut stage = SessionStage::ParseIdentity;
        let result = self.run(identity, pty, &mut stage).await;
        if let Err(e) = &result {
            warn!(identity, stage = %stage, kind = e.kind(), error = %e, "session rejected");
        }
        result
    }

    async fn run(
        &self,
        identity: &str,
        pty: PtyRequest,
        stage: &mut SessionStage,
    ) -> BastionResult<EstablishedSession> {
        let request = PrincipalRequest::parse(identity)?;

        *stage = SessionStage::AuthorizeRbac;
        let (role, account) = self.authorize(&request)?;
        debug!(user = %request.proxy_user, target = %request.target_host, role = %role, account = %account, "authorized");

        *stage = SessionStage::IssueCertificate;
        let key = EphemeralKey::generate();
        let certificate = self.issue(&key, &request, &role, &account).await?;

        *stage = SessionStage::DialBackend;
        let target = target_with_port(&request.target_host, self.default_port);
        let backend = self
            .dialer
            .dial(DialRequest {
                target: target.clone(),
                account: account.clone(),
                key: key.into_keypair(),
                certificate,
                pty,
            })
            .await?;

        info!(
            user = %request.proxy_user,
            target = %target,
            role = %role,
            account = %account,
            route = %backend.route(),
            "session established"
        );
        Ok(EstablishedSession {
            request,
            target,
            role,
            account,
            backend,
        })
    }
}
