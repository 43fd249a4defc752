//! Client-side authentication: credential + optional TOTP verification and
//! bearer session tokens, in front of the credential store.

pub mod sigv4;
pub mod store;
pub mod totp;

use std::time::Duration;

use axum::http::HeaderMap;

pub use sigv4::{SigV4Signer, SigV4Timestamp, SignedHeaders};
pub use store::{
    CredentialStore, Principal, Session, TwoFactorEnrollment, CREDENTIAL_PREFIX, SESSION_PREFIX,
};

use crate::{GatewayError, Result};

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_SESSION_TOKEN: &str = "x-session-token";
pub const HEADER_TOTP_CODE: &str = "x-totp-code";

pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Stateless façade over the credential store. Every operation runs on the
/// caller's task; auth faults are terminal and never retried.
#[derive(Clone)]
pub struct Authenticator {
    store: CredentialStore,
    require_two_factor: bool,
    session_lifetime: Duration,
}

impl Authenticator {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            require_two_factor: false,
            session_lifetime: DEFAULT_SESSION_LIFETIME,
        }
    }

    pub fn with_required_two_factor(mut self, required: bool) -> Self {
        self.require_two_factor = required;
        self
    }

    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = lifetime;
        self
    }

    pub fn session_lifetime(&self) -> Duration {
        self.session_lifetime
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Resolves the caller. A session token wins outright; otherwise the
    /// credential is verified and, when two-factor is required, the TOTP
    /// or backup code header as well.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal> {
        if let Some(token) = extract_session_token(headers) {
            let (_session, principal_id) = self.store.verify_session(&token).await?;
            return self.active_principal(principal_id).await;
        }

        let Some(credential) = extract_credential(headers) else {
            return Err(GatewayError::MissingCredential);
        };
        let principal = self.store.verify(&credential).await?;

        if self.require_two_factor && self.store.two_factor_enabled(principal.id).await? {
            let Some(code) = extract_header(headers, HEADER_TOTP_CODE) else {
                return Err(GatewayError::TwoFactorRequired);
            };
            self.store.verify_two_factor(principal.id, &code).await?;
        }

        Ok(principal)
    }

    /// Credential (+ code when the principal has a second factor) in,
    /// session token out.
    pub async fn login(
        &self,
        credential: &str,
        totp_code: Option<&str>,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<(String, Principal)> {
        let principal = self.store.verify(credential).await?;

        if self.store.two_factor_enabled(principal.id).await? {
            let Some(code) = totp_code else {
                return Err(GatewayError::TwoFactorRequired);
            };
            self.store.verify_two_factor(principal.id, code).await?;
        }

        let token = self
            .store
            .mint_session(principal.id, self.session_lifetime, ip_address, user_agent)
            .await?;
        Ok((token, principal))
    }

    /// Mints a replacement token and revokes the presented one.
    pub async fn refresh(
        &self,
        token: &str,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<(String, Principal)> {
        let (_session, principal_id) = self.store.verify_session(token).await?;
        let principal = self.active_principal(principal_id).await?;
        let new_token = self
            .store
            .mint_session(principal.id, self.session_lifetime, ip_address, user_agent)
            .await?;
        self.store.revoke_session(token).await?;
        Ok((new_token, principal))
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        let (_session, _principal_id) = self.store.verify_session(token).await?;
        self.store.revoke_session(token).await
    }

    pub async fn sessions(&self, token: &str) -> Result<Vec<Session>> {
        let (_session, principal_id) = self.store.verify_session(token).await?;
        self.store.list_sessions(principal_id).await
    }

    async fn active_principal(&self, principal_id: i64) -> Result<Principal> {
        let principal = self
            .store
            .principal(principal_id)
            .await?
            .ok_or(GatewayError::UnknownSession)?;
        if !principal.is_active {
            return Err(GatewayError::UnknownSession);
        }
        if let Some(expires_at) = principal.expires_at {
            if crate::types::now_epoch_seconds() >= expires_at {
                return Err(GatewayError::CredentialExpired);
            }
        }
        Ok(principal)
    }
}

pub fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// A session token arrives in its own header or as a bearer value with the
/// session prefix.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    extract_header(headers, HEADER_SESSION_TOKEN)
        .or_else(|| extract_bearer(headers).filter(|token| token.starts_with(SESSION_PREFIX)))
}

/// A credential arrives as `X-API-Key` or as a non-session bearer value.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    extract_header(headers, HEADER_API_KEY)
        .or_else(|| extract_bearer(headers).filter(|token| !token.starts_with(SESSION_PREFIX)))
}
