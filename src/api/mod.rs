//! AT Protocol API layer
//!
//! [`AtpGateway`] is the seam between the session core and the wire: the
//! real implementation ([`bluesky::BlueskyGateway`]) speaks XRPC over HTTPS,
//! tests substitute a mock. [`AgentFactory`] sits on top and turns raw
//! session responses into [`AccountCredential`]s.

pub mod bluesky;

pub use bluesky::{Agent, BlueskyGateway, DEFAULT_SERVICE, ImageUpload, Profile};

use chrono::Utc;
use std::future::Future;

use crate::error::SessionError;
use crate::models::AccountCredential;

/// Raw result of a successful createSession call
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// Account DID
    pub did: String,
    /// Account handle
    pub handle: String,
    /// Fresh access token
    pub access_jwt: String,
    /// Fresh refresh token
    pub refresh_jwt: String,
    /// Whether the account is not deactivated/takendown
    pub active: bool,
}

/// Raw result of a successful refreshSession call (both tokens rotate)
#[derive(Debug, Clone)]
pub struct RefreshedSession {
    /// Rotated access token
    pub access_jwt: String,
    /// Rotated refresh token
    pub refresh_jwt: String,
}

/// Wire-level session operations against a PDS.
///
/// Futures are `Send` so the session manager can drive refreshes from
/// spawned tasks; implementors just write `async fn`.
pub trait AtpGateway {
    /// Exchange identifier+password for a new session
    fn create_session(
        &self,
        service: &str,
        identifier: &str,
        password: &str,
    ) -> impl Future<Output = Result<CreatedSession, SessionError>> + Send;

    /// Exchange a refresh token for rotated tokens
    fn refresh_session(
        &self,
        service: &str,
        refresh_jwt: &str,
    ) -> impl Future<Output = Result<RefreshedSession, SessionError>> + Send;

    /// Invalidate the session server-side (takes the refresh token)
    fn delete_session(
        &self,
        service: &str,
        refresh_jwt: &str,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Constructs authenticated credentials from login/refresh round trips
#[derive(Debug, Clone)]
pub struct AgentFactory<G> {
    gateway: G,
    service: String,
    handle_suffix: String,
}

impl<G: AtpGateway> AgentFactory<G> {
    /// Create a factory bound to one service endpoint
    pub fn new(gateway: G, service: impl Into<String>, handle_suffix: impl Into<String>) -> Self {
        Self {
            gateway,
            service: service.into(),
            handle_suffix: handle_suffix.into(),
        }
    }

    /// The service endpoint this factory talks to
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Log in and mint a fresh credential, both timestamps set to now.
    ///
    /// The identifier is normalized first: emails and fully-qualified
    /// handles pass through verbatim, bare names get the default suffix.
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<AccountCredential, SessionError> {
        let identifier = normalize_identifier(identifier, &self.handle_suffix);
        let session = self
            .gateway
            .create_session(&self.service, &identifier, password)
            .await?;

        let now = Utc::now();
        Ok(AccountCredential {
            did: session.did,
            handle: session.handle,
            access_jwt: session.access_jwt,
            refresh_jwt: session.refresh_jwt,
            access_issued_at: now,
            refresh_issued_at: now,
            active: session.active,
            last_used_at: Some(now),
        })
    }

    /// Rotate tokens for an existing credential.
    ///
    /// `RefreshRejected` means the refresh token is dead server-side; the
    /// caller decides what to do with the credential. Never retried here.
    pub async fn refresh(
        &self,
        credential: &AccountCredential,
    ) -> Result<AccountCredential, SessionError> {
        let rotated = self
            .gateway
            .refresh_session(&self.service, &credential.refresh_jwt)
            .await?;

        let mut updated = credential.clone();
        updated.apply_refresh(rotated.access_jwt, rotated.refresh_jwt, Utc::now());
        Ok(updated)
    }

    /// Best-effort remote session invalidation; failures are logged and
    /// swallowed so logout always succeeds locally.
    pub async fn delete_remote_session(&self, credential: &AccountCredential) {
        if let Err(e) = self
            .gateway
            .delete_session(&self.service, &credential.refresh_jwt)
            .await
        {
            tracing::warn!("Failed to delete remote session for {}: {}", credential.did, e);
        }
    }
}

/// Normalize a login identifier.
///
/// - contains `@` -> email, verbatim
/// - contains `.` -> fully-qualified handle, verbatim
/// - otherwise   -> bare name, append the default suffix
fn normalize_identifier(identifier: &str, suffix: &str) -> String {
    let identifier = identifier.trim();
    if identifier.contains('@') || identifier.contains('.') {
        identifier.to_string()
    } else {
        format!("{identifier}.{suffix}")
    }
}
