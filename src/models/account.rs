//! Account credential model for stored sessions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One known account's credentials, as persisted in the session store.
///
/// New optional fields must carry `#[serde(default)]` so stores written by
/// older versions stay readable; unknown fields in newer stores are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredential {
    /// Stable decentralized identifier; primary key, never changes
    pub did: String,
    /// Human-readable alias for the DID (mutable, display only)
    pub handle: String,
    /// Short-lived bearer credential for API calls
    pub access_jwt: String,
    /// Long-lived credential exchanged for new access tokens
    pub refresh_jwt: String,
    /// When the access token was (re)issued
    pub access_issued_at: DateTime<Utc>,
    /// When the refresh token was (re)issued / last validated
    pub refresh_issued_at: DateTime<Utc>,
    /// Whether the remote reports the account as not deactivated/takendown
    #[serde(default = "default_active")]
    pub active: bool,
    /// Last time this account was current (used to pick a fallback on logout)
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl AccountCredential {
    /// Age of the access token relative to `now`
    pub fn access_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.access_issued_at
    }

    /// Age of the refresh token relative to `now`
    pub fn refresh_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.refresh_issued_at
    }

    /// Apply rotated tokens from a successful refresh.
    ///
    /// The remote rotates both tokens together, so both timestamps advance.
    pub fn apply_refresh(&mut self, access_jwt: String, refresh_jwt: String, now: DateTime<Utc>) {
        self.access_jwt = access_jwt;
        self.refresh_jwt = refresh_jwt;
        self.access_issued_at = now;
        self.refresh_issued_at = now;
    }
}
