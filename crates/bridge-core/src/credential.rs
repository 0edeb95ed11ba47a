//! Verified caller identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity established by the token authenticator and attached to the call context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub subject: String,
    pub username: Option<String>,
    pub issuer: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
