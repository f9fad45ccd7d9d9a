use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which external provider an account is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Calendar,
    Coursework,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Calendar => "calendar",
            ProviderKind::Coursework => "coursework",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "calendar" | "google" => Ok(ProviderKind::Calendar),
            "coursework" | "canvas" => Ok(ProviderKind::Coursework),
            other => Err(format!("unknown provider kind `{}`", other)),
        }
    }
}

/// Encrypted credential bundle. Every token field holds ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One linked external identity owned by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub user_id: String,
    pub kind: ProviderKind,
    /// Email for calendar accounts, instance URL for coursework accounts.
    pub address: String,
    pub credential: Credential,
}

/// Input of the link flow. Relinking the same (user, kind, address) updates
/// the stored credential in place.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: String,
    pub kind: ProviderKind,
    pub address: String,
    pub credential: Credential,
}

/// Access token material produced by a refresh, already re-encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct RotatedToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for RotatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotatedToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
