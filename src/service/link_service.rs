use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::google_calendar::GoogleCalendarClient;
use crate::crypto::TokenCipher;
use crate::errors::{LinkError, ProviderError};
use crate::models::account::{Account, Credential, NewAccount, ProviderKind};
use crate::service::provider_service::ProviderClient;
use crate::store::AccountStore;

pub const PENDING_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
struct PendingEntry {
    user_id: String,
    created_at: DateTime<Utc>,
}

/// Outstanding authorization requests keyed by a random state token. Each
/// entry can be consumed once and lapses after the TTL.
#[derive(Debug)]
pub struct PendingAuthorizations {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl Default for PendingAuthorizations {
    fn default() -> Self {
        Self::new(Duration::minutes(PENDING_TTL_MINUTES))
    }
}

impl PendingAuthorizations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn purge(&self, entries: &mut HashMap<String, PendingEntry>, now: DateTime<Utc>) {
        entries.retain(|_, entry| now - entry.created_at < self.ttl);
    }

    pub fn issue(&self, user_id: &str, now: DateTime<Utc>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.purge(&mut entries, now);
        entries.insert(
            token.clone(),
            PendingEntry {
                user_id: user_id.to_string(),
                created_at: now,
            },
        );
        token
    }

    /// Removes the entry and returns its user. `None` when unknown, already
    /// consumed or expired.
    pub fn consume(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.purge(&mut entries, now);
        entries.remove(token).map(|entry| entry.user_id)
    }

    pub fn len(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.purge(&mut entries, now);
        entries.len()
    }
}

/// `state` and `code` from the URL the consent screen redirected to.
pub fn parse_redirect(redirect: &str) -> Result<(String, String), LinkError> {
    let url = Url::parse(redirect.trim()).map_err(|e| LinkError::InvalidRedirect(e.to_string()))?;
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(error) = params.get("error") {
        return Err(LinkError::InvalidRedirect(format!("consent denied: {}", error)));
    }
    let state = params.get("state").cloned().ok_or(LinkError::MissingParameter("state"))?;
    let code = params.get("code").cloned().ok_or(LinkError::MissingParameter("code"))?;
    Ok((state, code))
}

/// Account linking and unlinking. Secrets are sealed here before they reach
/// the store.
pub struct LinkService<S: AccountStore + ?Sized> {
    store: Arc<S>,
    cipher: TokenCipher,
    pending: PendingAuthorizations,
    google: Option<GoogleCalendarClient>,
    canvas: Option<Arc<dyn ProviderClient>>,
}

impl<S: AccountStore + ?Sized> LinkService<S> {
    pub fn new(store: Arc<S>, cipher: TokenCipher) -> Self {
        Self {
            store,
            cipher,
            pending: PendingAuthorizations::default(),
            google: None,
            canvas: None,
        }
    }

    pub fn with_google(mut self, google: GoogleCalendarClient) -> Self {
        self.google = Some(google);
        self
    }

    pub fn with_canvas(mut self, canvas: Arc<dyn ProviderClient>) -> Self {
        self.canvas = Some(canvas);
        self
    }

    pub fn pending(&self) -> &PendingAuthorizations {
        &self.pending
    }

    fn google(&self) -> Result<&GoogleCalendarClient, LinkError> {
        self.google.as_ref().ok_or_else(|| {
            LinkError::Provider(ProviderError::CredentialInvalid(
                "Google linking is not configured".to_string(),
            ))
        })
    }

    /// Validates a personal access token and stores it for the user.
    pub async fn link_canvas(&self, user_id: &str, instance_url: &str, api_token: &str) -> Result<Account, LinkError> {
        let canvas = self.canvas.as_ref().ok_or_else(|| {
            LinkError::Provider(ProviderError::CredentialInvalid(
                "Canvas linking is not configured".to_string(),
            ))
        })?;
        let address = canvas.validate_credential(instance_url, api_token.trim()).await?;
        let account = self
            .store
            .upsert_account(NewAccount {
                user_id: user_id.to_string(),
                kind: ProviderKind::Coursework,
                address,
                credential: Credential {
                    access_token: self.cipher.encrypt(api_token.trim())?,
                    refresh_token: None,
                    expires_at: None,
                },
            })
            .await?;
        info!(user = user_id, account_id = account.id, "linked coursework account");
        Ok(account)
    }

    /// Starts the consent flow; returns the URL the user must open.
    pub fn begin_google(&self, user_id: &str, now: DateTime<Utc>) -> Result<String, LinkError> {
        let google = self.google()?;
        let state = self.pending.issue(user_id, now);
        Ok(google.authorization_url(&state)?)
    }

    /// Finishes the consent flow from the redirect URL. The pending state is
    /// spent even when the exchange later fails.
    pub async fn complete_google(&self, user_id: &str, redirect: &str, now: DateTime<Utc>) -> Result<Account, LinkError> {
        let google = self.google()?;
        let (state, code) = parse_redirect(redirect)?;
        let owner = self.pending.consume(&state, now).ok_or(LinkError::UnknownState)?;
        if owner != user_id {
            warn!(user = user_id, "authorization state belongs to another user");
            return Err(LinkError::WrongUser);
        }

        let linked = google.exchange_code(&code, now).await?;
        let refresh_token = match linked.refresh_token.as_deref() {
            Some(token) => Some(self.cipher.encrypt(token)?),
            None => None,
        };
        let account = self
            .store
            .upsert_account(NewAccount {
                user_id: user_id.to_string(),
                kind: ProviderKind::Calendar,
                address: linked.email,
                credential: Credential {
                    access_token: self.cipher.encrypt(&linked.access_token)?,
                    refresh_token,
                    expires_at: linked.expires_at,
                },
            })
            .await?;
        info!(user = user_id, account_id = account.id, "linked calendar account");
        Ok(account)
    }

    pub async fn unlink(&self, user_id: &str, kind: ProviderKind, address: &str) -> Result<bool, LinkError> {
        let removed = self.store.remove_account(user_id, kind, address).await?;
        if removed {
            info!(user = user_id, %kind, "unlinked account");
        }
        Ok(removed)
    }
}
