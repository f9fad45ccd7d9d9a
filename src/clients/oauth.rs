use chrono::{DateTime, Duration, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::OAuthClientSettings;
use crate::crypto::TokenCipher;
use crate::errors::ProviderError;
use crate::models::account::{Credential, RotatedToken};

/// Tokens expiring within this margin are refreshed before use.
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(expiry) => now >= expiry - Duration::minutes(REFRESH_MARGIN_MINUTES),
        None => false,
    }
}

/// Maps a provider response status onto the error taxonomy. 401 and 403 mean
/// the credential is no good; anything else unsuccessful is an outage.
pub async fn check_status(response: Response, context: &str) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::CredentialInvalid(
            format!("{} rejected credentials ({}): {}", context, status, snippet),
        )),
        _ => Err(ProviderError::Unavailable(format!(
            "{} returned {}: {}",
            context, status, snippet
        ))),
    }
}

/// Plaintext access token ready for a request, plus the re-encrypted token
/// when a refresh happened.
#[derive(Debug)]
pub struct AccessGrant {
    pub token: String,
    pub rotated: Option<RotatedToken>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// Refresh-token grant against an OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    http: reqwest::Client,
    client: OAuthClientSettings,
}

impl OAuthRefresher {
    pub fn new(http: reqwest::Client, client: OAuthClientSettings) -> Self {
        Self { http, client }
    }

    /// Decrypts the stored access token, refreshing it first when it is
    /// expired or about to expire.
    pub async fn access_token(
        &self,
        cipher: &TokenCipher,
        token_url: &str,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, ProviderError> {
        if !needs_refresh(credential.expires_at, now) {
            let token = cipher
                .decrypt(&credential.access_token)
                .map_err(|e| ProviderError::CredentialInvalid(format!("stored access token unreadable: {}", e)))?;
            return Ok(AccessGrant { token, rotated: None });
        }

        let Some(sealed_refresh) = credential.refresh_token.as_deref() else {
            return Err(ProviderError::CredentialInvalid(
                "access token expired and no refresh token is stored".to_string(),
            ));
        };
        let refresh_token = cipher
            .decrypt(sealed_refresh)
            .map_err(|e| ProviderError::CredentialInvalid(format!("stored refresh token unreadable: {}", e)))?;
        let (Some(client_id), Some(client_secret)) =
            (self.client.client_id.as_deref(), self.client.client_secret.as_deref())
        else {
            return Err(ProviderError::CredentialInvalid(
                "access token expired and no OAuth client is configured".to_string(),
            ));
        };

        debug!(token_url, "refreshing access token");
        let response = self
            .http
            .post(token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "token refresh rejected");
            return Err(ProviderError::CredentialInvalid(format!(
                "token refresh rejected ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        let response = check_status(response, "token refresh").await?;
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed token response: {}", e)))?;

        let expires_at = refreshed.expires_in.map(|secs| now + Duration::seconds(secs));
        let sealed = cipher
            .encrypt(&refreshed.access_token)
            .map_err(|e| ProviderError::Unavailable(format!("could not seal refreshed token: {}", e)))?;
        Ok(AccessGrant {
            token: refreshed.access_token,
            rotated: Some(RotatedToken {
                access_token: sealed,
                expires_at,
            }),
        })
    }
}
