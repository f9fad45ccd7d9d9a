use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serenity::async_trait;
use tracing::{debug, warn};

use crate::clients::oauth::{AccessGrant, OAuthRefresher, check_status};
use crate::config::OAuthClientSettings;
use crate::crypto::TokenCipher;
use crate::errors::ProviderError;
use crate::models::account::{Account, Credential, ProviderKind};
use crate::models::item::{ItemTime, NormalizedItem, TimeWindow};
use crate::service::provider_service::{FetchOutcome, ProviderClient};

pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";
const USERINFO_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";
const PAGE_SIZE: &str = "250";

/// Endpoints used by the client. Overridden in tests to point at a mock server.
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub api_base: String,
    pub token_url: String,
    pub auth_url: String,
    pub userinfo_url: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/calendar/v3".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    #[serde(rename = "htmlLink")]
    html_link: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
}

#[derive(Debug, Deserialize)]
struct EventTime {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    date: Option<String>,
}

impl EventTime {
    fn parse(&self) -> Option<ItemTime> {
        self.date_time
            .as_deref()
            .or(self.date.as_deref())
            .and_then(ItemTime::parse)
    }
}

#[derive(Debug, Deserialize)]
struct CodeExchange {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
}

/// Tokens and address obtained by completing the consent flow. Tokens are
/// plaintext here and sealed by the caller before storage.
#[derive(Debug)]
pub struct LinkedCalendar {
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn normalize(event: GoogleEvent) -> Option<NormalizedItem> {
    if event.status.as_deref() == Some("cancelled") {
        return None;
    }
    let Some(start) = event.start.as_ref().and_then(EventTime::parse) else {
        warn!(event_id = %event.id, "skipping event without a usable start");
        return None;
    };
    let title = event
        .summary
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let mut item = NormalizedItem::new(event.id, title, start, ProviderKind::Calendar);
    item.end = event.end.as_ref().and_then(EventTime::parse);
    item.location = event.location.filter(|s| !s.trim().is_empty());
    item.body = event.description;
    item.url = event.html_link;
    Some(item)
}

#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    http: Client,
    cipher: TokenCipher,
    refresher: OAuthRefresher,
    oauth: OAuthClientSettings,
    redirect_uri: String,
    endpoints: GoogleEndpoints,
}

impl GoogleCalendarClient {
    pub fn new(http: Client, cipher: TokenCipher, oauth: OAuthClientSettings, redirect_uri: String) -> Self {
        Self::with_endpoints(http, cipher, oauth, redirect_uri, GoogleEndpoints::default())
    }

    pub fn with_endpoints(
        http: Client,
        cipher: TokenCipher,
        oauth: OAuthClientSettings,
        redirect_uri: String,
        endpoints: GoogleEndpoints,
    ) -> Self {
        let refresher = OAuthRefresher::new(http.clone(), oauth.clone());
        Self {
            http,
            cipher,
            refresher,
            oauth,
            redirect_uri,
            endpoints,
        }
    }

    /// Consent URL for the read-only calendar scope. Offline access so the
    /// exchange yields a refresh token.
    pub fn authorization_url(&self, state: &str) -> Result<String, ProviderError> {
        let client_id = self
            .oauth
            .client_id
            .as_deref()
            .ok_or_else(|| ProviderError::CredentialInvalid("GOOGLE_CLIENT_ID is not configured".to_string()))?;
        let scope = format!("{} {}", CALENDAR_SCOPE, USERINFO_SCOPE);
        let url = Url::parse_with_params(
            &self.endpoints.auth_url,
            &[
                ("response_type", "code"),
                ("client_id", client_id),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| ProviderError::Unavailable(format!("bad authorization endpoint: {}", e)))?;
        Ok(url.to_string())
    }

    /// Trades an authorization code for tokens and looks up the account email.
    pub async fn exchange_code(&self, code: &str, now: DateTime<Utc>) -> Result<LinkedCalendar, ProviderError> {
        let (Some(client_id), Some(client_secret)) =
            (self.oauth.client_id.as_deref(), self.oauth.client_secret.as_deref())
        else {
            return Err(ProviderError::CredentialInvalid(
                "Google OAuth client is not configured".to_string(),
            ));
        };
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("code", code),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        if response.status().is_client_error() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::CredentialInvalid(format!(
                "authorization code rejected ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        let tokens: CodeExchange = check_status(response, "code exchange")
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed token response: {}", e)))?;

        let email = self.validate_credential("", &tokens.access_token).await?;
        Ok(LinkedCalendar {
            email,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|secs| now + Duration::seconds(secs)),
        })
    }

    async fn access(&self, credential: &Credential) -> Result<AccessGrant, ProviderError> {
        self.refresher
            .access_token(&self.cipher, &self.endpoints.token_url, credential, Utc::now())
            .await
    }
}

#[async_trait]
impl ProviderClient for GoogleCalendarClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Calendar
    }

    async fn fetch_items(&self, account: &Account, window: &TimeWindow) -> Result<FetchOutcome, ProviderError> {
        let grant = self.access(&account.credential).await?;
        let url = format!("{}/calendars/primary/events", self.endpoints.api_base);
        let time_min = window.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let time_max = window.end.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("timeMin", time_min.as_str()),
                ("timeMax", time_max.as_str()),
                ("singleEvents", "true"),
                ("orderBy", "startTime"),
                ("maxResults", PAGE_SIZE),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let response = self
                .http
                .get(&url)
                .bearer_auth(&grant.token)
                .query(&query)
                .send()
                .await?;
            let page: EventsPage = check_status(response, "google calendar")
                .await?
                .json()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("malformed events page: {}", e)))?;

            items.extend(page.items.into_iter().filter_map(normalize));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(account_id = account.id, count = items.len(), "fetched calendar events");
        Ok(FetchOutcome {
            items,
            rotated: grant.rotated,
        })
    }

    async fn validate_credential(&self, _address: &str, access_token: &str) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        let info: UserInfo = check_status(response, "google userinfo")
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed userinfo: {}", e)))?;
        info.email
            .filter(|email| !email.trim().is_empty())
            .ok_or_else(|| ProviderError::CredentialInvalid("token does not expose an email address".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, cipher: TokenCipher) -> GoogleCalendarClient {
        GoogleCalendarClient::with_endpoints(
            Client::new(),
            cipher,
            OAuthClientSettings {
                client_id: Some("client-id".to_string()),
                client_secret: Some("client-secret".to_string()),
            },
            "http://localhost:8080/callback".to_string(),
            GoogleEndpoints {
                api_base: server.uri(),
                token_url: format!("{}/token", server.uri()),
                auth_url: format!("{}/auth", server.uri()),
                userinfo_url: format!("{}/userinfo", server.uri()),
            },
        )
    }

    fn account(cipher: &TokenCipher, expires_at: Option<DateTime<Utc>>) -> Account {
        Account {
            id: 7,
            user_id: "u1".to_string(),
            kind: ProviderKind::Calendar,
            address: "a@example.com".to_string(),
            credential: Credential {
                access_token: cipher.encrypt("access").unwrap(),
                refresh_token: Some(cipher.encrypt("refresh").unwrap()),
                expires_at,
            },
        }
    }

    fn window() -> TimeWindow {
        let start = DateTime::parse_from_rfc3339("2024-01-10T08:00:00Z").unwrap().with_timezone(&Utc);
        TimeWindow::ahead(start, Duration::days(7))
    }

    #[tokio::test]
    async fn follows_page_tokens_and_normalizes_all_day_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "holiday", "summary": "Holiday", "start": {"date": "2024-01-12"}, "end": {"date": "2024-01-13"}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(bearer_token("access"))
            .and(query_param("singleEvents", "true"))
            .and(query_param("timeMin", "2024-01-10T08:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "evt1", "summary": "Standup", "location": "Room 4",
                     "start": {"dateTime": "2024-01-10T09:30:00Z"}, "end": {"dateTime": "2024-01-10T10:00:00Z"}},
                    {"id": "gone", "status": "cancelled", "start": {"dateTime": "2024-01-10T11:00:00Z"}}
                ],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let cipher = TokenCipher::from_secret("google-tests").unwrap();
        let client = client_for(&server, cipher.clone());
        let outcome = client
            .fetch_items(&account(&cipher, None), &window())
            .await
            .unwrap();

        let ids: Vec<&str> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["evt1", "holiday"]);
        assert_eq!(outcome.items[0].location.as_deref(), Some("Room 4"));
        assert!(outcome.items[1].start.is_all_day());
        assert!(outcome.rotated.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(bearer_token("fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .expect(1)
            .mount(&server)
            .await;

        let cipher = TokenCipher::from_secret("google-tests").unwrap();
        let client = client_for(&server, cipher.clone());
        let outcome = client
            .fetch_items(&account(&cipher, Some(Utc::now() - Duration::minutes(1))), &window())
            .await
            .unwrap();

        let rotated = outcome.rotated.expect("token should rotate");
        assert_eq!(cipher.decrypt(&rotated.access_token).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn unauthorized_is_invalid_credential_and_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cipher = TokenCipher::from_secret("google-tests").unwrap();
        let client = client_for(&server, cipher.clone());
        let first = client.fetch_items(&account(&cipher, None), &window()).await;
        assert!(matches!(first, Err(ProviderError::CredentialInvalid(_))));
        let second = client.fetch_items(&account(&cipher, None), &window()).await;
        assert!(matches!(second, Err(ProviderError::Unavailable(_))));
    }

    #[tokio::test]
    async fn exchange_code_returns_tokens_and_email() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "granted",
                "refresh_token": "offline",
                "expires_in": 3599
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(bearer_token("granted"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"email": "a@example.com"})))
            .mount(&server)
            .await;

        let cipher = TokenCipher::from_secret("google-tests").unwrap();
        let client = client_for(&server, cipher);
        let now = Utc::now();
        let linked = client.exchange_code("auth-code", now).await.unwrap();
        assert_eq!(linked.email, "a@example.com");
        assert_eq!(linked.refresh_token.as_deref(), Some("offline"));
        assert_eq!(linked.expires_at, Some(now + Duration::seconds(3599)));
    }

    #[test]
    fn authorization_url_requests_offline_access() {
        let cipher = TokenCipher::from_secret("google-tests").unwrap();
        let client = GoogleCalendarClient::new(
            Client::new(),
            cipher,
            OAuthClientSettings {
                client_id: Some("client-id".to_string()),
                client_secret: None,
            },
            "http://localhost:8080/callback".to_string(),
        );
        let url = Url::parse(&client.authorization_url("state-123").unwrap()).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("state").map(String::as_str), Some("state-123"));
        assert_eq!(pairs.get("access_type").map(String::as_str), Some("offline"));
        assert!(pairs["scope"].contains(CALENDAR_SCOPE));
    }
}
