use std::sync::Arc;

use calendarBot::clients::canvas::CanvasClient;
use calendarBot::clients::google_calendar::{GoogleCalendarClient, GoogleEndpoints};
use calendarBot::config::OAuthClientSettings;
use calendarBot::crypto::TokenCipher;
use calendarBot::errors::{LinkError, ProviderError};
use calendarBot::models::account::{Credential, NewAccount, ProviderKind};
use calendarBot::service::link_service::LinkService;
use calendarBot::store::{AccountStore, SqliteStore};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use wiremock::matchers::{bearer_token, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

fn google_for(server: &MockServer, cipher: &TokenCipher) -> GoogleCalendarClient {
    GoogleCalendarClient::with_endpoints(
        Client::new(),
        cipher.clone(),
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

fn state_of(consent_url: &str) -> String {
    Url::parse(consent_url)
        .unwrap()
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .unwrap()
}

async fn mount_google(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "google-access",
            "refresh_token": "google-refresh",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(bearer_token("google-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "email": "student@example.com"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn canvas_token_is_validated_and_stored_encrypted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/users/self"))
        .and(bearer_token("personal-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 5, "name": "Sam"})))
        .mount(&server)
        .await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cipher = TokenCipher::from_secret("link-tests").unwrap();
    let canvas = Arc::new(CanvasClient::new(Client::new(), cipher.clone(), OAuthClientSettings::default()));
    let service = LinkService::new(store.clone(), cipher.clone()).with_canvas(canvas);

    let account = service
        .link_canvas("u1", &format!("{}/", server.uri()), " personal-token ")
        .await
        .unwrap();

    assert_eq!(account.kind, ProviderKind::Coursework);
    assert_eq!(account.address, server.uri());
    assert_ne!(account.credential.access_token, "personal-token");
    assert_eq!(cipher.decrypt(&account.credential.access_token).unwrap(), "personal-token");
    assert_eq!(store.list_users().await.unwrap(), vec!["u1".to_string()]);
}

#[tokio::test]
async fn rejected_canvas_token_is_not_stored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/users/self"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cipher = TokenCipher::from_secret("link-tests").unwrap();
    let canvas = Arc::new(CanvasClient::new(Client::new(), cipher.clone(), OAuthClientSettings::default()));
    let service = LinkService::new(store.clone(), cipher).with_canvas(canvas);

    let err = service.link_canvas("u1", &server.uri(), "bad").await.unwrap_err();

    assert!(matches!(err, LinkError::Provider(ProviderError::CredentialInvalid(_))));
    assert!(store.list_accounts_for_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn google_consent_flow_links_the_calendar() {
    let server = MockServer::start().await;
    mount_google(&server).await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cipher = TokenCipher::from_secret("link-tests").unwrap();
    let service = LinkService::new(store.clone(), cipher.clone()).with_google(google_for(&server, &cipher));
    let now = at("2024-01-10T08:00:00Z");

    let consent = service.begin_google("u1", now).unwrap();
    assert!(consent.contains("access_type=offline"));
    let state = state_of(&consent);
    let redirect = format!("http://localhost:8080/callback?state={}&code=auth-code", state);
    let account = service
        .complete_google("u1", &redirect, now + Duration::minutes(2))
        .await
        .unwrap();

    assert_eq!(account.kind, ProviderKind::Calendar);
    assert_eq!(account.address, "student@example.com");
    assert_eq!(cipher.decrypt(&account.credential.access_token).unwrap(), "google-access");
    let refresh = account.credential.refresh_token.as_deref().unwrap();
    assert_eq!(cipher.decrypt(refresh).unwrap(), "google-refresh");
    assert_eq!(account.credential.expires_at, Some(now + Duration::minutes(2) + Duration::hours(1)));

    let reused = service.complete_google("u1", &redirect, now + Duration::minutes(3)).await;
    assert!(matches!(reused, Err(LinkError::UnknownState)));
}

#[tokio::test]
async fn google_state_is_bound_to_the_requesting_user() {
    let server = MockServer::start().await;
    mount_google(&server).await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cipher = TokenCipher::from_secret("link-tests").unwrap();
    let service = LinkService::new(store.clone(), cipher.clone()).with_google(google_for(&server, &cipher));
    let now = at("2024-01-10T08:00:00Z");

    let state = state_of(&service.begin_google("u1", now).unwrap());
    let redirect = format!("http://localhost:8080/callback?state={}&code=auth-code", state);
    let result = service.complete_google("u2", &redirect, now).await;

    assert!(matches!(result, Err(LinkError::WrongUser)));
    assert!(store.list_accounts_for_user("u2").await.unwrap().is_empty());
    assert_eq!(service.pending().len(now), 0);
}

#[tokio::test]
async fn expired_state_is_rejected() {
    let server = MockServer::start().await;
    mount_google(&server).await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cipher = TokenCipher::from_secret("link-tests").unwrap();
    let service = LinkService::new(store, cipher.clone()).with_google(google_for(&server, &cipher));
    let now = at("2024-01-10T08:00:00Z");

    let state = state_of(&service.begin_google("u1", now).unwrap());
    let redirect = format!("http://localhost:8080/callback?state={}&code=auth-code", state);
    let result = service.complete_google("u1", &redirect, now + Duration::minutes(11)).await;

    assert!(matches!(result, Err(LinkError::UnknownState)));
}

#[tokio::test]
async fn unlink_removes_only_the_named_account() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cipher = TokenCipher::from_secret("link-tests").unwrap();
    let service = LinkService::new(store.clone(), cipher);
    for address in ["a@example.com", "b@example.com"] {
        store
            .upsert_account(NewAccount {
                user_id: "u1".to_string(),
                kind: ProviderKind::Calendar,
                address: address.to_string(),
                credential: Credential {
                    access_token: "sealed".to_string(),
                    refresh_token: None,
                    expires_at: None,
                },
            })
            .await
            .unwrap();
    }

    assert!(service.unlink("u1", ProviderKind::Calendar, "a@example.com").await.unwrap());
    assert!(!service.unlink("u1", ProviderKind::Calendar, "a@example.com").await.unwrap());
    let left = store.list_accounts_for_user("u1").await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].address, "b@example.com");
}
