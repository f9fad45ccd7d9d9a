use chrono::{DateTime, Utc};
use reqwest::header::LINK;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serenity::async_trait;
use tracing::{debug, warn};

use crate::clients::oauth::{AccessGrant, OAuthRefresher, check_status};
use crate::config::OAuthClientSettings;
use crate::crypto::TokenCipher;
use crate::errors::ProviderError;
use crate::models::account::{Account, ProviderKind};
use crate::models::item::{ItemTime, NormalizedItem, TimeWindow};
use crate::service::provider_service::{FetchOutcome, ProviderClient};

pub const ANNOUNCEMENT_BODY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
struct Course {
    id: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Assignment {
    id: i64,
    name: Option<String>,
    due_at: Option<String>,
    html_url: Option<String>,
    points_possible: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DiscussionTopic {
    id: i64,
    title: Option<String>,
    message: Option<String>,
    posted_at: Option<String>,
    html_url: Option<String>,
    author: Option<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    id: i64,
    name: Option<String>,
}

/// Instance URL without trailing slashes, with a scheme.
pub fn normalize_instance_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Target of the `rel="next"` entry of a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|param| {
            let param = param.trim().replace(' ', "");
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Wide enough that html2text never wraps a Canvas message.
const RENDER_WIDTH: usize = 10_000;

/// Plain text of a rich-content message with whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let text = match html2text::from_read(html.as_bytes(), RENDER_WIDTH) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "could not render announcement html; sending it raw");
            html.to_string()
        }
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_body(body: &str, limit: usize) -> String {
    if body.chars().count() <= limit {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(limit).collect();
    cut.push_str("...");
    cut
}

fn parse_instant(raw: Option<&str>) -> Option<DateTime<Utc>> {
    match raw.and_then(ItemTime::parse)? {
        ItemTime::At(at) => Some(at),
        ItemTime::AllDay(_) => None,
    }
}

#[derive(Debug, Clone)]
pub struct CanvasClient {
    http: Client,
    cipher: TokenCipher,
    refresher: OAuthRefresher,
}

impl CanvasClient {
    pub fn new(http: Client, cipher: TokenCipher, oauth: OAuthClientSettings) -> Self {
        let refresher = OAuthRefresher::new(http.clone(), oauth);
        Self { http, cipher, refresher }
    }

    async fn access(&self, account: &Account) -> Result<AccessGrant, ProviderError> {
        let token_url = format!("{}/login/oauth2/token", normalize_instance_url(&account.address));
        self.refresher
            .access_token(&self.cipher, &token_url, &account.credential, Utc::now())
            .await
    }

    async fn get(&self, url: &str, token: &str, query: &[(&str, &str)]) -> Result<Response, ProviderError> {
        let response = self.http.get(url).bearer_auth(token).query(query).send().await?;
        check_status(response, "canvas").await
    }

    /// Collects every page of a list endpoint, following `Link` headers.
    async fn get_all<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ProviderError> {
        let mut collected = Vec::new();
        let mut response = self.get(url, token, query).await?;
        loop {
            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);
            let page: Vec<T> = response
                .json()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("malformed canvas page: {}", e)))?;
            collected.extend(page);
            match next {
                Some(next_url) => response = self.get(&next_url, token, &[]).await?,
                None => break,
            }
        }
        Ok(collected)
    }

    async fn active_courses(&self, base: &str, token: &str) -> Result<Vec<Course>, ProviderError> {
        self.get_all(
            &format!("{}/api/v1/courses", base),
            token,
            &[("enrollment_state", "active"), ("per_page", "100")],
        )
        .await
    }
}

#[async_trait]
impl ProviderClient for CanvasClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Coursework
    }

    /// Assignments due inside `window` across the user's active courses.
    async fn fetch_items(&self, account: &Account, window: &TimeWindow) -> Result<FetchOutcome, ProviderError> {
        let grant = self.access(account).await?;
        let base = normalize_instance_url(&account.address);
        let courses = self.active_courses(&base, &grant.token).await?;

        let mut items = Vec::new();
        for course in courses {
            let course_name = course.name.unwrap_or_else(|| "Unknown Course".to_string());
            let assignments: Vec<Assignment> = match self
                .get_all(
                    &format!("{}/api/v1/courses/{}/assignments", base, course.id),
                    &grant.token,
                    &[("order_by", "due_at"), ("per_page", "100")],
                )
                .await
            {
                Ok(assignments) => assignments,
                // Concluded or observer-only courses can refuse the list.
                Err(ProviderError::CredentialInvalid(reason)) => {
                    warn!(course_id = course.id, %reason, "assignments not visible for course");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for assignment in assignments {
                let Some(due) = parse_instant(assignment.due_at.as_deref()) else {
                    continue;
                };
                if !window.contains(due) {
                    continue;
                }
                let mut item = NormalizedItem::new(
                    assignment.id.to_string(),
                    assignment.name.unwrap_or_else(|| "Untitled".to_string()),
                    ItemTime::At(due),
                    ProviderKind::Coursework,
                );
                item.course = Some(course_name.clone());
                item.url = assignment.html_url;
                item.body = assignment.points_possible.map(|points| format!("{} points", points));
                items.push(item);
            }
        }

        debug!(account_id = account.id, count = items.len(), "fetched canvas assignments");
        Ok(FetchOutcome {
            items,
            rotated: grant.rotated,
        })
    }

    /// Announcements posted inside `window`, newest first.
    async fn fetch_announcements(&self, account: &Account, window: &TimeWindow) -> Result<FetchOutcome, ProviderError> {
        let grant = self.access(account).await?;
        let base = normalize_instance_url(&account.address);
        let courses = self.active_courses(&base, &grant.token).await?;

        let mut items = Vec::new();
        for course in courses {
            let course_name = course.name.unwrap_or_else(|| "Unknown Course".to_string());
            let topics: Vec<DiscussionTopic> = match self
                .get_all(
                    &format!("{}/api/v1/courses/{}/discussion_topics", base, course.id),
                    &grant.token,
                    &[
                        ("only_announcements", "true"),
                        ("order_by", "recent_activity"),
                        ("per_page", "50"),
                    ],
                )
                .await
            {
                Ok(topics) => topics,
                // Announcements can be hidden per course; skip that course only.
                Err(ProviderError::CredentialInvalid(reason)) => {
                    warn!(course_id = course.id, %reason, "announcements not visible for course");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for topic in topics {
                let Some(posted) = parse_instant(topic.posted_at.as_deref()) else {
                    continue;
                };
                if !window.contains(posted) {
                    continue;
                }
                let body = topic
                    .message
                    .as_deref()
                    .map(strip_html)
                    .map(|text| truncate_body(&text, ANNOUNCEMENT_BODY_LIMIT));
                let mut item = NormalizedItem::new(
                    topic.id.to_string(),
                    topic.title.unwrap_or_else(|| "Untitled".to_string()),
                    ItemTime::At(posted),
                    ProviderKind::Coursework,
                );
                item.course = Some(course_name.clone());
                item.body = body;
                item.author = topic.author.and_then(|a| a.display_name);
                item.url = topic.html_url;
                items.push(item);
            }
        }
        items.sort_by(|a, b| b.start.instant(chrono_tz::Tz::UTC).cmp(&a.start.instant(chrono_tz::Tz::UTC)));

        Ok(FetchOutcome {
            items,
            rotated: grant.rotated,
        })
    }

    async fn validate_credential(&self, address: &str, access_token: &str) -> Result<String, ProviderError> {
        let base = normalize_instance_url(address);
        let profile: Profile = self
            .get(&format!("{}/api/v1/users/self", base), access_token, &[])
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed canvas profile: {}", e)))?;
        debug!(profile_id = profile.id, name = ?profile.name, "validated canvas token");
        Ok(base)
    }
}
