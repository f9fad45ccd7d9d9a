use std::sync::Arc;

use serenity::async_trait;
use serenity::builder::{CreateEmbed, CreateEmbedFooter, CreateMessage};
use serenity::http::{Http, HttpError};
use serenity::model::Timestamp;
use serenity::model::id::UserId;
use tracing::debug;

use crate::errors::DeliveryError;
use crate::service::render_service::Notice;

/// Discord JSON error code for "Cannot send messages to this user".
const CANNOT_MESSAGE_USER: isize = 50007;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, user_id: &str, notice: &Notice) -> Result<(), DeliveryError>;
}

/// Sends notices as direct-message embeds.
pub struct DiscordDmNotifier {
    http: Arc<Http>,
}

impl DiscordDmNotifier {
    pub fn new(token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
        }
    }
}

pub fn to_embed(notice: &Notice) -> CreateEmbed {
    let mut embed = CreateEmbed::new().title(&notice.title).colour(notice.colour);
    if let Some(description) = &notice.description {
        embed = embed.description(description);
    }
    for field in &notice.fields {
        embed = embed.field(&field.name, &field.value, field.inline);
    }
    if let Some(url) = &notice.url {
        embed = embed.url(url);
    }
    if let Some(footer) = &notice.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(timestamp) = notice
        .timestamp
        .and_then(|at| Timestamp::from_unix_timestamp(at.timestamp()).ok())
    {
        embed = embed.timestamp(timestamp);
    }
    embed
}

fn classify(err: serenity::Error) -> DeliveryError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &err {
        if response.error.code == CANNOT_MESSAGE_USER || response.status_code.as_u16() == 403 {
            return DeliveryError::RecipientUnreachable(response.error.message.clone());
        }
    }
    DeliveryError::Failed(err.to_string())
}

#[async_trait]
impl Notifier for DiscordDmNotifier {
    async fn deliver(&self, user_id: &str, notice: &Notice) -> Result<(), DeliveryError> {
        let id = user_id
            .parse::<u64>()
            .ok()
            .filter(|id| *id != 0)
            .map(UserId::new)
            .ok_or_else(|| DeliveryError::RecipientUnreachable(format!("not a Discord user id: {}", user_id)))?;
        let channel = id.create_dm_channel(self.http.as_ref()).await.map_err(classify)?;
        channel
            .send_message(self.http.as_ref(), CreateMessage::new().embed(to_embed(notice)))
            .await
            .map_err(classify)?;
        debug!(user = user_id, title = %notice.title, "delivered direct message");
        Ok(())
    }
}
