use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::models::account::ProviderKind;
use crate::models::item::{ItemTime, NormalizedItem};

const SUMMARY_COLOUR: u32 = 0xF1C40F;
const ALERT_COLOUR: u32 = 0xE67E22;
const ANNOUNCEMENT_COLOUR: u32 = 0x3498DB;

// Discord embed limits.
const MAX_FIELDS: usize = 25;
const MAX_FIELD_VALUE: usize = 1024;
const MAX_TITLE: usize = 256;
const ITEMS_PER_DAY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Rendered message, independent of the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: Option<String>,
    pub fields: Vec<NoticeField>,
    pub colour: u32,
    pub url: Option<String>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notice {
    pub fn new(title: impl Into<String>, colour: u32) -> Self {
        Self {
            title: clip(&title.into(), MAX_TITLE),
            description: None,
            fields: Vec::new(),
            colour,
            url: None,
            footer: None,
            timestamp: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        if self.fields.len() < MAX_FIELDS {
            self.fields.push(NoticeField {
                name: clip(&name.into(), MAX_TITLE),
                value: clip(&value.into(), MAX_FIELD_VALUE),
                inline,
            });
        }
        self
    }
}

/// Plain-text form, used by the console notifier and in logs.
impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        if let Some(description) = &self.description {
            writeln!(f, "{}", description)?;
        }
        for field in &self.fields {
            writeln!(f, "{}:\n{}", field.name, field.value)?;
        }
        if let Some(url) = &self.url {
            writeln!(f, "{}", url)?;
        }
        if let Some(footer) = &self.footer {
            writeln!(f, "{}", footer)?;
        }
        Ok(())
    }
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

fn source_icon(source: ProviderKind) -> &'static str {
    match source {
        ProviderKind::Calendar => "📆",
        ProviderKind::Coursework => "📚",
    }
}

fn local_day(time: &ItemTime, tz: Tz) -> NaiveDate {
    match time {
        ItemTime::At(at) => at.with_timezone(&tz).date_naive(),
        ItemTime::AllDay(day) => *day,
    }
}

fn time_label(time: &ItemTime, tz: Tz) -> String {
    match time {
        ItemTime::At(at) => at.with_timezone(&tz).format("%H:%M").to_string(),
        ItemTime::AllDay(_) => "all day".to_string(),
    }
}

pub trait Renderer: Send + Sync {
    /// Upcoming items, already merged and sorted ascending by start.
    fn render_summary(&self, items: &[NormalizedItem], days: u32, now: DateTime<Utc>) -> Notice;
    fn render_event_alert(&self, item: &NormalizedItem, now: DateTime<Utc>) -> Notice;
    fn render_announcement(&self, item: &NormalizedItem) -> Notice;
}

/// Discord-embed shaped notices, times shown in the configured zone.
#[derive(Debug, Clone)]
pub struct EmbedRenderer {
    tz: Tz,
}

impl EmbedRenderer {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    fn summary_line(&self, item: &NormalizedItem) -> String {
        let mut line = format!(
            "`{}` {} {}",
            time_label(&item.start, self.tz),
            source_icon(item.source),
            clip(&item.title, 60)
        );
        if let Some(course) = &item.course {
            line.push_str(&format!(" ({})", course));
        }
        line
    }
}

impl Renderer for EmbedRenderer {
    fn render_summary(&self, items: &[NormalizedItem], days: u32, now: DateTime<Utc>) -> Notice {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut by_day: BTreeMap<NaiveDate, Vec<&NormalizedItem>> = BTreeMap::new();
        for item in items {
            // Items that began before today still show under today.
            let day = local_day(&item.start, self.tz).max(today);
            by_day.entry(day).or_default().push(item);
        }

        let mut notice = Notice::new(format!("📋 Your next {} days", days), SUMMARY_COLOUR);
        notice.description = Some(format!(
            "{} upcoming item{}",
            items.len(),
            if items.len() == 1 { "" } else { "s" }
        ));
        notice.timestamp = Some(now);

        let day_count = by_day.len();
        for (idx, (day, day_items)) in by_day.into_iter().enumerate() {
            if idx + 1 == MAX_FIELDS && day_count > MAX_FIELDS {
                notice.footer = Some(format!("...and {} more days", day_count - idx));
                break;
            }
            let mut lines: Vec<String> = day_items
                .iter()
                .take(ITEMS_PER_DAY)
                .map(|item| self.summary_line(item))
                .collect();
            if day_items.len() > ITEMS_PER_DAY {
                lines.push(format!("*...and {} more*", day_items.len() - ITEMS_PER_DAY));
            }
            notice = notice.field(day.format("%A, %b %d").to_string(), lines.join("\n"), false);
        }
        notice
    }

    fn render_event_alert(&self, item: &NormalizedItem, now: DateTime<Utc>) -> Notice {
        let start = item.start.instant(self.tz);
        let minutes = (start - now).num_minutes().max(0);
        let mut notice = Notice::new(format!("⏰ {}", item.title), ALERT_COLOUR);
        notice.description = Some(if minutes <= 1 {
            "Starting now".to_string()
        } else {
            format!("Starts in about {} minutes", minutes)
        });
        notice = notice.field(
            "When",
            start.with_timezone(&self.tz).format("%a %b %d, %H:%M %Z").to_string(),
            true,
        );
        if let Some(location) = &item.location {
            notice = notice.field("Where", location.clone(), true);
        }
        if let Some(course) = &item.course {
            notice = notice.field("Course", course.clone(), true);
        }
        notice.url = item.url.clone();
        notice.timestamp = Some(now);
        notice
    }

    fn render_announcement(&self, item: &NormalizedItem) -> Notice {
        let mut notice = Notice::new(format!("📢 {}", item.title), ANNOUNCEMENT_COLOUR);
        notice.description = item.body.clone().filter(|body| !body.is_empty());
        if let Some(course) = &item.course {
            notice = notice.field("Course", course.clone(), true);
        }
        if let Some(author) = &item.author {
            notice = notice.field("Posted by", author.clone(), true);
        }
        notice.url = item.url.clone();
        notice.timestamp = Some(item.start.instant(self.tz));
        notice
    }
}
