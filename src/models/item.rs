use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::account::ProviderKind;

/// Start or end of an item: a concrete instant, or a whole day with no
/// time-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemTime {
    At(DateTime<Utc>),
    AllDay(NaiveDate),
}

impl ItemTime {
    /// Parses RFC 3339 datetimes and bare `YYYY-MM-DD` dates.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            return Some(ItemTime::At(at.with_timezone(&Utc)));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .map(ItemTime::AllDay)
    }

    /// All-day values resolve to local midnight in `tz`.
    pub fn instant(&self, tz: Tz) -> DateTime<Utc> {
        match self {
            ItemTime::At(at) => *at,
            ItemTime::AllDay(day) => local_midnight(*day, tz),
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, ItemTime::AllDay(_))
    }
}

pub fn local_midnight(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Provider-agnostic event, assignment or announcement. Lives for one
/// fetch-render-deliver cycle only.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub id: String,
    pub title: String,
    pub start: ItemTime,
    pub end: Option<ItemTime>,
    pub location: Option<String>,
    pub course: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub source: ProviderKind,
}

impl NormalizedItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, start: ItemTime, source: ProviderKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            start,
            end: None,
            location: None,
            course: None,
            body: None,
            author: None,
            url: None,
            source,
        }
    }

    fn end_instant(&self, tz: Tz) -> DateTime<Utc> {
        match (self.end, self.start) {
            (Some(end), _) => end.instant(tz),
            (None, ItemTime::AllDay(day)) => local_midnight(day + Duration::days(1), tz),
            (None, ItemTime::At(at)) => at,
        }
    }

    /// True when any part of the item falls inside `window`.
    pub fn overlaps(&self, window: &TimeWindow, tz: Tz) -> bool {
        let start = self.start.instant(tz);
        if start >= window.end {
            return false;
        }
        start >= window.start || self.end_instant(tz) > window.start
    }

    /// True for timed items whose start lies in `window`.
    pub fn starts_within(&self, window: &TimeWindow) -> bool {
        match self.start {
            ItemTime::At(at) => window.contains(at),
            ItemTime::AllDay(_) => false,
        }
    }
}

/// Sorts ascending by start, ties broken by title so output is stable.
pub fn sort_by_start(items: &mut [NormalizedItem], tz: Tz) {
    items.sort_by(|a, b| {
        a.start
            .instant(tz)
            .cmp(&b.start.instant(tz))
            .then_with(|| a.title.cmp(&b.title))
    });
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn ahead(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: now,
            end: now + length,
        }
    }

    pub fn lookback(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: now - length,
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}
