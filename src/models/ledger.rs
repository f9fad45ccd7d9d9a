use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};

/// Reminder kinds. Each kind has its own dedup key space; keys are never
/// compared across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReminderKind {
    DailySummary,
    HourBefore,
    Announcement,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderKind::DailySummary => "daily-summary",
            ReminderKind::HourBefore => "hour-before",
            ReminderKind::Announcement => "announcement",
        }
    }
}

impl fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "daily-summary" => Ok(ReminderKind::DailySummary),
            "hour-before" => Ok(ReminderKind::HourBefore),
            "announcement" => Ok(ReminderKind::Announcement),
            other => Err(format!("unknown reminder kind `{}`", other)),
        }
    }
}

/// A delivered notification. Unique on (user_id, kind, dedup_key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub user_id: String,
    pub kind: ReminderKind,
    pub dedup_key: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
}

pub fn daily_summary_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

pub fn announcement_key(provider_id: &str) -> String {
    format!("announcement:{}", provider_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_key_is_iso_date() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert_eq!(daily_summary_key(day), "2024-01-10");
    }

    #[test]
    fn announcement_key_is_namespaced() {
        assert_eq!(announcement_key("42"), "announcement:42");
    }
}
