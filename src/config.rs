use std::collections::HashMap;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::errors::ConfigError;

/// `KEY=value` pairs read from the file named by `CONFIG_FILE`.
#[derive(Debug, Default, Clone)]
pub struct AppConfig {
    values: HashMap<String, String>,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::File(e.to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::File(format!("invalid config line {}: {}", idx + 1, line)));
            };
            let key = key.trim();
            let mut value = value.trim().to_string();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = value[1..value.len() - 1].to_string();
            }
            values.insert(key.to_string(), value);
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    /// File value first, then the process environment.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.get(key)
            .or_else(|| std::env::var(key).ok())
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Bot,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct OAuthClientSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub run_mode: RunMode,
    pub discord_bot_token: Option<String>,
    pub database_url: String,
    pub encryption_key: Option<String>,
    pub daily_reminder_hour: u32,
    pub reminder_days_ahead: u32,
    pub hour_before_interval: Duration,
    pub announcement_interval: Duration,
    pub announcements_enabled: bool,
    pub timezone: Tz,
    pub provider_timeout: Duration,
    pub job_concurrency: usize,
    pub ledger_retention_days: Option<u32>,
    pub google: OAuthClientSettings,
    pub google_redirect_uri: String,
    pub canvas: OAuthClientSettings,
    pub log_format: LogFormat,
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}

/// Longest daily-summary look-ahead accepted.
pub const MAX_DAYS_AHEAD: u32 = 366;

fn minutes(key: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_secs(value * 60))
}

impl Settings {
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let run_mode = match lookup("RUN_MODE").as_deref().map(str::trim) {
            None | Some("bot") | Some("api") => RunMode::Bot,
            Some("cli") => RunMode::Cli,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "RUN_MODE",
                    value: other.to_string(),
                });
            }
        };

        let daily_reminder_hour = parse_or(&lookup, "DAILY_REMINDER_HOUR", 8u32)?;
        if daily_reminder_hour > 23 {
            return Err(ConfigError::Invalid {
                key: "DAILY_REMINDER_HOUR",
                value: daily_reminder_hour.to_string(),
            });
        }

        let timezone = match lookup("REMINDER_TIMEZONE") {
            None => Tz::UTC,
            Some(raw) => raw.trim().parse::<Tz>().map_err(|_| ConfigError::Invalid {
                key: "REMINDER_TIMEZONE",
                value: raw,
            })?,
        };

        let log_format = match lookup("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            None => LogFormat::Text,
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    value: v,
                });
            }
        };

        let reminder_days_ahead = parse_or(&lookup, "REMINDER_DAYS_AHEAD", 7u32)?;
        if reminder_days_ahead == 0 || reminder_days_ahead > MAX_DAYS_AHEAD {
            return Err(ConfigError::Invalid {
                key: "REMINDER_DAYS_AHEAD",
                value: reminder_days_ahead.to_string(),
            });
        }

        let job_concurrency = parse_or(&lookup, "JOB_CONCURRENCY", 4usize)?.max(1);
        // Rows inside any live dedup window must survive pruning.
        let ledger_retention_days = match lookup("LEDGER_RETENTION_DAYS") {
            None => None,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(days) if days > reminder_days_ahead => Some(days),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "LEDGER_RETENTION_DAYS",
                        value: raw,
                    });
                }
            },
        };

        Ok(Self {
            run_mode,
            discord_bot_token: lookup("DISCORD_BOT_TOKEN"),
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://bot.db".to_string()),
            encryption_key: lookup("ENCRYPTION_KEY"),
            daily_reminder_hour,
            reminder_days_ahead,
            hour_before_interval: minutes(
                "HOUR_BEFORE_CHECK_INTERVAL",
                parse_or(&lookup, "HOUR_BEFORE_CHECK_INTERVAL", 5u64)?,
            )?,
            announcement_interval: minutes(
                "ANNOUNCEMENT_CHECK_INTERVAL",
                parse_or(&lookup, "ANNOUNCEMENT_CHECK_INTERVAL", 30u64)?,
            )?,
            announcements_enabled: parse_bool(&lookup, "ANNOUNCEMENTS_ENABLED", true)?,
            timezone,
            provider_timeout: Duration::from_secs(parse_or(&lookup, "PROVIDER_TIMEOUT_SECS", 30u64)?),
            job_concurrency,
            ledger_retention_days,
            google: OAuthClientSettings {
                client_id: lookup("GOOGLE_CLIENT_ID"),
                client_secret: lookup("GOOGLE_CLIENT_SECRET"),
            },
            google_redirect_uri: lookup("GOOGLE_REDIRECT_URI")
                .unwrap_or_else(|| "http://localhost:8080/callback".to_string()),
            canvas: OAuthClientSettings {
                client_id: lookup("CANVAS_CLIENT_ID"),
                client_secret: lookup("CANVAS_CLIENT_SECRET"),
            },
            log_format,
        })
    }

    pub fn require_encryption_key(&self) -> Result<&str, ConfigError> {
        self.encryption_key.as_deref().ok_or(ConfigError::Missing("ENCRYPTION_KEY"))
    }

    pub fn require_bot_token(&self) -> Result<&str, ConfigError> {
        self.discord_bot_token
            .as_deref()
            .ok_or(ConfigError::Missing("DISCORD_BOT_TOKEN"))
    }
}
