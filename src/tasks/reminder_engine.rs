use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::errors::{JobError, ProviderError, ReminderError, StoreError};
use crate::models::account::{Account, ProviderKind, RotatedToken};
use crate::models::item::{NormalizedItem, TimeWindow, sort_by_start};
use crate::models::ledger::{ReminderKind, announcement_key, daily_summary_key};
use crate::service::notifier_service::Notifier;
use crate::service::provider_service::{FetchOutcome, ProviderRegistry};
use crate::service::render_service::{Notice, Renderer};
use crate::store::{AccountStore, NotificationLedger};
use crate::tasks::claims::{Claim, DeliveryClaims};

/// Safety margin added to the announcement look-back so scheduling jitter
/// never leaves a gap between runs.
pub const ANNOUNCEMENT_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    DailySummary,
    HourBefore,
    AnnouncementCheck,
    LedgerPrune,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DailySummary => "daily-summary",
            JobKind::HourBefore => "hour-before",
            JobKind::AnnouncementCheck => "announcement-check",
            JobKind::LedgerPrune => "ledger-prune",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "daily-summary" => Ok(JobKind::DailySummary),
            "hour-before" => Ok(JobKind::HourBefore),
            "announcement-check" | "announcements" => Ok(JobKind::AnnouncementCheck),
            "ledger-prune" => Ok(JobKind::LedgerPrune),
            other => Err(format!("unknown job `{}`", other)),
        }
    }
}

/// A failure confined to one user, account or item.
#[derive(Debug)]
pub struct Failure {
    pub scope: String,
    pub error: ReminderError,
}

/// Outcome of one job run.
#[derive(Debug, Default)]
pub struct JobReport {
    pub delivered: usize,
    pub skipped: usize,
    pub pruned: usize,
    pub failures: Vec<Failure>,
}

impl JobReport {
    fn fail(&mut self, scope: String, error: impl Into<ReminderError>) {
        self.failures.push(Failure {
            scope,
            error: error.into(),
        });
    }

    fn merge(&mut self, other: JobReport) {
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.pruned += other.pruned;
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivered={} skipped={} pruned={} failed={}",
            self.delivered,
            self.skipped,
            self.pruned,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {} [{}]: {}", failure.scope, failure.error.label(), failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub days_ahead: u32,
    pub hour_before_window: Duration,
    pub announcement_lookback: Duration,
    pub timezone: Tz,
    pub provider_timeout: std::time::Duration,
    pub concurrency: usize,
    pub ledger_retention: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            days_ahead: 7,
            hour_before_window: Duration::hours(1),
            announcement_lookback: Duration::minutes(30 + ANNOUNCEMENT_MARGIN_MINUTES),
            timezone: Tz::UTC,
            provider_timeout: std::time::Duration::from_secs(30),
            concurrency: 4,
            ledger_retention: None,
        }
    }
}

impl From<&Settings> for EngineSettings {
    fn from(settings: &Settings) -> Self {
        let interval = Duration::from_std(settings.announcement_interval).unwrap_or_else(|_| Duration::minutes(30));
        Self {
            days_ahead: settings.reminder_days_ahead,
            hour_before_window: Duration::hours(1),
            announcement_lookback: interval + Duration::minutes(ANNOUNCEMENT_MARGIN_MINUTES),
            timezone: settings.timezone,
            provider_timeout: settings.provider_timeout,
            concurrency: settings.job_concurrency.max(1),
            ledger_retention: settings.ledger_retention_days.map(|days| Duration::days(days as i64)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchMode {
    Items,
    Announcements,
}

fn account_scope(account: &Account) -> String {
    format!("account {} ({}, user {})", account.id, account.kind, account.user_id)
}

/// Runs the reminder jobs. Every method takes `now` so runs are reproducible.
pub struct ReminderEngine {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn NotificationLedger>,
    providers: ProviderRegistry,
    renderer: Arc<dyn Renderer>,
    notifier: Arc<dyn Notifier>,
    claims: DeliveryClaims,
    settings: EngineSettings,
}

impl ReminderEngine {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn NotificationLedger>,
        providers: ProviderRegistry,
        renderer: Arc<dyn Renderer>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            accounts,
            ledger,
            providers,
            renderer,
            notifier,
            claims: DeliveryClaims::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn run(&self, job: JobKind, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let report = match job {
            JobKind::DailySummary => self.run_daily_summary(now).await?,
            JobKind::HourBefore => self.run_hour_before(now).await?,
            JobKind::AnnouncementCheck => self.run_announcement_check(now).await?,
            JobKind::LedgerPrune => self.run_ledger_prune(now).await?,
        };
        info!(
            job = %job,
            delivered = report.delivered,
            skipped = report.skipped,
            pruned = report.pruned,
            failed = report.failures.len(),
            "job run finished"
        );
        Ok(report)
    }

    /// One summary per user per local calendar day covering the look-ahead
    /// window across every linked account.
    pub async fn run_daily_summary(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let users = self.accounts.list_users().await?;
        let reports: Vec<JobReport> = stream::iter(users)
            .map(|user_id| self.daily_summary_for_user(user_id, now))
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;
        Ok(collect(reports))
    }

    /// Alerts for timed calendar items starting within the next hour.
    pub async fn run_hour_before(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let accounts = self.accounts.list_accounts_by_kind(ProviderKind::Calendar).await?;
        let reports: Vec<JobReport> = stream::iter(accounts)
            .map(|account| self.hour_before_for_account(account, now))
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;
        Ok(collect(reports))
    }

    /// Announcements posted since the last run plus a safety margin.
    pub async fn run_announcement_check(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let accounts = self.accounts.list_accounts_by_kind(ProviderKind::Coursework).await?;
        let reports: Vec<JobReport> = stream::iter(accounts)
            .map(|account| self.announcements_for_account(account, now))
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;
        Ok(collect(reports))
    }

    /// Deletes ledger rows older than the retention period, when one is set.
    pub async fn run_ledger_prune(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let mut report = JobReport::default();
        let Some(retention) = self.settings.ledger_retention else {
            debug!("ledger retention not configured; nothing to prune");
            return Ok(report);
        };
        report.pruned = self.ledger.prune_before(now - retention).await?;
        Ok(report)
    }

    async fn daily_summary_for_user(&self, user_id: String, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();
        let tz = self.settings.timezone;
        let key = daily_summary_key(now.with_timezone(&tz).date_naive());
        let Some(claim) = self
            .claim_unsent(&mut report, &user_id, ReminderKind::DailySummary, &key)
            .await
        else {
            return report;
        };

        let items = match self.gather_upcoming(&mut report, &user_id, now).await {
            Ok(items) => items,
            Err(err) => {
                report.fail(format!("user {}", user_id), err);
                return report;
            }
        };
        if items.is_empty() {
            debug!(user = %user_id, "no upcoming items; daily summary not sent");
            report.skipped += 1;
            return report;
        }

        let notice = self
            .renderer
            .render_summary(&items, self.settings.days_ahead, now);
        self.deliver_and_record(&mut report, &user_id, ReminderKind::DailySummary, &key, None, &notice)
            .await;
        drop(claim);
        report
    }

    /// Items a daily summary sent now would contain, without touching the
    /// ledger or the notifier.
    pub async fn upcoming_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Vec<NormalizedItem>, JobReport), JobError> {
        let mut report = JobReport::default();
        let items = self.gather_upcoming(&mut report, user_id, now).await?;
        Ok((items, report))
    }

    /// Fetches the look-ahead window from every account of the user, keeps
    /// items overlapping it and sorts them. Failed accounts are left out.
    async fn gather_upcoming(
        &self,
        report: &mut JobReport,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<NormalizedItem>, StoreError> {
        let tz = self.settings.timezone;
        let accounts = self.accounts.list_accounts_for_user(user_id).await?;
        let window = TimeWindow::ahead(now, Duration::days(self.settings.days_ahead as i64));
        let fetched = join_all(
            accounts
                .iter()
                .filter(|account| self.providers.has(account.kind))
                .map(|account| async move { (account, self.fetch(account, &window, FetchMode::Items).await) }),
        )
        .await;

        let mut items: Vec<NormalizedItem> = Vec::new();
        for (account, result) in fetched {
            match result {
                Ok(outcome) => {
                    self.persist_rotation(report, account, outcome.rotated).await;
                    items.extend(outcome.items);
                }
                Err(err) => {
                    warn!(user = user_id, account_id = account.id, error = %err, "skipping account in summary");
                    report.fail(account_scope(account), err);
                }
            }
        }

        let mut seen = HashSet::new();
        items.retain(|item| item.overlaps(&window, tz) && seen.insert((item.source, item.id.clone())));
        sort_by_start(&mut items, tz);
        Ok(items)
    }

    async fn hour_before_for_account(&self, account: Account, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();
        let window = TimeWindow::ahead(now, self.settings.hour_before_window);
        let outcome = match self.fetch(&account, &window, FetchMode::Items).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(account_id = account.id, user = %account.user_id, error = %err, "hour-before fetch failed");
                report.fail(account_scope(&account), err);
                return report;
            }
        };
        self.persist_rotation(&mut report, &account, outcome.rotated).await;

        let mut items: Vec<NormalizedItem> = outcome
            .items
            .into_iter()
            .filter(|item| item.starts_within(&window))
            .collect();
        sort_by_start(&mut items, self.settings.timezone);

        for item in items {
            let Some(claim) = self
                .claim_unsent(&mut report, &account.user_id, ReminderKind::HourBefore, &item.id)
                .await
            else {
                continue;
            };
            let notice = self.renderer.render_event_alert(&item, now);
            let start = item.start.instant(self.settings.timezone);
            self.deliver_and_record(
                &mut report,
                &account.user_id,
                ReminderKind::HourBefore,
                &item.id,
                Some(start),
                &notice,
            )
            .await;
            drop(claim);
        }
        report
    }

    async fn announcements_for_account(&self, account: Account, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();
        let window = TimeWindow::lookback(now, self.settings.announcement_lookback);
        let outcome = match self.fetch(&account, &window, FetchMode::Announcements).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(account_id = account.id, user = %account.user_id, error = %err, "announcement fetch failed");
                report.fail(account_scope(&account), err);
                return report;
            }
        };
        self.persist_rotation(&mut report, &account, outcome.rotated).await;

        let mut items = outcome.items;
        sort_by_start(&mut items, self.settings.timezone);
        for item in items {
            let key = announcement_key(&item.id);
            let Some(claim) = self
                .claim_unsent(&mut report, &account.user_id, ReminderKind::Announcement, &key)
                .await
            else {
                continue;
            };
            let notice = self.renderer.render_announcement(&item);
            let posted = item.start.instant(self.settings.timezone);
            self.deliver_and_record(
                &mut report,
                &account.user_id,
                ReminderKind::Announcement,
                &key,
                Some(posted),
                &notice,
            )
            .await;
            drop(claim);
        }
        report
    }

    async fn fetch(&self, account: &Account, window: &TimeWindow, mode: FetchMode) -> Result<FetchOutcome, ProviderError> {
        let provider = self.providers.get(account.kind).ok_or_else(|| {
            ProviderError::Unavailable(format!("no provider registered for {}", account.kind))
        })?;
        let call = async {
            match mode {
                FetchMode::Items => provider.fetch_items(account, window).await,
                FetchMode::Announcements => provider.fetch_announcements(account, window).await,
            }
        };
        tokio::time::timeout(self.settings.provider_timeout, call)
            .await
            .map_err(|_| ProviderError::timed_out(self.settings.provider_timeout))?
    }

    /// Stores a refreshed access token right away, whatever happens to the
    /// deliveries that follow.
    async fn persist_rotation(&self, report: &mut JobReport, account: &Account, rotated: Option<RotatedToken>) {
        let Some(rotated) = rotated else {
            return;
        };
        if let Err(err) = self.accounts.update_credentials(account.id, &rotated).await {
            error!(account_id = account.id, error = %err, "failed to store rotated access token");
            report.fail(account_scope(account), err);
        }
    }

    /// Claims the triple and checks the ledger. `None` means another run owns
    /// it or it was already delivered.
    async fn claim_unsent(
        &self,
        report: &mut JobReport,
        user_id: &str,
        kind: ReminderKind,
        dedup_key: &str,
    ) -> Option<Claim> {
        let Some(claim) = self.claims.try_claim(user_id, kind, dedup_key) else {
            debug!(user = user_id, %kind, dedup_key, "reminder in flight in another run");
            report.skipped += 1;
            return None;
        };
        match self.ledger.exists(user_id, kind, dedup_key).await {
            Ok(false) => Some(claim),
            Ok(true) => {
                report.skipped += 1;
                None
            }
            Err(err) => {
                report.fail(format!("{} {} for user {}", kind, dedup_key, user_id), err);
                None
            }
        }
    }

    async fn deliver_and_record(
        &self,
        report: &mut JobReport,
        user_id: &str,
        kind: ReminderKind,
        dedup_key: &str,
        scheduled_time: Option<DateTime<Utc>>,
        notice: &Notice,
    ) {
        let scope = format!("{} {} for user {}", kind, dedup_key, user_id);
        if let Err(err) = self.notifier.deliver(user_id, notice).await {
            warn!(user = user_id, %kind, dedup_key, error = %err, "delivery failed; will retry next run");
            report.fail(scope, err);
            return;
        }
        match self
            .ledger
            .record(user_id, kind, dedup_key, scheduled_time, Utc::now())
            .await
        {
            Ok(()) => report.delivered += 1,
            Err(StoreError::Conflict(_)) => {
                debug!(user = user_id, %kind, dedup_key, "ledger entry written by a concurrent run");
                report.delivered += 1;
            }
            Err(err) => {
                error!(user = user_id, %kind, dedup_key, error = %err, "delivered but ledger write failed");
                report.delivered += 1;
                report.fail(scope, err);
            }
        }
    }
}

fn collect(reports: Vec<JobReport>) -> JobReport {
    let mut total = JobReport::default();
    for report in reports {
        total.merge(report);
    }
    total
}
