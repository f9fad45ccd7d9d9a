use std::sync::Arc;

use tracing::{info, warn};

use crate::clients::canvas::CanvasClient;
use crate::clients::google_calendar::GoogleCalendarClient;
use crate::config::Settings;
use crate::crypto::TokenCipher;
use crate::errors::AppError;
use crate::service::link_service::LinkService;
use crate::service::notifier_service::{DiscordDmNotifier, Notifier};
use crate::service::provider_service::ProviderRegistry;
use crate::service::render_service::EmbedRenderer;
use crate::store::SqliteStore;
use crate::tasks::reminder_engine::{EngineSettings, JobKind, ReminderEngine};
use crate::tasks::scheduler::{ScheduledJob, Trigger, spawn_job};
use crate::tasks::task_runner::TaskRunner;

/// Local hour at which the optional ledger prune runs.
const PRUNE_HOUR: u32 = 3;

/// Shared pieces every run mode starts from.
pub struct Components {
    pub store: SqliteStore,
    pub cipher: TokenCipher,
    pub google: GoogleCalendarClient,
    pub canvas: Arc<CanvasClient>,
    pub providers: ProviderRegistry,
}

pub fn build_components(settings: &Settings) -> Result<Components, AppError> {
    let cipher = TokenCipher::from_secret(settings.require_encryption_key()?)?;
    let store = SqliteStore::open(&settings.database_url)?;
    let http = reqwest::Client::builder()
        .timeout(settings.provider_timeout)
        .user_agent(concat!("calendarBot/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let google = GoogleCalendarClient::new(
        http.clone(),
        cipher.clone(),
        settings.google.clone(),
        settings.google_redirect_uri.clone(),
    );
    let canvas = Arc::new(CanvasClient::new(http, cipher.clone(), settings.canvas.clone()));
    let providers = ProviderRegistry::new()
        .with(Arc::new(google.clone()))
        .with(canvas.clone());

    Ok(Components {
        store,
        cipher,
        google,
        canvas,
        providers,
    })
}

impl Components {
    pub fn engine(&self, settings: &Settings, notifier: Arc<dyn Notifier>) -> ReminderEngine {
        ReminderEngine::new(
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            self.providers.clone(),
            Arc::new(EmbedRenderer::new(settings.timezone)),
            notifier,
            EngineSettings::from(settings),
        )
    }

    pub fn link_service(&self) -> LinkService<SqliteStore> {
        LinkService::new(Arc::new(self.store.clone()), self.cipher.clone())
            .with_google(self.google.clone())
            .with_canvas(self.canvas.clone())
    }
}

/// Jobs registered in bot mode.
pub fn scheduled_jobs(settings: &Settings) -> Vec<ScheduledJob> {
    let mut jobs = vec![
        ScheduledJob {
            kind: JobKind::DailySummary,
            trigger: Trigger::Daily {
                hour: settings.daily_reminder_hour,
                tz: settings.timezone,
            },
        },
        ScheduledJob {
            kind: JobKind::HourBefore,
            trigger: Trigger::Interval(settings.hour_before_interval),
        },
    ];
    if settings.announcements_enabled {
        jobs.push(ScheduledJob {
            kind: JobKind::AnnouncementCheck,
            trigger: Trigger::Interval(settings.announcement_interval),
        });
    }
    if settings.ledger_retention_days.is_some() {
        jobs.push(ScheduledJob {
            kind: JobKind::LedgerPrune,
            trigger: Trigger::Daily {
                hour: PRUNE_HOUR,
                tz: settings.timezone,
            },
        });
    }
    jobs
}

pub async fn run_bot(settings: Settings) -> Result<(), AppError> {
    let token = settings.require_bot_token()?.to_string();
    let components = build_components(&settings)?;
    let notifier: Arc<dyn Notifier> = Arc::new(DiscordDmNotifier::new(&token));
    let engine = Arc::new(components.engine(&settings, notifier));

    let mut task_runner = TaskRunner::new();
    for job in scheduled_jobs(&settings) {
        let engine = engine.clone();
        task_runner.add_task(job.kind.as_str(), move || spawn_job(engine, job));
    }
    let handles = task_runner.start_all();
    info!(jobs = handles.len(), database = %settings.database_url, "reminder bot running");

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for shutdown signal");
    }
    info!("shutting down; abandoning in-flight runs");
    for (name, handle) in handles {
        handle.abort();
        tracing::debug!(job = %name, "job loop stopped");
    }
    Ok(())
}
