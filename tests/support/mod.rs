//! Fakes shared by the reminder flow tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use calendarBot::errors::{DeliveryError, ProviderError, StoreError};
use calendarBot::models::account::{Account, Credential, NewAccount, ProviderKind, RotatedToken};
use calendarBot::models::item::{ItemTime, NormalizedItem, TimeWindow};
use calendarBot::service::notifier_service::Notifier;
use calendarBot::service::provider_service::{FetchOutcome, ProviderClient, ProviderRegistry};
use calendarBot::service::render_service::{EmbedRenderer, Notice};
use calendarBot::models::ledger::ReminderKind;
use calendarBot::store::{AccountStore, NotificationLedger, SqliteStore};
use calendarBot::tasks::reminder_engine::{EngineSettings, ReminderEngine};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

pub fn event(id: &str, title: &str, start: DateTime<Utc>, source: ProviderKind) -> NormalizedItem {
    NormalizedItem::new(id, title, ItemTime::At(start), source)
}

pub async fn link(store: &SqliteStore, user: &str, kind: ProviderKind, address: &str) -> Account {
    store
        .upsert_account(NewAccount {
            user_id: user.to_string(),
            kind,
            address: address.to_string(),
            credential: Credential {
                access_token: "sealed-access".to_string(),
                refresh_token: Some("sealed-refresh".to_string()),
                expires_at: None,
            },
        })
        .await
        .unwrap()
}

/// Provider returning scripted results per account id.
pub struct FakeProvider {
    kind: ProviderKind,
    items: Mutex<HashMap<i64, Result<Vec<NormalizedItem>, ProviderError>>>,
    announcements: Mutex<HashMap<i64, Vec<NormalizedItem>>>,
    rotations: Mutex<HashMap<i64, RotatedToken>>,
    delay: Mutex<Option<StdDuration>>,
    pub fetches: AtomicUsize,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            items: Mutex::new(HashMap::new()),
            announcements: Mutex::new(HashMap::new()),
            rotations: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn returns(&self, account_id: i64, items: Vec<NormalizedItem>) {
        self.items.lock().unwrap().insert(account_id, Ok(items));
    }

    pub fn fails(&self, account_id: i64, error: ProviderError) {
        self.items.lock().unwrap().insert(account_id, Err(error));
    }

    pub fn announces(&self, account_id: i64, items: Vec<NormalizedItem>) {
        self.announcements.lock().unwrap().insert(account_id, items);
    }

    pub fn rotates(&self, account_id: i64, rotated: RotatedToken) {
        self.rotations.lock().unwrap().insert(account_id, rotated);
    }

    pub fn slow(&self, delay: StdDuration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[serenity::async_trait]
impl ProviderClient for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn fetch_items(&self, account: &Account, _window: &TimeWindow) -> Result<FetchOutcome, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self.items.lock().unwrap().get(&account.id).cloned();
        let items = match scripted {
            Some(Ok(items)) => items,
            Some(Err(err)) => return Err(err),
            None => Vec::new(),
        };
        Ok(FetchOutcome {
            items,
            rotated: self.rotations.lock().unwrap().get(&account.id).cloned(),
        })
    }

    async fn fetch_announcements(&self, account: &Account, window: &TimeWindow) -> Result<FetchOutcome, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let items = self
            .announcements
            .lock()
            .unwrap()
            .get(&account.id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|item| item.starts_within(window))
            .collect();
        Ok(FetchOutcome {
            items,
            rotated: self.rotations.lock().unwrap().get(&account.id).cloned(),
        })
    }

    async fn validate_credential(&self, address: &str, _access_token: &str) -> Result<String, ProviderError> {
        Ok(address.to_string())
    }
}

/// Records every notice; users listed as unreachable get an error instead.
#[derive(Default)]
pub struct CapturingNotifier {
    sent: Mutex<Vec<(String, Notice)>>,
    unreachable: Mutex<HashSet<String>>,
}

impl CapturingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, user: &str) {
        self.unreachable.lock().unwrap().insert(user.to_string());
    }

    pub fn accept(&self, user: &str) {
        self.unreachable.lock().unwrap().remove(user);
    }

    pub fn sent(&self) -> Vec<(String, Notice)> {
        self.sent.lock().unwrap().clone()
    }
}

#[serenity::async_trait]
impl Notifier for CapturingNotifier {
    async fn deliver(&self, user_id: &str, notice: &Notice) -> Result<(), DeliveryError> {
        if self.unreachable.lock().unwrap().contains(user_id) {
            return Err(DeliveryError::RecipientUnreachable("DMs disabled".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((user_id.to_string(), notice.clone()));
        Ok(())
    }
}

pub fn engine_with(
    store: &SqliteStore,
    providers: &[Arc<FakeProvider>],
    notifier: Arc<CapturingNotifier>,
    settings: EngineSettings,
) -> ReminderEngine {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider.clone());
    }
    ReminderEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        registry,
        Arc::new(EmbedRenderer::new(Tz::UTC)),
        notifier,
        settings,
    )
}

/// Ledger that never sees an entry but loses every insert to another writer.
#[derive(Default)]
pub struct RacingLedger {
    pub records: AtomicUsize,
}

#[serenity::async_trait]
impl NotificationLedger for RacingLedger {
    async fn exists(&self, _user_id: &str, _kind: ReminderKind, _dedup_key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn record(
        &self,
        _user_id: &str,
        _kind: ReminderKind,
        dedup_key: &str,
        _scheduled_time: Option<DateTime<Utc>>,
        _sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.records.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Conflict(format!("{} already recorded", dedup_key)))
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

pub fn engine_over_ledger(
    store: &SqliteStore,
    ledger: Arc<dyn NotificationLedger>,
    providers: &[Arc<FakeProvider>],
    notifier: Arc<CapturingNotifier>,
) -> ReminderEngine {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider.clone());
    }
    ReminderEngine::new(
        Arc::new(store.clone()),
        ledger,
        registry,
        Arc::new(EmbedRenderer::new(Tz::UTC)),
        notifier,
        EngineSettings::default(),
    )
}

pub fn engine(store: &SqliteStore, providers: &[Arc<FakeProvider>], notifier: Arc<CapturingNotifier>) -> ReminderEngine {
    engine_with(store, providers, notifier, EngineSettings::default())
}
