use std::collections::HashMap;
use std::sync::Arc;

use serenity::async_trait;

use crate::errors::ProviderError;
use crate::models::account::{Account, ProviderKind, RotatedToken};
use crate::models::item::{NormalizedItem, TimeWindow};

/// Items from one provider call plus any access token rotated while making it.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub items: Vec<NormalizedItem>,
    pub rotated: Option<RotatedToken>,
}

/// Capability shared by every external provider. Implementations refresh
/// expiring access tokens themselves and follow pagination to the end.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Events or assignments in `window`.
    async fn fetch_items(&self, account: &Account, window: &TimeWindow) -> Result<FetchOutcome, ProviderError>;

    /// Announcements posted inside `window`. Providers without announcements
    /// return nothing.
    async fn fetch_announcements(
        &self,
        _account: &Account,
        _window: &TimeWindow,
    ) -> Result<FetchOutcome, ProviderError> {
        Ok(FetchOutcome::default())
    }

    /// Checks a plaintext token against the provider and returns the
    /// canonical account address (email or instance URL).
    async fn validate_credential(&self, address: &str, access_token: &str) -> Result<String, ProviderError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ProviderClient>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(&kind).cloned()
    }

    pub fn has(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }
}
