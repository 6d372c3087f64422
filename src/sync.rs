//! Subscription sync engine
//!
//! Orchestrates the fetch → decode → parse → persist pipeline for remote
//! profiles. Network and decoding happen entirely before any store mutation,
//! so a failed sync leaves the previous server set untouched. Syncs for the
//! same profile are single-flight; syncs for distinct profiles run
//! concurrently during a due sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::UriCodec;
use crate::error::{FetchError, SyncError};
use crate::model::{ParsedServer, Profile, ProfileKind, SubscriptionInfo};
use crate::secret::EncryptedFieldService;
use crate::store::ProfileStore;
use crate::subscription;

// ============================================================================
// Subscription Fetcher
// ============================================================================

/// Raw subscription response: the body plus the metadata side-channel header
#[derive(Debug, Clone)]
pub struct FetchedSubscription {
    pub body: Vec<u8>,
    /// Value of the `subscription-userinfo` response header, if present
    pub metadata_header: Option<String>,
}

/// Network seam for subscription retrieval. Tests script this; production
/// uses [`HttpFetcher`].
#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedSubscription, FetchError>;
}

const METADATA_HEADER: &str = "subscription-userinfo";
const USER_AGENT: &str = concat!("subsync/", env!("CARGO_PKG_VERSION"));
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP fetcher backed by a shared reqwest client
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedSubscription, FetchError> {
        debug!("Fetching subscription content");
        let response = self.client.get(url).send().await.map_err(|e| FetchError {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError {
                url: url.to_string(),
                message: format!("HTTP status {}", status),
            });
        }

        let metadata_header = response
            .headers()
            .get(METADATA_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError {
                url: url.to_string(),
                message: e.to_string(),
            })?
            .to_vec();

        debug!("Fetched {} bytes", body.len());
        Ok(FetchedSubscription {
            body,
            metadata_header,
        })
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

/// Outcome of a due sweep. Per-profile failures never abort the sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub succeeded: usize,
    pub failed: Vec<(Uuid, SyncError)>,
}

struct EngineInner {
    store: Arc<ProfileStore>,
    fetcher: Arc<dyn SubscriptionFetcher>,
    secrets: EncryptedFieldService,
    codec: UriCodec,
    /// Per-profile sync locks; concurrent syncs of the same profile
    /// serialize here instead of racing on the store.
    in_flight: parking_lot::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct ProfileSyncEngine {
    inner: Arc<EngineInner>,
}

impl ProfileSyncEngine {
    pub fn new(
        store: Arc<ProfileStore>,
        fetcher: Arc<dyn SubscriptionFetcher>,
        secrets: EncryptedFieldService,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                fetcher,
                secrets,
                codec: UriCodec::with_builtin_codecs(),
                in_flight: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.inner.store
    }

    /// Creates a local profile with a verbatim server list. No network, no
    /// subscription URL, never touched by sync.
    pub fn add_local_profile(
        &self,
        name: &str,
        servers: Vec<ParsedServer>,
    ) -> Result<Profile, SyncError> {
        let profile = Profile {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: ProfileKind::Local,
            subscription_url: None,
            is_active: false,
            sort_order: self.inner.store.count()? as i64,
            created_at: Utc::now(),
            last_updated_at: None,
            info: SubscriptionInfo::default(),
        };
        self.inner
            .store
            .insert_profile_with_servers(&profile, &servers)?;
        info!("Created local profile '{}'", profile.name);
        Ok(profile)
    }

    /// Creates a remote profile from a subscription URL.
    ///
    /// The subscription is fetched and parsed before anything is persisted;
    /// a fetch failure or a zero-server result creates no profile at all.
    /// The URL is encrypted before it reaches the store.
    pub async fn add_remote_profile(
        &self,
        name: Option<&str>,
        url: &str,
    ) -> Result<Profile, SyncError> {
        let (info, servers) = self.fetch_and_parse(url).await?;

        let ciphertext = self.inner.secrets.encrypt(url)?;
        let name = name
            .map(str::to_string)
            .or_else(|| info.title.clone())
            .unwrap_or_else(|| derive_name_from_url(url));

        let profile = Profile {
            id: Uuid::new_v4(),
            name,
            kind: ProfileKind::Remote,
            subscription_url: Some(ciphertext),
            is_active: false,
            sort_order: self.inner.store.count()? as i64,
            created_at: Utc::now(),
            last_updated_at: Some(Utc::now()),
            info,
        };
        self.inner
            .store
            .insert_profile_with_servers(&profile, &servers)?;
        info!(
            "Created remote profile '{}' with {} servers",
            profile.name,
            servers.len()
        );
        Ok(profile)
    }

    /// Re-syncs one remote profile from its stored subscription URL.
    ///
    /// Single-flight per profile: a second call for the same id waits for
    /// the first and then runs its own sync. All network and parsing work
    /// completes before the store is touched, and the metadata update plus
    /// server replacement land in one transaction, so any failure leaves
    /// the previous server set intact.
    pub async fn update_subscription(&self, profile_id: Uuid) -> Result<(), SyncError> {
        let lock = self.flight_lock(profile_id);
        let result = {
            let _guard = lock.lock().await;
            self.sync_profile(profile_id).await
        };
        self.release_flight_lock(profile_id, lock);
        result
    }

    async fn sync_profile(&self, profile_id: Uuid) -> Result<(), SyncError> {
        let profile = self
            .inner
            .store
            .get_profile(profile_id)?
            .ok_or(SyncError::NotFound(profile_id))?;
        if profile.kind != ProfileKind::Remote {
            return Err(SyncError::NotRemote(profile_id));
        }
        let url = self
            .inner
            .secrets
            .decrypt(profile.subscription_url.as_deref())
            .ok_or(SyncError::NoUrlStored(profile_id))?;

        let (info, servers) = self.fetch_and_parse(&url).await?;

        self.inner
            .store
            .apply_sync_result(profile_id, &info, Utc::now(), &servers)?;
        info!(
            "Synced profile '{}': {} servers",
            profile.name,
            servers.len()
        );
        Ok(())
    }

    /// Syncs every remote profile whose refresh interval has elapsed.
    ///
    /// Distinct profiles sync concurrently; each failure is isolated and
    /// reported, never aborting the sweep.
    pub async fn update_all_due(&self) -> Result<SweepReport, SyncError> {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .inner
            .store
            .list_profiles()?
            .into_iter()
            .filter(|p| p.is_due(now))
            .map(|p| p.id)
            .collect();

        debug!("Due sweep: {} profiles due", due.len());

        let mut tasks = JoinSet::new();
        for id in due {
            let engine = self.clone();
            tasks.spawn(async move { (id, engine.update_subscription(id).await) });
        }

        let mut report = SweepReport::default();
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!("Sync failed for profile {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }

        info!(
            "Due sweep complete: {} succeeded, {} failed",
            report.succeeded,
            report.failed.len()
        );
        Ok(report)
    }

    /// Fetches and fully parses a subscription without touching the store
    async fn fetch_and_parse(
        &self,
        url: &str,
    ) -> Result<(SubscriptionInfo, Vec<ParsedServer>), SyncError> {
        let fetched = self.inner.fetcher.fetch(url).await?;
        let decoded = subscription::decode(&fetched.body, fetched.metadata_header.as_deref())?;

        let report = self
            .inner
            .codec
            .parse_all(decoded.uris.iter().map(String::as_str));
        if report.servers.is_empty() {
            return Err(SyncError::NoServersFound);
        }
        if !report.failures.is_empty() {
            warn!(
                "{} of {} subscription entries failed to parse",
                report.failures.len(),
                decoded.uris.len()
            );
        }
        Ok((decoded.info, report.servers))
    }

    fn flight_lock(&self, profile_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.in_flight.lock();
        map.entry(profile_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops this sync's handle on the profile lock and removes the map
    /// entry once no other sync holds it, so locks for deleted profiles
    /// do not accumulate.
    fn release_flight_lock(&self, profile_id: Uuid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.inner.in_flight.lock();
        drop(lock);
        if let Some(entry) = map.get(&profile_id)
            && Arc::strong_count(entry) == 1
        {
            map.remove(&profile_id);
        }
    }
}

/// Fallback profile name when neither the caller nor the provider names it
fn derive_name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "Subscription".to_string())
}
