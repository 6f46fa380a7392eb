use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{error, info, warn};

use crate::feed::{select_records, BuildError, FeedBuilder};
use crate::fetcher::{FetchOptions, ReleaseFetcher, ReleaseRecord};
use crate::store::{ConfigError, ConfigSnapshot, ConfigStore, Settings};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no usable configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build feed: {0}")]
    Build(#[from] BuildError),

    #[error("all {0} repositories failed to fetch")]
    AllFetchesFailed(usize),

    #[error("configuration task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The last fully built feed.
#[derive(Debug)]
pub struct CachedFeed {
    pub xml: String,
    /// Records in feed order, kept so smaller views can be re-rendered.
    pub records: Vec<ReleaseRecord>,
    pub generated_at: DateTime<Utc>,
}

/// Single-writer cache of the published feed. Readers get an `Arc` to a
/// complete document; publishing swaps the `Arc`.
#[derive(Clone)]
pub struct FeedCache {
    inner: Arc<RwLock<Arc<CachedFeed>>>,
}

impl FeedCache {
    pub fn new(initial: CachedFeed) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub async fn current(&self) -> Arc<CachedFeed> {
        self.inner.read().await.clone()
    }

    async fn publish(&self, feed: CachedFeed) {
        *self.inner.write().await = Arc::new(feed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRepo {
    pub repo: String,
    pub reason: String,
}

/// What one refresh cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repos_total: usize,
    pub repos_succeeded: usize,
    pub skipped: Vec<SkippedRepo>,
    pub items: usize,
    pub used_fallback_config: bool,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Completed(RefreshSummary),
    Failed(RefreshError),
    /// Served by a pass another caller ran after this request arrived. Holds
    /// that pass's summary, or `None` when it failed.
    Coalesced(Option<RefreshSummary>),
}

pub struct Refresher {
    store: Arc<ConfigStore>,
    fetcher: ReleaseFetcher,
    builder: FeedBuilder,
    cache: FeedCache,
    last_good: RwLock<Option<ConfigSnapshot>>,
    last_summary: RwLock<Option<RefreshSummary>>,
    /// Held for the duration of a pass; guards the summary of the last pass.
    gate: Mutex<Option<RefreshSummary>>,
    pending: AtomicBool,
    refreshing: AtomicBool,
    passes: AtomicU64,
    auto_refresh: AtomicBool,
    reschedule: Notify,
}

impl Refresher {
    /// Creates the refresher with an empty feed already published, so readers
    /// never wait for the first cycle.
    pub fn new(
        store: Arc<ConfigStore>,
        fetcher: ReleaseFetcher,
        builder: FeedBuilder,
    ) -> Result<Self, BuildError> {
        let now = Utc::now();
        let xml = builder.build_at(Vec::new(), 0, now)?;
        let cache = FeedCache::new(CachedFeed {
            xml,
            records: Vec::new(),
            generated_at: now,
        });

        Ok(Self {
            store,
            fetcher,
            builder,
            cache,
            last_good: RwLock::new(None),
            last_summary: RwLock::new(None),
            gate: Mutex::new(None),
            pending: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            auto_refresh: AtomicBool::new(true),
            reschedule: Notify::new(),
        })
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Passes run since startup, failed ones included.
    pub fn passes_run(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    pub fn auto_refresh_enabled(&self) -> bool {
        self.auto_refresh.load(Ordering::Acquire)
    }

    /// Stop scheduled refreshes. Manual and settings-triggered refreshes
    /// still run.
    pub fn pause_auto_refresh(&self) {
        self.auto_refresh.store(false, Ordering::Release);
        self.reschedule.notify_one();
        info!("Automatic refresh paused");
    }

    /// Resume scheduled refreshes; the next one is a full interval away.
    pub fn resume_auto_refresh(&self) {
        self.auto_refresh.store(true, Ordering::Release);
        self.reschedule.notify_one();
        info!("Automatic refresh resumed");
    }

    pub async fn last_summary(&self) -> Option<RefreshSummary> {
        self.last_summary.read().await.clone()
    }

    /// Settings as saved on disk, else from the last successful load, else
    /// the defaults.
    pub async fn current_settings(&self) -> Settings {
        let store = self.store.clone();
        if let Ok(Ok(settings)) = tokio::task::spawn_blocking(move || store.load_settings()).await {
            return settings;
        }
        self.last_good
            .read()
            .await
            .as_ref()
            .map(|s| s.settings.clone())
            .unwrap_or_default()
    }

    /// Wake the background loop so a changed poll interval applies now.
    pub fn reschedule(&self) {
        self.reschedule.notify_one();
    }

    /// Re-render the cached records with at most `limit` items.
    pub async fn render_limited(&self, limit: usize) -> Result<String, BuildError> {
        let cached = self.cache.current().await;
        let poll_interval = self.current_settings().await.poll_interval_secs;
        let records = &cached.records[..limit.min(cached.records.len())];
        self.builder
            .clone()
            .with_ttl(poll_interval)
            .render(records, cached.generated_at)
    }

    /// Run a refresh cycle and wait for it. Callers that arrive while a pass
    /// is in flight queue behind it; the first of them runs one more pass and
    /// the rest return `Coalesced` with that pass's result once it is done.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.pending.store(true, Ordering::Release);
        let mut last_pass = self.gate.lock().await;

        // A pass that started after our request has already completed
        if !self.pending.swap(false, Ordering::AcqRel) {
            info!("Refresh request coalesced into the previous pass");
            return RefreshOutcome::Coalesced(last_pass.clone());
        }

        self.refreshing.store(true, Ordering::Release);
        let result = self.run_cycle().await;
        self.passes.fetch_add(1, Ordering::AcqRel);
        self.refreshing.store(false, Ordering::Release);

        match result {
            Ok(summary) => {
                *last_pass = Some(summary.clone());
                RefreshOutcome::Completed(summary)
            }
            Err(e) => {
                error!("Refresh failed, keeping previous feed: {}", e);
                *last_pass = None;
                RefreshOutcome::Failed(e)
            }
        }
    }

    async fn load_snapshot(&self) -> Result<(ConfigSnapshot, bool), RefreshError> {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.load()).await? {
            Ok(snapshot) => {
                *self.last_good.write().await = Some(snapshot.clone());
                Ok((snapshot, false))
            }
            Err(e) => match self.last_good.read().await.clone() {
                Some(snapshot) => {
                    warn!("Failed to load configuration, using last known good: {}", e);
                    Ok((snapshot, true))
                }
                None => Err(e.into()),
            },
        }
    }

    async fn run_cycle(&self) -> Result<RefreshSummary, RefreshError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let (snapshot, used_fallback_config) = self.load_snapshot().await?;
        let settings = &snapshot.settings;
        info!("Starting refresh of {} repositories", snapshot.repos.len());

        let options = FetchOptions::from(settings);
        let report = self
            .fetcher
            .fetch_all(&snapshot.repos, snapshot.token.as_deref(), &options)
            .await;

        if report.succeeded == 0 && !report.failures.is_empty() {
            return Err(RefreshError::AllFetchesFailed(report.failures.len()));
        }

        let records = select_records(report.records, settings.max_entries);
        let generated_at = Utc::now();
        let xml = self
            .builder
            .clone()
            .with_ttl(settings.poll_interval_secs)
            .render(&records, generated_at)?;
        let items = records.len();

        self.cache
            .publish(CachedFeed {
                xml,
                records,
                generated_at,
            })
            .await;

        let summary = RefreshSummary {
            started_at,
            finished_at: Utc::now(),
            repos_total: snapshot.repos.len(),
            repos_succeeded: report.succeeded,
            skipped: report
                .failures
                .iter()
                .map(|(repo, e)| SkippedRepo {
                    repo: repo.to_string(),
                    reason: e.to_string(),
                })
                .collect(),
            items,
            used_fallback_config,
        };
        *self.last_summary.write().await = Some(summary.clone());

        info!(
            "Refresh complete: {} items from {}/{} repositories in {:.2?}",
            items,
            summary.repos_succeeded,
            summary.repos_total,
            timer.elapsed()
        );
        Ok(summary)
    }
}

pub async fn start_background_refresh(refresher: Arc<Refresher>, run_at_startup: bool) {
    if run_at_startup {
        info!("Starting initial refresh");
        refresher.refresh().await;
    } else {
        info!("Startup refresh disabled, waiting for first scheduled refresh");
    }

    loop {
        if !refresher.auto_refresh_enabled() {
            refresher.reschedule.notified().await;
            continue;
        }

        let interval = Duration::from_secs(refresher.current_settings().await.poll_interval_secs);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if refresher.auto_refresh_enabled() {
                    info!("Starting scheduled refresh");
                    refresher.refresh().await;
                }
            }
            _ = refresher.reschedule.notified() => {
                info!("Refresh schedule changed");
            }
        }
    }
}
