//! Session cache facade
//!
//! This module provides the interface UI stores use, hiding the actor system
//! underneath. An explicit `SessionCache` instance is created per client;
//! cloning it is cheap and every clone talks to the same actors.

use crate::actors::reconciler::wait_for_state;
use crate::actors::{
    CacheHandle, ChangeCallback, NotifierHandle, PersistenceWriterHandle, ReconcilerConfig, ReconcilerHandle,
    WriterConfig,
};
use crate::cache::{BudgetOverrides, CacheStats, CacheStore, EvictionReport, LoadReport};
use crate::config::Settings;
use crate::core::{Clock, ReconcilerState, SessionId, SessionMeta, Snapshot, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::persistence::{open_backend, PersistenceAdapter};
use crate::source::EventSource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;

/// Builder for `SessionCache`
///
/// # Example
/// ```no_run
/// use chat_cache::{SessionCache, Settings};
/// use chat_cache::source::ChannelEventSource;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let source = Arc::new(ChannelEventSource::new());
///     let cache = SessionCache::builder(Settings::new()?, source).open().await?;
///
///     let subscription = cache
///         .subscribe("session-1", |id| println!("{} changed", id))
///         .await?;
///     let snapshot = cache.get_snapshot("session-1").await;
///     println!("{} messages", snapshot.messages.len());
///
///     subscription.unsubscribe().await;
///     cache.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct SessionCacheBuilder {
    settings: Settings,
    source: Arc<dyn EventSource>,
    adapter: Option<Arc<dyn PersistenceAdapter>>,
    clock: Arc<dyn Clock>,
}

impl SessionCacheBuilder {
    /// Use this adapter instead of the one named in `settings.persistence`
    pub fn adapter(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load persisted state and start the actors
    pub async fn open(self) -> CacheResult<SessionCache> {
        let settings = self.settings;
        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => open_backend(&settings.persistence).await?,
        };

        let (store, report) = CacheStore::load(adapter.as_ref(), settings.budgets(), self.clock).await?;
        tracing::info!(
            "Session cache loaded: {} sessions, {} messages ({} corrupt keys dropped)",
            report.sessions,
            report.messages,
            report.corrupt_keys
        );

        let buffer_size = settings.system.channel_buffer_size;
        let writer = PersistenceWriterHandle::new(
            Arc::clone(&adapter),
            WriterConfig::from(&settings.persistence),
            buffer_size,
        );
        let notifier = NotifierHandle::new(buffer_size);
        let cache = CacheHandle::new(
            store,
            writer,
            notifier.clone(),
            Duration::from_millis(settings.cache.sweep_interval_ms.max(1)),
            buffer_size,
        );

        Ok(SessionCache {
            inner: Arc::new(Inner {
                cache,
                notifier,
                source: self.source,
                reconciler_config: ReconcilerConfig::from(&settings.stream),
                reconcilers: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                load_report: report,
            }),
        })
    }
}

struct Inner {
    cache: CacheHandle,
    notifier: NotifierHandle,
    source: Arc<dyn EventSource>,
    reconciler_config: ReconcilerConfig,
    reconcilers: Mutex<HashMap<SessionId, ReconcilerHandle>>,
    /// Live subscription count per session
    subscribers: Mutex<HashMap<SessionId, usize>>,
    next_subscription: AtomicU64,
    load_report: LoadReport,
}

#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionCache {
    pub fn builder(settings: Settings, source: Arc<dyn EventSource>) -> SessionCacheBuilder {
        SessionCacheBuilder {
            settings,
            source,
            adapter: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub async fn open(
        settings: Settings,
        adapter: Arc<dyn PersistenceAdapter>,
        source: Arc<dyn EventSource>,
    ) -> CacheResult<Self> {
        Self::builder(settings, source).adapter(adapter).open().await
    }

    /// What the initial load found in persistence
    pub fn load_report(&self) -> &LoadReport {
        &self.inner.load_report
    }

    /// Current view of a session. Never fails: an unknown, expired or
    /// unreachable session is `Snapshot::absent()`.
    pub async fn get_snapshot(&self, session_id: impl Into<SessionId>) -> Snapshot {
        let session_id = session_id.into();
        if let Err(e) = self.inner.cache.touch(&session_id).await {
            tracing::debug!("Snapshot of '{}' without touch: {}", session_id, e);
        }
        match self.inner.cache.snapshot(&session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Snapshot of '{}' unavailable: {}", session_id, e);
                Snapshot::absent()
            }
        }
    }

    /// Watch a session. Keeps a live reconciler running while at least one
    /// subscription exists; `on_change` fires at most once per scheduler turn.
    pub async fn subscribe<F>(&self, session_id: impl Into<SessionId>, on_change: F) -> CacheResult<Subscription>
    where
        F: Fn(&SessionId) + Send + Sync + 'static,
    {
        let session_id = session_id.into();
        self.inner.cache.ensure_stub(&session_id).await?;

        let subscription_id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let callback: ChangeCallback = Arc::new(on_change);
        self.inner
            .notifier
            .subscribe(session_id.clone(), subscription_id, callback)
            .await?;
        *lock(&self.inner.subscribers).entry(session_id.clone()).or_insert(0) += 1;

        self.start_reconciler(&session_id, false).await;
        tracing::debug!("Subscription {} opened for '{}'", subscription_id, session_id);

        Ok(Subscription {
            cache: self.clone(),
            session_id,
            subscription_id,
            active: true,
        })
    }

    /// Ensure a stub exists and backfill it in the background. Without
    /// subscribers the reconciler stops once the session is fully cached.
    pub async fn prefetch(&self, session_id: impl Into<SessionId>) -> CacheResult<()> {
        let session_id = session_id.into();
        self.inner.cache.ensure_stub(&session_id).await?;
        let watched = lock(&self.inner.subscribers).contains_key(&session_id);
        self.start_reconciler(&session_id, !watched).await;
        Ok(())
    }

    /// Current reconciler state, if one was started for the session
    pub fn stream_state(&self, session_id: &SessionId) -> Option<ReconcilerState> {
        lock(&self.inner.reconcilers).get(session_id).map(ReconcilerHandle::state)
    }

    /// Wait until the session's reconciler satisfies `predicate` (or stops)
    pub async fn wait_for_stream_state(
        &self,
        session_id: &SessionId,
        predicate: impl FnMut(&ReconcilerState) -> bool,
    ) -> Option<ReconcilerState> {
        let watch = lock(&self.inner.reconcilers)
            .get(session_id)
            .map(ReconcilerHandle::watch_state)?;
        Some(wait_for_state(watch, predicate).await)
    }

    /// Close every reconciler, drop all cached data and delete it from persistence
    pub async fn evict_all(&self) -> CacheResult<usize> {
        self.close_all_reconcilers().await;
        let removed = self.inner.cache.clear().await?;
        self.inner.cache.flush().await?;
        tracing::info!("Evicted all {} sessions", removed);
        Ok(removed)
    }

    /// Override budgets and TTL at runtime; enforced immediately
    pub async fn set_budgets(&self, overrides: BudgetOverrides) -> CacheResult<EvictionReport> {
        self.inner.cache.set_budgets(overrides).await
    }

    pub async fn remove_session(&self, session_id: impl Into<SessionId>) -> CacheResult<bool> {
        let session_id = session_id.into();
        let handle = lock(&self.inner.reconcilers).remove(&session_id);
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.inner.cache.remove_session(&session_id).await
    }

    pub async fn set_title(&self, session_id: impl Into<SessionId>, title: Option<String>) -> CacheResult<()> {
        let session_id = session_id.into();
        if self.inner.cache.set_title(&session_id, title).await? {
            Ok(())
        } else {
            Err(CacheError::SessionNotFound(session_id))
        }
    }

    /// History list, most recently accessed first (stubs included)
    pub async fn list_sessions(&self) -> CacheResult<Vec<SessionMeta>> {
        self.inner.cache.list_sessions().await
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.cache.stats().await
    }

    /// Drop expired sessions now instead of waiting for the periodic sweep
    pub async fn sweep(&self) -> CacheResult<Vec<SessionId>> {
        self.inner.cache.sweep().await
    }

    /// Wait until every write issued so far reached persistence
    pub async fn flush(&self) -> CacheResult<()> {
        self.inner.cache.flush().await
    }

    /// Close reconcilers, flush persistence and stop all actors
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.close_all_reconcilers().await;
        self.inner.cache.shutdown().await?;
        tracing::info!("Session cache shutdown complete");
        Ok(())
    }

    async fn start_reconciler(&self, session_id: &SessionId, close_after_backfill: bool) {
        // A prefetch reconciler would stop after backfill; replace it with a live one
        let replaced = {
            let mut reconcilers = lock(&self.inner.reconcilers);
            let running = reconcilers.get(session_id).filter(|handle| !handle.is_finished());
            match running.map(ReconcilerHandle::closes_after_backfill) {
                Some(true) if !close_after_backfill => reconcilers.remove(session_id),
                Some(_) => return,
                None => None,
            }
        };
        if let Some(handle) = replaced {
            handle.close().await;
        }

        let mut reconcilers = lock(&self.inner.reconcilers);
        if reconcilers.get(session_id).is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        tracing::debug!(
            "Starting reconciler for '{}'{}",
            session_id,
            if close_after_backfill { " (prefetch)" } else { "" }
        );
        let handle = ReconcilerHandle::spawn(
            session_id.clone(),
            Arc::clone(&self.inner.source),
            self.inner.cache.clone(),
            self.inner.reconciler_config.clone(),
            close_after_backfill,
        );
        reconcilers.insert(session_id.clone(), handle);
    }

    async fn close_all_reconcilers(&self) {
        let handles: Vec<ReconcilerHandle> = lock(&self.inner.reconcilers).drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
    }

    async fn release(&self, session_id: &SessionId, subscription_id: u64) {
        if let Err(e) = self
            .inner
            .notifier
            .unsubscribe(session_id.clone(), subscription_id)
            .await
        {
            tracing::debug!("Unsubscribe of {} ignored: {}", subscription_id, e);
        }

        let last = {
            let mut subscribers = lock(&self.inner.subscribers);
            match subscribers.get_mut(session_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    subscribers.remove(session_id);
                    true
                }
                None => false,
            }
        };

        if last {
            let handle = lock(&self.inner.reconcilers).remove(session_id);
            if let Some(handle) = handle {
                handle.close().await;
                tracing::debug!("Closed reconciler for '{}' (no subscribers left)", session_id);
            }
        }
    }
}

/// Active subscription; call `unsubscribe` or drop it
pub struct Subscription {
    cache: SessionCache,
    session_id: SessionId,
    subscription_id: u64,
    active: bool,
}

impl Subscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Stop notifications; closes the reconciler when this was the last subscriber
    pub async fn unsubscribe(mut self) {
        self.active = false;
        self.cache.release(&self.session_id, self.subscription_id).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let cache = self.cache.clone();
        let session_id = self.session_id.clone();
        let subscription_id = self.subscription_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { cache.release(&session_id, subscription_id).await });
            }
            Err(_) => {
                cache.inner.notifier.try_unsubscribe(session_id, subscription_id);
            }
        }
    }
}
