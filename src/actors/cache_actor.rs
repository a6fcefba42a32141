use crate::actors::messages::CacheCommand;
use crate::actors::notifier::NotifierHandle;
use crate::actors::persistence_writer::PersistenceWriterHandle;
use crate::cache::{
    ApplyOutcome, BudgetOverrides, CacheStats, CacheStore, EvictionReason, EvictionReport, MessageRange,
};
use crate::core::{
    MessageEntry, MessageEvent, ReconcilerState, SessionEntry, SessionId, SessionMeta, Snapshot,
};
use crate::error::{CacheError, CacheResult};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Cloneable handle to the actor that owns the `CacheStore`
#[derive(Clone)]
pub struct CacheHandle {
    sender: Sender<CacheCommand>,
}

impl CacheHandle {
    pub fn new(
        store: CacheStore,
        writer: PersistenceWriterHandle,
        notifier: NotifierHandle,
        sweep_interval: Duration,
        buffer_size: usize,
    ) -> Self {
        let (sender, receiver) = channel(buffer_size.max(1));
        tokio::spawn(cache_actor(receiver, store, writer, notifier, sweep_interval));
        Self { sender }
    }

    async fn send(&self, command: CacheCommand) -> CacheResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| CacheError::ActorUnavailable("cache"))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> CacheCommand) -> CacheResult<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(build(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| CacheError::ActorUnavailable("cache"))
    }

    pub async fn get_session(&self, session_id: &SessionId) -> CacheResult<Option<SessionEntry>> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::GetSession { session_id, response })
            .await
    }

    pub async fn get_messages(
        &self,
        session_id: &SessionId,
        range: MessageRange,
    ) -> CacheResult<Vec<MessageEntry>> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::GetMessages {
            session_id,
            range,
            response,
        })
        .await?
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> CacheResult<Snapshot> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::Snapshot { session_id, response })
            .await
    }

    pub async fn list_sessions(&self) -> CacheResult<Vec<SessionMeta>> {
        self.request(|response| CacheCommand::ListSessions { response })
            .await
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        self.request(|response| CacheCommand::Stats { response }).await
    }

    pub async fn touch(&self, session_id: &SessionId) -> CacheResult<()> {
        self.send(CacheCommand::Touch {
            session_id: session_id.clone(),
        })
        .await
    }

    pub async fn ensure_stub(&self, session_id: &SessionId) -> CacheResult<bool> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::EnsureStub { session_id, response })
            .await?
    }

    pub async fn put_session(&self, entry: SessionEntry) -> CacheResult<()> {
        self.request(|response| CacheCommand::PutSession { entry, response })
            .await?
    }

    pub async fn put_message(&self, message: MessageEntry) -> CacheResult<ApplyOutcome> {
        self.request(|response| CacheCommand::PutMessage { message, response })
            .await?
    }

    /// Create a stub on miss; returns the generation later writes must carry
    pub async fn attach(&self, session_id: &SessionId) -> CacheResult<u64> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::Attach { session_id, response })
            .await?
    }

    pub async fn apply_event(
        &self,
        session_id: &SessionId,
        generation: u64,
        event: MessageEvent,
    ) -> CacheResult<ApplyOutcome> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::ApplyEvent {
            session_id,
            generation,
            event,
            response,
        })
        .await
    }

    /// `false` when the session left `generation`; it was not promoted
    pub async fn complete_backfill(
        &self,
        session_id: &SessionId,
        generation: u64,
        resume_token: Option<String>,
    ) -> CacheResult<bool> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::CompleteBackfill {
            session_id,
            generation,
            resume_token,
            response,
        })
        .await
    }

    pub async fn set_resume_token(
        &self,
        session_id: &SessionId,
        generation: u64,
        token: String,
    ) -> CacheResult<()> {
        self.send(CacheCommand::SetResumeToken {
            session_id: session_id.clone(),
            generation,
            token,
        })
        .await
    }

    pub async fn set_stream_state(&self, session_id: &SessionId, state: ReconcilerState) -> CacheResult<()> {
        self.send(CacheCommand::SetStreamState {
            session_id: session_id.clone(),
            state,
        })
        .await
    }

    pub async fn set_title(&self, session_id: &SessionId, title: Option<String>) -> CacheResult<bool> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::SetTitle {
            session_id,
            title,
            response,
        })
        .await
    }

    pub async fn remove_session(&self, session_id: &SessionId) -> CacheResult<bool> {
        let session_id = session_id.clone();
        self.request(|response| CacheCommand::RemoveSession { session_id, response })
            .await
    }

    pub async fn clear(&self) -> CacheResult<usize> {
        self.request(|response| CacheCommand::Clear { response }).await
    }

    pub async fn set_budgets(&self, overrides: BudgetOverrides) -> CacheResult<EvictionReport> {
        self.request(|response| CacheCommand::SetBudgets { overrides, response })
            .await
    }

    pub async fn sweep(&self) -> CacheResult<Vec<SessionId>> {
        self.request(|response| CacheCommand::Sweep { response }).await
    }

    /// Resolves once everything written so far has reached the adapter
    pub async fn flush(&self) -> CacheResult<()> {
        self.request(|response| CacheCommand::Flush { response }).await
    }

    /// Flush persistence, stop the writer and notifier, then stop the cache actor
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.request(|response| CacheCommand::Shutdown { response })
            .await
    }
}

enum Next {
    Continue,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

async fn cache_actor(
    mut receiver: Receiver<CacheCommand>,
    mut store: CacheStore,
    writer: PersistenceWriterHandle,
    notifier: NotifierHandle,
    sweep_interval: Duration,
) {
    let mut sweep_timer = interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("[CacheActor] Started with {} resident sessions", store.stats().sessions);
    publish(&mut store, &writer, &notifier).await;

    loop {
        let next = tokio::select! {
            message = receiver.recv() => match message {
                Some(command) => handle_command(&mut store, command),
                None => {
                    tracing::info!("[CacheActor] Channel closed, shutting down");
                    publish(&mut store, &writer, &notifier).await;
                    let _ = writer.shutdown().await;
                    let _ = notifier.shutdown().await;
                    break;
                }
            },
            _ = sweep_timer.tick() => {
                let expired = store.sweep_expired();
                if !expired.is_empty() {
                    tracing::debug!("[CacheActor] Periodic sweep removed {:?}", expired);
                }
                Next::Continue
            }
        };

        publish(&mut store, &writer, &notifier).await;

        match next {
            Next::Continue => {}
            Next::Flush(response) => {
                if let Err(e) = writer.flush().await {
                    tracing::error!("[CacheActor] Flush failed: {}", e);
                }
                let _ = response.send(());
            }
            Next::Shutdown(response) => {
                tracing::info!("[CacheActor] Received shutdown signal");
                if let Err(e) = writer.shutdown().await {
                    tracing::error!("[CacheActor] Persistence writer did not shut down cleanly: {}", e);
                }
                if let Err(e) = notifier.shutdown().await {
                    tracing::error!("[CacheActor] Notifier did not shut down cleanly: {}", e);
                }
                let _ = response.send(());
                break;
            }
        }
    }
}

/// Hand pending writes to the writer and changed sessions to the notifier
async fn publish(store: &mut CacheStore, writer: &PersistenceWriterHandle, notifier: &NotifierHandle) {
    let ops = store.drain_outbox();
    if let Err(e) = writer.submit(ops).await {
        tracing::error!("[CacheActor] Dropping persistence ops: {}", e);
    }

    let changed = store.drain_changed();
    if let Err(e) = notifier.changed(changed).await {
        tracing::warn!("[CacheActor] Dropping change notifications: {}", e);
    }
}

fn handle_command(store: &mut CacheStore, command: CacheCommand) -> Next {
    match command {
        CacheCommand::GetSession { session_id, response } => {
            let _ = response.send(store.get_session(&session_id));
        }
        CacheCommand::GetMessages {
            session_id,
            range,
            response,
        } => {
            let _ = response.send(store.get_messages(&session_id, range));
        }
        CacheCommand::Snapshot { session_id, response } => {
            let _ = response.send(store.snapshot(&session_id));
        }
        CacheCommand::ListSessions { response } => {
            let _ = response.send(store.list_sessions());
        }
        CacheCommand::Stats { response } => {
            let _ = response.send(store.stats());
        }
        CacheCommand::Touch { session_id } => {
            store.touch(&session_id);
        }
        CacheCommand::EnsureStub { session_id, response } => {
            let _ = response.send(store.ensure_stub(&session_id));
        }
        CacheCommand::PutSession { entry, response } => {
            let _ = response.send(store.put_session(entry));
        }
        CacheCommand::PutMessage { message, response } => {
            let _ = response.send(store.put_message(message));
        }
        CacheCommand::Attach { session_id, response } => {
            let _ = response.send(store.attach(&session_id));
        }
        CacheCommand::ApplyEvent {
            session_id,
            generation,
            event,
            response,
        } => {
            let _ = response.send(store.apply_attached_event(&session_id, generation, &event));
        }
        CacheCommand::CompleteBackfill {
            session_id,
            generation,
            resume_token,
            response,
        } => {
            let _ = response.send(store.complete_attached_backfill(&session_id, generation, resume_token));
        }
        CacheCommand::SetResumeToken {
            session_id,
            generation,
            token,
        } => {
            store.set_resume_token(&session_id, generation, token);
        }
        CacheCommand::SetStreamState { session_id, state } => {
            store.set_stream_state(&session_id, state);
        }
        CacheCommand::SetTitle {
            session_id,
            title,
            response,
        } => {
            let _ = response.send(store.set_title(&session_id, title));
        }
        CacheCommand::RemoveSession { session_id, response } => {
            let _ = response.send(store.remove_session(&session_id, EvictionReason::Explicit));
        }
        CacheCommand::Clear { response } => {
            let removed = store.clear();
            tracing::info!("[CacheActor] Cleared {} sessions", removed);
            let _ = response.send(removed);
        }
        CacheCommand::SetBudgets { overrides, response } => {
            let _ = response.send(store.set_budgets(&overrides));
        }
        CacheCommand::Sweep { response } => {
            let _ = response.send(store.sweep_expired());
        }
        CacheCommand::Flush { response } => return Next::Flush(response),
        CacheCommand::Shutdown { response } => return Next::Shutdown(response),
    }
    Next::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::persistence_writer::WriterConfig;
    use crate::cache::Budgets;
    use crate::core::{ManualClock, StreamState};
    use crate::persistence::{InMemoryPersistence, PersistenceAdapter};
    use std::sync::Arc;

    fn spawn_cache(storage: &InMemoryPersistence) -> CacheHandle {
        let clock = Arc::new(ManualClock::default());
        let store = CacheStore::new(Budgets::default(), clock);
        let writer = PersistenceWriterHandle::new(
            Arc::new(storage.clone()),
            WriterConfig {
                flush_interval: Duration::from_millis(250),
                retry_interval: Duration::from_millis(2_000),
                max_attempts: 3,
            },
            16,
        );
        let notifier = NotifierHandle::new(16);
        CacheHandle::new(store, writer, notifier, Duration::from_secs(60), 16)
    }

    #[tokio::test]
    async fn test_apply_event_through_actor() {
        let storage = InMemoryPersistence::new();
        let cache = spawn_cache(&storage);
        let session: SessionId = "s1".into();
        let generation = cache.attach(&session).await.unwrap();

        let outcome = cache
            .apply_event(&session, generation, MessageEvent::delta("m1", 1, 1, "hello"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);

        let duplicate = cache
            .apply_event(&session, generation, MessageEvent::delta("m1", 1, 1, "hello"))
            .await
            .unwrap();
        assert!(!duplicate.is_applied());

        let moved_on = cache
            .apply_event(&session, generation + 1, MessageEvent::delta("m2", 2, 1, "late"))
            .await
            .unwrap();
        assert_eq!(moved_on, ApplyOutcome::Invalidated { generation: Some(generation) });

        let messages = cache.get_messages(&session, MessageRange::all()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.text, "hello");
        assert_eq!(messages[0].stream_state, StreamState::Streaming);
    }

    #[tokio::test]
    async fn test_flush_reaches_adapter() {
        let storage = InMemoryPersistence::new();
        let cache = spawn_cache(&storage);
        let session: SessionId = "s1".into();

        cache.ensure_stub(&session).await.unwrap();
        cache.flush().await.unwrap();
        assert!(storage.exists("session:s1").await.unwrap());

        cache.remove_session(&session).await.unwrap();
        cache.flush().await.unwrap();
        assert!(!storage.exists("session:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let storage = InMemoryPersistence::new();
        let cache = spawn_cache(&storage);
        cache.shutdown().await.unwrap();

        tokio::task::yield_now().await;
        assert!(cache.stats().await.is_err());
    }
}
