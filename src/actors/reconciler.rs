use crate::actors::backoff::Backoff;
use crate::actors::cache_actor::CacheHandle;
use crate::actors::messages::ReconcilerCommand;
use crate::actors::reorder::ReorderBuffer;
use crate::cache::{ApplyOutcome, MessageRange};
use crate::config::StreamConfig;
use crate::core::{MessageEvent, MessageId, ReconcilerState, ResumeCursor, SessionId, StreamEvent};
use crate::error::{CacheError, CacheResult, SourceError};
use crate::source::{EventSource, EventStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub reorder_window: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl From<&StreamConfig> for ReconcilerConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            reorder_window: Duration::from_millis(config.reorder_window_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            max_attempts: config.max_attempts,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms.max(1)),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Handle to the task that keeps one session in sync with its event source
pub struct ReconcilerHandle {
    session_id: SessionId,
    sender: Sender<ReconcilerCommand>,
    state: watch::Receiver<ReconcilerState>,
    closes_after_backfill: bool,
}

impl ReconcilerHandle {
    /// Start reconciling `session_id`. With `close_after_backfill` the task
    /// stops on its own once the session reached Live (prefetch).
    pub fn spawn(
        session_id: SessionId,
        source: Arc<dyn EventSource>,
        cache: CacheHandle,
        config: ReconcilerConfig,
        close_after_backfill: bool,
    ) -> Self {
        let (sender, receiver) = channel(8);
        let (state_tx, state_rx) = watch::channel(ReconcilerState::Idle);

        let reconciler = Reconciler {
            session_id: session_id.clone(),
            reorder: ReorderBuffer::new(config.reorder_window),
            source,
            cache,
            config,
            state_tx,
            revisions: HashMap::new(),
            generation: 0,
            invalidated: false,
            token: None,
            reached_live: false,
            close_after_backfill,
        };
        tokio::spawn(reconciler_actor(reconciler, receiver));

        Self {
            session_id,
            sender,
            state: state_rx,
            closes_after_backfill: close_after_backfill,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal() || self.sender.is_closed()
    }

    /// Started by a prefetch; stops by itself once Live
    pub fn closes_after_backfill(&self) -> bool {
        self.closes_after_backfill
    }

    pub fn watch_state(&self) -> watch::Receiver<ReconcilerState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate` or the task ends
    pub async fn wait_until(&self, predicate: impl FnMut(&ReconcilerState) -> bool) -> ReconcilerState {
        wait_for_state(self.watch_state(), predicate).await
    }

    /// Stop the task; resolves once it will issue no further cache mutations
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.send(ReconcilerCommand::Close(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

/// Resolve once `state` satisfies `predicate`, or with the last state if the task ended
pub async fn wait_for_state(
    mut state: watch::Receiver<ReconcilerState>,
    predicate: impl FnMut(&ReconcilerState) -> bool,
) -> ReconcilerState {
    let reached = match state.wait_for(predicate).await {
        Ok(current) => Some(*current),
        Err(_) => None,
    };
    reached.unwrap_or_else(|| *state.borrow())
}

/// Close acknowledgement to send on exit; `None` when every handle is gone
fn stop_reason(command: Option<ReconcilerCommand>) -> Option<oneshot::Sender<()>> {
    match command {
        Some(ReconcilerCommand::Close(ack)) => Some(ack),
        None => None,
    }
}

enum PumpEnd {
    /// The cache dropped this session's history; backfill again from scratch
    Invalidated,
    Disconnected(SourceError),
    Fatal(SourceError),
    Stop(Option<oneshot::Sender<()>>),
    Done,
}

type Finish = (ReconcilerState, Option<oneshot::Sender<()>>);

struct Reconciler {
    session_id: SessionId,
    source: Arc<dyn EventSource>,
    cache: CacheHandle,
    config: ReconcilerConfig,
    state_tx: watch::Sender<ReconcilerState>,
    reorder: ReorderBuffer,
    /// Last applied revision per message, mirrored from the cache
    revisions: HashMap<MessageId, u64>,
    /// Cache slot generation the mirror belongs to
    generation: u64,
    invalidated: bool,
    token: Option<String>,
    reached_live: bool,
    close_after_backfill: bool,
}

async fn reconciler_actor(mut reconciler: Reconciler, mut commands: Receiver<ReconcilerCommand>) {
    tracing::info!("[Reconciler] Started for session '{}'", reconciler.session_id);

    let (final_state, ack) = match reconciler.seed().await {
        Ok(()) => reconciler.run(&mut commands).await,
        Err(e) => {
            tracing::error!("[Reconciler] Cannot read session '{}': {}", reconciler.session_id, e);
            (ReconcilerState::Failed, None)
        }
    };

    reconciler.reorder.clear();
    reconciler.source.close(&reconciler.session_id).await;
    reconciler.set_state(final_state).await;
    commands.close();

    tracing::info!(
        "[Reconciler] Stopped for session '{}' ({})",
        reconciler.session_id,
        final_state
    );
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

impl Reconciler {
    /// Record in the cache first so watchers woken by the state change see it there
    async fn set_state(&mut self, state: ReconcilerState) {
        if let Err(e) = self.cache.set_stream_state(&self.session_id, state).await {
            tracing::debug!("[Reconciler] Could not record state for '{}': {}", self.session_id, e);
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(
                "[Reconciler] Session '{}': {} -> {}",
                self.session_id,
                previous,
                state
            );
        }
    }

    /// Start from whatever the cache already holds for this session
    async fn seed(&mut self) -> CacheResult<()> {
        self.generation = self.cache.attach(&self.session_id).await?;
        self.invalidated = false;
        if let Some(entry) = self.cache.get_session(&self.session_id).await? {
            self.token = entry.resume_token;
        }
        let messages = match self.cache.get_messages(&self.session_id, MessageRange::all()).await {
            Ok(messages) => messages,
            Err(CacheError::SessionNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        self.revisions = messages
            .into_iter()
            .map(|message| (message.message_id, message.revision))
            .collect();
        Ok(())
    }

    /// Forget the mirrored view after the cache demoted or evicted the session
    async fn reset(&mut self) -> CacheResult<()> {
        tracing::info!(
            "[Reconciler] Session '{}' lost its cached history; backfilling again",
            self.session_id
        );
        self.reorder.clear();
        self.revisions.clear();
        self.token = None;
        self.reached_live = false;
        self.seed().await
    }

    fn cursor(&self) -> Option<ResumeCursor> {
        let cursor = ResumeCursor {
            token: self.token.clone(),
            revisions: self
                .revisions
                .iter()
                .map(|(id, revision)| (id.clone(), *revision))
                .collect(),
        };
        (!cursor.is_empty()).then_some(cursor)
    }

    async fn run(&mut self, commands: &mut Receiver<ReconcilerCommand>) -> Finish {
        let mut backoff = Backoff::new(
            self.config.backoff_base,
            self.config.backoff_cap,
            self.config.max_attempts,
        );
        self.set_state(ReconcilerState::Backfilling).await;

        loop {
            let source = Arc::clone(&self.source);
            let session_id = self.session_id.clone();
            let open = timeout(self.config.attempt_timeout, source.open(&session_id, self.cursor()));
            tokio::pin!(open);

            let opened = tokio::select! {
                biased;
                command = commands.recv() => return (ReconcilerState::Closed, stop_reason(command)),
                result = &mut open => result,
            };

            let stream = match opened {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) if !e.is_retryable() => {
                    tracing::error!("[Reconciler] Session '{}' cannot be opened: {}", self.session_id, e);
                    return (ReconcilerState::Failed, None);
                }
                Ok(Err(e)) => {
                    if let Some(finish) = self.retry_after(&mut backoff, e, commands).await {
                        return finish;
                    }
                    None
                }
                Err(_) => {
                    let e = SourceError::Timeout(self.config.attempt_timeout.as_millis() as u64);
                    if let Some(finish) = self.retry_after(&mut backoff, e, commands).await {
                        return finish;
                    }
                    None
                }
            };
            let Some(stream) = stream else {
                continue;
            };

            if self.reached_live {
                tracing::info!("[Reconciler] Session '{}' resumed", self.session_id);
                self.set_state(ReconcilerState::Live).await;
                if let Err(e) = self.resync_streaming().await {
                    tracing::error!("[Reconciler] Cache unavailable for '{}': {}", self.session_id, e);
                    return (ReconcilerState::Closed, None);
                }
            }
            let end = if self.invalidated {
                PumpEnd::Invalidated
            } else {
                self.pump(stream, commands, &mut backoff).await
            };

            match end {
                PumpEnd::Invalidated => {
                    if let Err(e) = self.reset().await {
                        tracing::error!("[Reconciler] Cache unavailable for '{}': {}", self.session_id, e);
                        return (ReconcilerState::Closed, None);
                    }
                    self.set_state(ReconcilerState::Backfilling).await;
                }
                PumpEnd::Stop(ack) => return (ReconcilerState::Closed, ack),
                PumpEnd::Done => return (ReconcilerState::Closed, None),
                PumpEnd::Fatal(e) => {
                    tracing::error!("[Reconciler] Session '{}' failed: {}", self.session_id, e);
                    return (ReconcilerState::Failed, None);
                }
                PumpEnd::Disconnected(e) => {
                    if self.reached_live {
                        self.set_state(ReconcilerState::Reconnecting).await;
                    }
                    if let Some(finish) = self.retry_after(&mut backoff, e, commands).await {
                        return finish;
                    }
                }
            }
        }
    }

    /// Sleep out the next backoff delay; `Some` when the task must stop instead
    async fn retry_after(
        &mut self,
        backoff: &mut Backoff,
        error: SourceError,
        commands: &mut Receiver<ReconcilerCommand>,
    ) -> Option<Finish> {
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(
                "[Reconciler] Session '{}' giving up after {} attempts: {}",
                self.session_id,
                backoff.attempts(),
                error
            );
            return Some((ReconcilerState::Failed, None));
        };

        tracing::warn!(
            "[Reconciler] Session '{}' attempt {} failed: {}. Retrying in {:?}",
            self.session_id,
            backoff.attempts(),
            error,
            delay
        );

        tokio::select! {
            biased;
            command = commands.recv() => Some((ReconcilerState::Closed, stop_reason(command))),
            _ = sleep(delay) => None,
        }
    }

    async fn pump(
        &mut self,
        mut stream: EventStream,
        commands: &mut Receiver<ReconcilerCommand>,
        backoff: &mut Backoff,
    ) -> PumpEnd {
        let backfill_deadline = Instant::now() + self.config.attempt_timeout;

        loop {
            let reorder_deadline = self.reorder.next_deadline();
            let backfilling = !self.reached_live;

            let outcome = tokio::select! {
                biased;
                command = commands.recv() => return PumpEnd::Stop(stop_reason(command)),
                _ = sleep_until(reorder_deadline.unwrap_or(backfill_deadline)), if reorder_deadline.is_some() => {
                    self.expire_held().await.map(|_| None)
                }
                _ = sleep_until(backfill_deadline), if backfilling => {
                    return PumpEnd::Disconnected(SourceError::Timeout(
                        self.config.attempt_timeout.as_millis() as u64,
                    ));
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if self.reached_live {
                            backoff.reset();
                        }
                        self.handle_event(event, backoff).await
                    }
                    Some(Err(SourceError::Protocol(reason))) => {
                        tracing::warn!(
                            "[Reconciler] Session '{}' dropped malformed event: {}",
                            self.session_id,
                            reason
                        );
                        Ok(None)
                    }
                    Some(Err(e)) if e.is_retryable() => return PumpEnd::Disconnected(e),
                    Some(Err(e)) => return PumpEnd::Fatal(e),
                    None => {
                        return PumpEnd::Disconnected(SourceError::Transient("stream ended".to_string()))
                    }
                },
            };

            match outcome {
                Ok(None) if self.invalidated => return PumpEnd::Invalidated,
                Ok(None) => {}
                Ok(Some(end)) => return end,
                Err(e) => {
                    tracing::error!("[Reconciler] Cache unavailable for '{}': {}", self.session_id, e);
                    return PumpEnd::Stop(None);
                }
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent, backoff: &mut Backoff) -> CacheResult<Option<PumpEnd>> {
        match event {
            StreamEvent::Message(event) => {
                self.offer(event).await?;
                Ok(None)
            }
            StreamEvent::Checkpoint { resume_token } => {
                self.token = Some(resume_token.clone());
                self.cache
                    .set_resume_token(&self.session_id, self.generation, resume_token)
                    .await?;
                Ok(None)
            }
            StreamEvent::BackfillComplete { resume_token } => {
                if resume_token.is_some() {
                    self.token = resume_token.clone();
                }
                let promoted = self
                    .cache
                    .complete_backfill(&self.session_id, self.generation, resume_token)
                    .await?;
                if !promoted {
                    self.invalidated = true;
                    return Ok(Some(PumpEnd::Invalidated));
                }
                backoff.reset();

                if !self.reached_live {
                    self.reached_live = true;
                    self.set_state(ReconcilerState::Live).await;
                }
                if self.close_after_backfill {
                    tracing::debug!("[Reconciler] Prefetch of '{}' complete", self.session_id);
                    return Ok(Some(PumpEnd::Done));
                }
                Ok(None)
            }
        }
    }

    /// Apply an event now, park it behind a revision gap, or drop it as stale
    async fn offer(&mut self, event: MessageEvent) -> CacheResult<()> {
        let current = self.revisions.get(&event.message_id).copied();
        if let Some(current) = current {
            if event.revision <= current {
                tracing::trace!(
                    "[Reconciler] Skipping '{}' revision {} (at {})",
                    event.message_id,
                    event.revision,
                    current
                );
                return Ok(());
            }
        }

        let expected = current.unwrap_or(0) + 1;
        if event.kind.is_order_sensitive() && event.revision > expected {
            tracing::debug!(
                "[Reconciler] Holding '{}' revision {} until {} arrives",
                event.message_id,
                event.revision,
                expected
            );
            self.reorder.hold(event, Instant::now());
            return Ok(());
        }

        let message_id = event.message_id.clone();
        self.apply(event).await?;

        while let Some(current) = self.revisions.get(&message_id).copied() {
            if self.invalidated {
                break;
            }
            let Some(next) = self.reorder.take_next(&message_id, current) else {
                break;
            };
            self.apply(next).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, event: MessageEvent) -> CacheResult<()> {
        if self.invalidated {
            return Ok(());
        }
        let message_id = event.message_id.clone();
        let revision = event.revision;
        let kind = event.kind.label();

        match self
            .cache
            .apply_event(&self.session_id, self.generation, event)
            .await?
        {
            ApplyOutcome::Created | ApplyOutcome::Updated => {
                self.revisions.insert(message_id, revision);
            }
            ApplyOutcome::Stale { current_revision } => {
                let known = self.revisions.entry(message_id).or_insert(0);
                *known = (*known).max(current_revision);
            }
            ApplyOutcome::BelowTruncationFloor { floor } => {
                tracing::debug!(
                    "[Reconciler] Dropped '{}' below truncation floor {} in '{}'",
                    message_id,
                    floor,
                    self.session_id
                );
            }
            ApplyOutcome::ProtocolViolation(reason) => {
                tracing::warn!(
                    "[Reconciler] Dropped {} for '{}' in '{}': {}",
                    kind,
                    message_id,
                    self.session_id,
                    reason
                );
            }
            ApplyOutcome::Invalidated { generation } => {
                tracing::debug!(
                    "[Reconciler] Session '{}' moved from generation {} to {:?}",
                    self.session_id,
                    self.generation,
                    generation
                );
                self.invalidated = true;
            }
        }
        Ok(())
    }

    async fn expire_held(&mut self) -> CacheResult<()> {
        let expired = self.reorder.expire(Instant::now());
        if expired.is_empty() {
            return Ok(());
        }

        for (message_id, count) in &expired {
            tracing::warn!(
                "[Reconciler] Gap in '{}' of session '{}' not filled within {:?}; discarded {} events",
                message_id,
                self.session_id,
                self.config.reorder_window,
                count
            );
        }
        let message_ids: Vec<MessageId> = expired.into_iter().map(|(id, _)| id).collect();
        self.resync(&message_ids).await
    }

    /// After a resume, refetch messages that were mid-stream when the connection dropped
    async fn resync_streaming(&mut self) -> CacheResult<()> {
        let streaming: Vec<MessageId> = match self
            .cache
            .get_messages(&self.session_id, MessageRange::all())
            .await
        {
            Ok(messages) => messages
                .into_iter()
                .filter(|message| message.is_streaming())
                .map(|message| message.message_id)
                .collect(),
            Err(CacheError::SessionNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        if streaming.is_empty() {
            return Ok(());
        }
        self.resync(&streaming).await
    }

    async fn resync(&mut self, message_ids: &[MessageId]) -> CacheResult<()> {
        let source = Arc::clone(&self.source);
        match timeout(self.config.attempt_timeout, source.resync(&self.session_id, message_ids)).await {
            Ok(Ok(snapshots)) => {
                tracing::debug!(
                    "[Reconciler] Resynced {} of {} messages in '{}'",
                    snapshots.len(),
                    message_ids.len(),
                    self.session_id
                );
                for snapshot in snapshots {
                    self.offer(snapshot).await?;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("[Reconciler] Resync of '{}' failed: {}", self.session_id, e);
            }
            Err(_) => {
                tracing::warn!("[Reconciler] Resync of '{}' timed out", self.session_id);
            }
        }
        Ok(())
    }
}
