use crate::actors::messages::WriterCommand;
use crate::cache::PersistOp;
use crate::config::PersistenceConfig;
use crate::error::{CacheError, CacheResult};
use crate::persistence::PersistenceAdapter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub flush_interval: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl From<&PersistenceConfig> for WriterConfig {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            max_attempts: config.max_write_attempts.max(1),
        }
    }
}

/// Handle to the background writer that mirrors cache mutations to storage
#[derive(Clone)]
pub struct PersistenceWriterHandle {
    sender: Sender<WriterCommand>,
}

impl PersistenceWriterHandle {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>, config: WriterConfig, buffer_size: usize) -> Self {
        let (sender, receiver) = channel(buffer_size.max(1));
        tokio::spawn(persistence_writer_actor(receiver, adapter, config));
        Self { sender }
    }

    async fn send(&self, command: WriterCommand) -> CacheResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| CacheError::ActorUnavailable("persistence writer"))
    }

    pub async fn submit(&self, ops: Vec<PersistOp>) -> CacheResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.send(WriterCommand::Submit(ops)).await
    }

    /// Attempt every pending write now, regardless of retry timers
    pub async fn flush(&self) -> CacheResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriterCommand::Flush(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| CacheError::ActorUnavailable("persistence writer"))
    }

    /// Number of keys waiting to be written
    pub async fn pending(&self) -> CacheResult<usize> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriterCommand::Pending(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| CacheError::ActorUnavailable("persistence writer"))
    }

    pub async fn shutdown(&self) -> CacheResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriterCommand::Shutdown(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| CacheError::ActorUnavailable("persistence writer"))
    }
}

struct PendingWrite {
    op: PersistOp,
    attempts: u32,
    retry_at: Option<Instant>,
}

async fn persistence_writer_actor(
    mut receiver: Receiver<WriterCommand>,
    adapter: Arc<dyn PersistenceAdapter>,
    config: WriterConfig,
) {
    let mut pending: HashMap<String, PendingWrite> = HashMap::new();
    let mut flush_timer = interval(config.flush_interval);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("[PersistenceWriter] Started (flush every {:?})", config.flush_interval);

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(WriterCommand::Submit(ops)) => enqueue(&mut pending, ops),
                Some(WriterCommand::Flush(response)) => {
                    flush(&mut pending, adapter.as_ref(), &config, true).await;
                    let _ = response.send(());
                }
                Some(WriterCommand::Pending(response)) => {
                    let _ = response.send(pending.len());
                }
                Some(WriterCommand::Shutdown(response)) => {
                    flush(&mut pending, adapter.as_ref(), &config, true).await;
                    if !pending.is_empty() {
                        tracing::warn!("[PersistenceWriter] Shutting down with {} unwritten keys", pending.len());
                    }
                    let _ = response.send(());
                    break;
                }
                None => {
                    flush(&mut pending, adapter.as_ref(), &config, true).await;
                    tracing::info!("[PersistenceWriter] Channel closed, shutting down");
                    break;
                }
            },
            _ = flush_timer.tick() => {
                if !pending.is_empty() {
                    flush(&mut pending, adapter.as_ref(), &config, false).await;
                }
            }
        }
    }
}

/// Later ops for a key replace earlier ones that have not been written yet
fn enqueue(pending: &mut HashMap<String, PendingWrite>, ops: Vec<PersistOp>) {
    for op in ops {
        pending.insert(
            op.key().to_string(),
            PendingWrite {
                op,
                attempts: 0,
                retry_at: None,
            },
        );
    }
}

async fn flush(
    pending: &mut HashMap<String, PendingWrite>,
    adapter: &dyn PersistenceAdapter,
    config: &WriterConfig,
    force: bool,
) {
    let now = Instant::now();
    let mut due: Vec<String> = pending
        .iter()
        .filter(|(_, write)| force || write.retry_at.map_or(true, |at| at <= now))
        .map(|(key, _)| key.clone())
        .collect();
    due.sort();

    let mut written = 0usize;
    for key in due {
        let Some(mut write) = pending.remove(&key) else {
            continue;
        };

        let result = match &write.op {
            PersistOp::Put { key, bytes } => adapter.set(key, bytes).await,
            PersistOp::Delete { key } => adapter.delete(key).await,
        };

        match result {
            Ok(()) => written += 1,
            Err(e) => {
                write.attempts += 1;
                if write.attempts >= config.max_attempts {
                    tracing::error!(
                        "[PersistenceWriter] Giving up on '{}' after {} attempts: {}",
                        key,
                        write.attempts,
                        e
                    );
                } else {
                    tracing::warn!(
                        "[PersistenceWriter] Write of '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                        key,
                        write.attempts,
                        config.max_attempts,
                        e,
                        config.retry_interval
                    );
                    write.retry_at = Some(Instant::now() + config.retry_interval);
                    pending.insert(key, write);
                }
            }
        }
    }

    if written > 0 {
        tracing::debug!("[PersistenceWriter] Flushed {} keys ({} pending)", written, pending.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    fn config(max_attempts: u32) -> WriterConfig {
        WriterConfig {
            flush_interval: Duration::from_millis(250),
            retry_interval: Duration::from_millis(2_000),
            max_attempts,
        }
    }

    fn put(key: &str, value: &str) -> PersistOp {
        PersistOp::Put {
            key: key.to_string(),
            bytes: value.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_coalesces_writes_per_key() {
        let storage = InMemoryPersistence::new();
        let writer = PersistenceWriterHandle::new(Arc::new(storage.clone()), config(3), 16);

        writer
            .submit(vec![put("session:s1", "a"), put("session:s1", "b"), put("session:s2", "c")])
            .await
            .unwrap();
        writer.flush().await.unwrap();

        assert_eq!(storage.get("session:s1").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(storage.write_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_supersedes_put() {
        let storage = InMemoryPersistence::new();
        storage.set("session:s1", b"old").await.unwrap();
        let writer = PersistenceWriterHandle::new(Arc::new(storage.clone()), config(3), 16);

        writer
            .submit(vec![
                put("session:s1", "new"),
                PersistOp::Delete {
                    key: "session:s1".to_string(),
                },
            ])
            .await
            .unwrap();
        writer.flush().await.unwrap();

        assert_eq!(storage.get("session:s1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_retried_on_timer() {
        let storage = InMemoryPersistence::new();
        storage.set_fail_writes(true);
        let writer = PersistenceWriterHandle::new(Arc::new(storage.clone()), config(5), 16);

        writer.submit(vec![put("session:s1", "a")]).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.pending().await.unwrap(), 1);

        storage.set_fail_writes(false);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(writer.pending().await.unwrap(), 0);
        assert_eq!(storage.get("session:s1").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let storage = InMemoryPersistence::new();
        storage.set_fail_writes(true);
        let writer = PersistenceWriterHandle::new(Arc::new(storage.clone()), config(2), 16);

        writer.submit(vec![put("session:s1", "a")]).await.unwrap();
        writer.flush().await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(writer.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let storage = InMemoryPersistence::new();
        let writer = PersistenceWriterHandle::new(Arc::new(storage.clone()), config(3), 16);

        writer.submit(vec![put("session:s1", "a")]).await.unwrap();
        writer.shutdown().await.unwrap();

        assert!(storage.exists("session:s1").await.unwrap());
    }
}
