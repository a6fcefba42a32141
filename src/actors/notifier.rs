use crate::actors::messages::{ChangeCallback, NotifierCommand};
use crate::core::SessionId;
use crate::error::{CacheError, CacheResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc::{channel, error::TryRecvError, Receiver, Sender};
use tokio::sync::oneshot;

/// Handle to the actor that fans change notifications out to UI subscribers
#[derive(Clone)]
pub struct NotifierHandle {
    sender: Sender<NotifierCommand>,
}

impl NotifierHandle {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, receiver) = channel(buffer_size.max(1));
        tokio::spawn(notifier_actor(receiver));
        Self { sender }
    }

    async fn send(&self, command: NotifierCommand) -> CacheResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| CacheError::ActorUnavailable("notifier"))
    }

    pub async fn subscribe(
        &self,
        session_id: SessionId,
        subscription_id: u64,
        callback: ChangeCallback,
    ) -> CacheResult<()> {
        self.send(NotifierCommand::Subscribe {
            session_id,
            subscription_id,
            callback,
        })
        .await
    }

    pub async fn unsubscribe(&self, session_id: SessionId, subscription_id: u64) -> CacheResult<()> {
        self.send(NotifierCommand::Unsubscribe {
            session_id,
            subscription_id,
        })
        .await
    }

    /// Non-blocking variant for use from `Drop`
    pub fn try_unsubscribe(&self, session_id: SessionId, subscription_id: u64) -> bool {
        self.sender
            .try_send(NotifierCommand::Unsubscribe {
                session_id,
                subscription_id,
            })
            .is_ok()
    }

    pub async fn changed(&self, session_ids: Vec<SessionId>) -> CacheResult<()> {
        if session_ids.is_empty() {
            return Ok(());
        }
        self.send(NotifierCommand::Changed(session_ids)).await
    }

    pub async fn shutdown(&self) -> CacheResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(NotifierCommand::Shutdown(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| CacheError::ActorUnavailable("notifier"))
    }
}

#[derive(Default)]
struct Subscribers {
    by_session: HashMap<SessionId, BTreeMap<u64, ChangeCallback>>,
    dirty: BTreeSet<SessionId>,
}

impl Subscribers {
    /// Returns false once shutdown was requested
    fn handle(&mut self, command: NotifierCommand, shutdown: &mut Option<oneshot::Sender<()>>) -> bool {
        match command {
            NotifierCommand::Subscribe {
                session_id,
                subscription_id,
                callback,
            } => {
                self.by_session
                    .entry(session_id)
                    .or_default()
                    .insert(subscription_id, callback);
            }
            NotifierCommand::Unsubscribe {
                session_id,
                subscription_id,
            } => {
                if let Some(callbacks) = self.by_session.get_mut(&session_id) {
                    callbacks.remove(&subscription_id);
                    if callbacks.is_empty() {
                        self.by_session.remove(&session_id);
                    }
                }
            }
            NotifierCommand::Changed(session_ids) => {
                self.dirty.extend(
                    session_ids
                        .into_iter()
                        .filter(|id| self.by_session.contains_key(id)),
                );
            }
            NotifierCommand::Shutdown(response) => {
                *shutdown = Some(response);
                return false;
            }
        }
        true
    }

    /// Take everything already queued without waiting
    fn drain(&mut self, receiver: &mut Receiver<NotifierCommand>, shutdown: &mut Option<oneshot::Sender<()>>) -> bool {
        loop {
            match receiver.try_recv() {
                Ok(command) => {
                    if !self.handle(command, shutdown) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn dispatch(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for session_id in dirty {
            // Subscribers removed while the batch was collected get nothing
            let Some(callbacks) = self.by_session.get(&session_id) else {
                continue;
            };
            for callback in callbacks.values() {
                callback(&session_id);
            }
        }
    }
}

async fn notifier_actor(mut receiver: Receiver<NotifierCommand>) {
    let mut subscribers = Subscribers::default();
    let mut shutdown = None;

    tracing::info!("[Notifier] Started");

    while let Some(command) = receiver.recv().await {
        let mut running = subscribers.handle(command, &mut shutdown);

        // One dispatch per session per scheduler turn: collect what is queued,
        // let producers that are mid-burst run once, then collect again
        if running && !subscribers.dirty.is_empty() {
            running = subscribers.drain(&mut receiver, &mut shutdown);
            if running {
                tokio::task::yield_now().await;
                running = subscribers.drain(&mut receiver, &mut shutdown);
            }
        }

        subscribers.dispatch();

        if !running {
            break;
        }
    }

    tracing::info!("[Notifier] Stopped");
    if let Some(response) = shutdown {
        let _ = response.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, ChangeCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&count);
        let callback: ChangeCallback = Arc::new(move |_: &SessionId| {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[tokio::test]
    async fn test_burst_of_changes_is_coalesced() {
        let notifier = NotifierHandle::new(64);
        let (count, callback) = counter();
        notifier.subscribe("s1".into(), 1, callback).await.unwrap();

        for _ in 0..20 {
            notifier.changed(vec!["s1".into()]).await.unwrap();
        }
        notifier.shutdown().await.unwrap();

        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 1 && fired < 20, "fired {} times", fired);
    }

    #[tokio::test]
    async fn test_only_subscribed_sessions_notified() {
        let notifier = NotifierHandle::new(64);
        let (count, callback) = counter();
        notifier.subscribe("s1".into(), 1, callback).await.unwrap();

        notifier.changed(vec!["s2".into()]).await.unwrap();
        notifier.shutdown().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribed_callback_not_called() {
        let notifier = NotifierHandle::new(64);
        let (count, callback) = counter();
        notifier.subscribe("s1".into(), 1, callback).await.unwrap();
        notifier.unsubscribe("s1".into(), 1).await.unwrap();

        notifier.changed(vec!["s1".into()]).await.unwrap();
        notifier.shutdown().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
