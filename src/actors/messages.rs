use crate::cache::{ApplyOutcome, BudgetOverrides, CacheStats, EvictionReport, MessageRange, PersistOp};
use crate::core::{
    MessageEntry, MessageEvent, ReconcilerState, SessionEntry, SessionId, SessionMeta, Snapshot,
};
use crate::error::CacheResult;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Callback invoked with the id of a session whose cached view changed
pub type ChangeCallback = Arc<dyn Fn(&SessionId) + Send + Sync>;

/// Requests served by the cache actor, the single owner of `CacheStore`
pub enum CacheCommand {
    GetSession {
        session_id: SessionId,
        response: oneshot::Sender<Option<SessionEntry>>,
    },
    GetMessages {
        session_id: SessionId,
        range: MessageRange,
        response: oneshot::Sender<CacheResult<Vec<MessageEntry>>>,
    },
    Snapshot {
        session_id: SessionId,
        response: oneshot::Sender<Snapshot>,
    },
    ListSessions {
        response: oneshot::Sender<Vec<SessionMeta>>,
    },
    Stats {
        response: oneshot::Sender<CacheStats>,
    },
    Touch {
        session_id: SessionId,
    },
    EnsureStub {
        session_id: SessionId,
        response: oneshot::Sender<CacheResult<bool>>,
    },
    PutSession {
        entry: SessionEntry,
        response: oneshot::Sender<CacheResult<()>>,
    },
    PutMessage {
        message: MessageEntry,
        response: oneshot::Sender<CacheResult<ApplyOutcome>>,
    },
    Attach {
        session_id: SessionId,
        response: oneshot::Sender<CacheResult<u64>>,
    },
    ApplyEvent {
        session_id: SessionId,
        generation: u64,
        event: MessageEvent,
        response: oneshot::Sender<ApplyOutcome>,
    },
    CompleteBackfill {
        session_id: SessionId,
        generation: u64,
        resume_token: Option<String>,
        response: oneshot::Sender<bool>,
    },
    SetResumeToken {
        session_id: SessionId,
        generation: u64,
        token: String,
    },
    SetStreamState {
        session_id: SessionId,
        state: ReconcilerState,
    },
    SetTitle {
        session_id: SessionId,
        title: Option<String>,
        response: oneshot::Sender<bool>,
    },
    RemoveSession {
        session_id: SessionId,
        response: oneshot::Sender<bool>,
    },
    Clear {
        response: oneshot::Sender<usize>,
    },
    SetBudgets {
        overrides: BudgetOverrides,
        response: oneshot::Sender<EvictionReport>,
    },
    Sweep {
        response: oneshot::Sender<Vec<SessionId>>,
    },
    /// Wait until every write issued so far reached the adapter (or gave up)
    Flush {
        response: oneshot::Sender<()>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

pub enum WriterCommand {
    Submit(Vec<PersistOp>),
    Flush(oneshot::Sender<()>),
    Pending(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

pub enum NotifierCommand {
    Subscribe {
        session_id: SessionId,
        subscription_id: u64,
        callback: ChangeCallback,
    },
    Unsubscribe {
        session_id: SessionId,
        subscription_id: u64,
    },
    Changed(Vec<SessionId>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub enum ReconcilerCommand {
    /// Stop; the reply is sent once no further mutations will be issued
    Close(oneshot::Sender<()>),
}
