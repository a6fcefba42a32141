//! Event Source Abstraction
//!
//! Information Hiding:
//! - Transport (HTTP/SSE framing, TLS, auth) lives behind this trait
//! - Reconcilers only see an ordered, interruptible stream of events
//! - Resumption is expressed as a `ResumeCursor`, whatever the source does with it

use crate::core::{MessageEvent, MessageId, ResumeCursor, SessionId, StreamEvent};
use crate::error::SourceError;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod channel;
pub mod replay;

pub use channel::ChannelEventSource;
pub use replay::ReplayEventSource;

/// Events of one open connection; the stream ends when the connection drops
pub type EventStream = BoxStream<'static, Result<StreamEvent, SourceError>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a connection for `session_id`.
    ///
    /// Without a cursor the source delivers full history followed by
    /// `StreamEvent::BackfillComplete`; with one it continues after it.
    async fn open(
        &self,
        session_id: &SessionId,
        cursor: Option<ResumeCursor>,
    ) -> Result<EventStream, SourceError>;

    /// Authoritative snapshots (`MessageEventKind::Snapshot`) of the given messages
    async fn resync(
        &self,
        session_id: &SessionId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageEvent>, SourceError>;

    /// Release server-side resources; dropping the stream already stops delivery
    async fn close(&self, _session_id: &SessionId) {}
}
