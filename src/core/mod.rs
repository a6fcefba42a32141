//! Domain model shared by the cache, the reconcilers and the facade

pub mod clock;
pub mod event;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{MessageEvent, MessageEventKind, ResumeCursor, StreamEvent};
pub use types::{
    MessageContent, MessageEntry, MessageId, ReconcilerState, SessionEntry, SessionId,
    SessionMeta, Snapshot, StreamState,
};
