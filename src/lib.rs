//! chat-cache - Bounded session/message cache for chat clients
//!
//! This library keeps recently viewed chat sessions available offline and
//! reconciles them with a live event stream. Every mutable piece of state is
//! owned by an actor; the `SessionCache` facade is the only entry point UI
//! stores need.

pub mod actors;
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod persistence;
pub mod source;
pub mod utils;

pub mod api;
pub mod cli;

pub use api::{SessionCache, SessionCacheBuilder, Subscription};
pub use cache::{BudgetOverrides, CacheStats, EvictionReport, LoadReport};
pub use config::Settings;
pub use core::{
    MessageContent, MessageEntry, MessageEvent, MessageId, ReconcilerState, SessionEntry, SessionId, SessionMeta,
    Snapshot, StreamEvent,
};
pub use error::{CacheError, CacheResult, PersistenceError, SourceError};
pub use persistence::{FileSystemPersistence, InMemoryPersistence, PersistenceAdapter, SqlitePersistence};
pub use source::{ChannelEventSource, EventSource, ReplayEventSource};
