pub mod backoff;
pub mod cache_actor;
pub mod messages;
pub mod notifier;
pub mod persistence_writer;
pub mod reconciler;
pub mod reorder;

pub use cache_actor::CacheHandle;
pub use messages::ChangeCallback;
pub use notifier::NotifierHandle;
pub use persistence_writer::{PersistenceWriterHandle, WriterConfig};
pub use reconciler::{ReconcilerConfig, ReconcilerHandle};
