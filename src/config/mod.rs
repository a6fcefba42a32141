mod settings;

pub use settings::{
    CacheConfig, LoggingConfig, PersistenceBackend, PersistenceConfig, Settings, StreamConfig,
    SystemConfig,
};
