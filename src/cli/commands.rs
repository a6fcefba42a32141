use clap::{Parser, Subcommand, ValueEnum};

use crate::config::PersistenceBackend;

#[derive(Parser)]
#[command(name = "chat-cache")]
#[command(author, version, about = "Inspect and maintain a persisted chat session cache", long_about = None)]
pub struct Cli {
    /// Persistence backend (overrides persistence.backend)
    #[arg(short, long, global = true, value_enum)]
    pub backend: Option<BackendArg>,

    /// Cache directory or database file (overrides persistence.path)
    #[arg(short, long, global = true)]
    pub path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum BackendArg {
    Fs,
    Sqlite,
    Memory,
}

impl From<BackendArg> for PersistenceBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Fs => PersistenceBackend::Fs,
            BackendArg::Sqlite => PersistenceBackend::Sqlite,
            BackendArg::Memory => PersistenceBackend::Memory,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List cached sessions, or print one session's messages
    Inspect {
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Feed a recorded JSON-lines event capture into a session
    Replay {
        /// File with one stream event per line
        #[arg(short, long)]
        events: String,

        #[arg(short, long)]
        session: String,
    },

    /// Remove expired sessions now
    Sweep,

    /// Drop one session, or the whole cache
    Clear {
        #[arg(short, long)]
        session: Option<String>,
    },
}
