pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod fs;
pub mod index;
pub mod link;
pub mod markdown;
pub mod notify;
pub mod registry;
pub mod session;
pub mod types;
pub mod watcher;

use std::sync::Arc;

pub use crate::config::NotesConfig;
pub use crate::error::{NotesError, Result};
pub use crate::registry::NoteRegistry;
pub use crate::session::NoteSession;

use crate::fs::LocalFs;
use crate::notify::TracingNotifier;

pub fn init_tracing() {
    // Only log WARN and above in production to avoid leaking note content
    #[cfg(debug_assertions)]
    tracing_subscriber::fmt::init();
    #[cfg(not(debug_assertions))]
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();
}

/// Session over the real filesystem: registry in the state database under
/// the notes directory, an empty index, and notifications routed to the log.
pub fn open_session(config: NotesConfig) -> Result<NoteSession> {
    std::fs::create_dir_all(&config.notes_dir)?;
    let registry = NoteRegistry::open(&config.state_db_path())?;
    tracing::debug!(
        "Opened registry with {} notes from {}",
        registry.len(),
        config.state_db_path().display()
    );
    Ok(NoteSession::new(
        config,
        Arc::new(registry),
        index::shared()?,
        Arc::new(LocalFs),
        Arc::new(TracingNotifier),
    ))
}
