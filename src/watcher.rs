use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::NotesConfig;
use crate::fs::NoteFs;
use crate::index::{self, SharedIndex};
use crate::registry::NoteRegistry;
use crate::session::{self, NoteLocks, NoteSession};
use crate::types::ReconcileReport;

/// Everything the watcher loop needs, cloned out of the session so the loop
/// can run as one of its background tasks.
#[derive(Clone)]
pub struct WatchContext {
    pub config: NotesConfig,
    pub registry: Arc<NoteRegistry>,
    pub index: SharedIndex,
    pub fs: Arc<dyn NoteFs>,
    pub locks: NoteLocks,
}

impl WatchContext {
    pub fn from_session(session: &NoteSession) -> Self {
        Self {
            config: session.config().clone(),
            registry: session.registry().clone(),
            index: session.index().clone(),
            fs: session.fs().clone(),
            locks: session.locks().clone(),
        }
    }
}

/// Start polling the notes directory as background work of `session`.
/// Files created or deleted behind the registry's back are picked up and the
/// index follows; the loop stops when the session shuts down.
pub fn start_watcher(session: &mut NoteSession) {
    let ctx = WatchContext::from_session(session);
    session.spawn(async move {
        watch_loop(ctx).await;
    });
}

async fn snapshot(ctx: &WatchContext) -> Option<Vec<PathBuf>> {
    match ctx.fs.list_directory(&ctx.config.notes_dir).await {
        Ok(paths) => Some(
            paths
                .into_iter()
                .filter(|p| ctx.config.is_note_file(p))
                .collect(),
        ),
        Err(e) => {
            tracing::warn!("Cannot list {}: {e}", ctx.config.notes_dir.display());
            None
        }
    }
}

async fn watch_loop(ctx: WatchContext) {
    let mut last_listing: Option<Vec<PathBuf>> = None;
    let mut pending_since: Option<Instant> = None;

    loop {
        tokio::time::sleep(ctx.config.watch_interval()).await;

        let Some(current) = snapshot(&ctx).await else {
            continue;
        };

        let changed = match &last_listing {
            // first observation is the baseline, not a change
            None => false,
            Some(prev) => *prev != current,
        };
        last_listing = Some(current);

        if changed {
            // start (or restart) the debounce timer
            pending_since = Some(Instant::now());
        }

        if let Some(since) = pending_since {
            if since.elapsed() >= ctx.config.watch_debounce() {
                pending_since = None;
                if let Err(e) = sync_once(&ctx).await {
                    tracing::warn!("Directory sync failed: {e}");
                }
            }
        }
    }
}

/// Reconcile the registry with the directory and bring the index in line:
/// new files are indexed, vanished ones dropped.
pub async fn sync_once(ctx: &WatchContext) -> crate::error::Result<ReconcileReport> {
    let report = session::reconcile_directory(&ctx.config, &ctx.registry, ctx.fs.as_ref()).await?;
    for path in &report.removed {
        if let Err(e) = ctx.index.write().await.remove(index::note_id(path)) {
            tracing::warn!("Could not unindex {path}: {e}");
        }
        ctx.locks.forget(path);
    }
    for path in &report.added {
        let Some(note) = ctx.registry.get(path) else {
            continue;
        };
        let lock = ctx.locks.for_path(path);
        let _guard = lock.lock().await;
        if let Err(e) = index::rebuild_from_disk(&ctx.index, &note, ctx.fs.as_ref()).await {
            tracing::warn!("Could not index new note {path}: {e}");
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::notify::RecordingNotifier;
    use pretty_assertions::assert_eq;

    fn context(fs: Arc<MemoryFs>) -> WatchContext {
        WatchContext {
            config: NotesConfig::for_dir("/n"),
            registry: Arc::new(NoteRegistry::in_memory().unwrap()),
            index: index::shared().unwrap(),
            fs,
            locks: NoteLocks::default(),
        }
    }

    #[tokio::test]
    async fn sync_indexes_new_files_and_drops_deleted() {
        let fs = Arc::new(MemoryFs::with_files([("/n/a.notes", "apples"), ("/n/b.notes", "bananas")]));
        let ctx = context(fs.clone());

        let report = sync_once(&ctx).await.unwrap();
        assert_eq!(report.added.len(), 2);
        assert_eq!(ctx.index.read().await.len(), 2);
        assert_eq!(ctx.locks.len(), 2);

        fs.delete_file("/n/a.notes").await.unwrap();
        fs.write_note_content("/n/c.notes", "cherries").await.unwrap();
        let report = sync_once(&ctx).await.unwrap();

        assert_eq!(report.added, vec!["/n/c.notes".to_string()]);
        assert_eq!(report.removed, vec!["/n/a.notes".to_string()]);
        assert_eq!(ctx.locks.len(), 2);
        let index = ctx.index.read().await;
        assert!(index.search("apples").is_empty());
        assert_eq!(index.search("cherries")[0].note.path, "/n/c.notes");
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_picks_up_new_files_and_stops_with_session() {
        let fs = Arc::new(MemoryFs::new());
        let mut session = NoteSession::new(
            NotesConfig::for_dir("/n"),
            Arc::new(NoteRegistry::in_memory().unwrap()),
            index::shared().unwrap(),
            fs.clone(),
            Arc::new(RecordingNotifier::new()),
        );
        start_watcher(&mut session);

        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        fs.write_note_content("/n/new.notes", "# New").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;

        assert_eq!(session.registry().len(), 1);
        assert_eq!(session.search("new").await.len(), 1);

        session.shutdown();
        session.wait_idle().await;
    }
}
