use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

use crate::config::{NotesConfig, DEFAULT_NOTE_CONTENT};
use crate::error::{NotesError, Result};
use crate::fs::NoteFs;
use crate::index::{self, SharedIndex};
use crate::link;
use crate::markdown;
use crate::notify::Notifier;
use crate::registry::NoteRegistry;
use crate::types::{
    LinkReference, LoadedNote, NoteAction, NoteRecord, ReconcileReport, ResolvedLink, SearchHit,
    Severity, Topic, ViewState,
};

/// Capacity of the action channel. Slow subscribers that fall further behind
/// than this see `RecvError::Lagged`.
const ACTION_BUFFER: usize = 64;

/// Per-note async locks so a content write and an index rebuild read of the
/// same note never interleave.
#[derive(Clone, Default)]
pub struct NoteLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl NoteLocks {
    /// The lock guarding `path`, created on first use.
    pub fn for_path(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.map()
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock of a note that no longer exists. Holders of the lock
    /// keep their handle; the next `for_path` starts a fresh one.
    pub fn forget(&self, path: &str) {
        self.map().remove(path);
    }

    /// Number of paths with a lock.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Navigation state of one notes view: which screen is shown, which note is
/// open, the back stack, and the one-shot action channel for the view.
///
/// All methods take `&mut self`, so transitions are applied in call order by
/// a single owner. Background work (title refreshes, index rebuilds, the
/// directory watcher) runs in a `JoinSet` owned by the session and is
/// aborted as a whole by [`NoteSession::shutdown`] or on drop.
pub struct NoteSession {
    config: NotesConfig,
    registry: Arc<NoteRegistry>,
    index: SharedIndex,
    fs: Arc<dyn NoteFs>,
    notifier: Arc<dyn Notifier>,
    state_tx: watch::Sender<ViewState>,
    note_tx: Arc<watch::Sender<Option<LoadedNote>>>,
    actions_tx: broadcast::Sender<NoteAction>,
    history: Vec<ViewState>,
    locks: NoteLocks,
    tasks: JoinSet<()>,
}

impl NoteSession {
    /// Session showing the note list, with nothing open.
    pub fn new(
        config: NotesConfig,
        registry: Arc<NoteRegistry>,
        index: SharedIndex,
        fs: Arc<dyn NoteFs>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ViewState::Loading);
        let (note_tx, _) = watch::channel(None);
        let (actions_tx, _) = broadcast::channel(ACTION_BUFFER);
        Self {
            config,
            registry,
            index,
            fs,
            notifier,
            state_tx,
            note_tx: Arc::new(note_tx),
            actions_tx,
            history: Vec::new(),
            locks: NoteLocks::default(),
            tasks: JoinSet::new(),
        }
    }

    /// Settings the session was started with.
    pub fn config(&self) -> &NotesConfig {
        &self.config
    }

    /// The note list shared with background work.
    pub fn registry(&self) -> &Arc<NoteRegistry> {
        &self.registry
    }

    /// The full-text index shared with background work.
    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Filesystem every note read and write goes through.
    pub fn fs(&self) -> &Arc<dyn NoteFs> {
        &self.fs
    }

    /// Per-note locks; hold one while reading or writing that note.
    pub fn locks(&self) -> &NoteLocks {
        &self.locks
    }

    // ── streams ─────────────────────────────────────────────────────────

    /// Live view state. A new receiver sees the current state at once.
    pub fn subscribe_state(&self) -> watch::Receiver<ViewState> {
        self.state_tx.subscribe()
    }

    /// Live open note, including title changes made in the background.
    pub fn subscribe_current_note(&self) -> watch::Receiver<Option<LoadedNote>> {
        self.note_tx.subscribe()
    }

    /// Actions emitted after this call. Nothing is replayed.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<NoteAction> {
        self.actions_tx.subscribe()
    }

    /// Screen currently shown.
    pub fn state(&self) -> ViewState {
        *self.state_tx.borrow()
    }

    /// Back stack, oldest first.
    pub fn history(&self) -> &[ViewState] {
        &self.history
    }

    /// Note open in the view, if any. Stays set after leaving `NoteOpen`.
    pub fn current_note(&self) -> Option<LoadedNote> {
        self.note_tx.borrow().clone()
    }

    // ── transitions ─────────────────────────────────────────────────────

    fn goto(&mut self, state: ViewState) {
        if state == ViewState::ListView {
            self.history.clear();
        } else {
            let current = self.state();
            if current != ViewState::Loading {
                self.history.push(current);
            }
        }
        tracing::debug!("View {:?} -> {:?}", self.state(), state);
        self.state_tx.send_replace(state);
    }

    /// Show the note list. Clears the back stack.
    pub fn goto_list(&mut self) {
        self.goto(ViewState::ListView);
    }

    /// Show the search screen on top of the current one.
    pub fn goto_search(&mut self) {
        self.goto(ViewState::SearchView);
    }

    /// Leave the current screen. Leaving an open note schedules a rebuild of
    /// its index entry and a title refresh without waiting for either.
    pub fn back(&mut self) {
        if self.state() == ViewState::NoteOpen {
            if let Some(note) = self.current_note() {
                self.schedule_leave(note.record);
            }
        }
        let previous = self.history.pop().unwrap_or(ViewState::ListView);
        tracing::debug!("Back {:?} -> {:?}", self.state(), previous);
        self.state_tx.send_replace(previous);
    }

    /// Close the open note: reindex it and refresh its title, then show the
    /// list.
    pub async fn close_note(&mut self) {
        if let Some(note) = self.current_note() {
            leave_note(
                &self.registry,
                &self.index,
                self.fs.as_ref(),
                &self.note_tx,
                &self.locks,
                note.record,
            )
            .await;
        }
        self.goto_list();
    }

    /// Load `note` and show it, replacing any open note.
    pub async fn open_note(&mut self, note: &NoteRecord) -> Result<()> {
        let content = {
            let lock = self.locks.for_path(&note.path);
            let _guard = lock.lock().await;
            self.fs.read_note_content(&note.path).await
        };
        let content = match content {
            Ok(c) => c,
            Err(e) => {
                self.notifier.notify_user(
                    "Failed to open file",
                    &format!("Could not open {}: {e}", note.display_name),
                    Severity::Error,
                );
                return Err(NotesError::NotFound(note.path.clone()));
            }
        };

        self.note_tx.send_replace(Some(LoadedNote {
            record: note.clone(),
            content,
        }));
        self.goto(ViewState::NoteOpen);

        if let Err(e) = self.registry.set_last_opened(note) {
            self.report_persistence(&e);
        }
        self.schedule_title_refresh(note.path.clone());
        Ok(())
    }

    /// Open `note` and ask the view to highlight `keyword` in it.
    pub async fn open_note_and_find(&mut self, note: &NoteRecord, keyword: &str) -> Result<()> {
        self.open_note(note).await?;
        self.emit(NoteAction::FindKeyword(keyword.to_string()));
        Ok(())
    }

    /// Startup: open the last opened note if it still exists, else the first
    /// registered note that exists, else a freshly seeded default note.
    pub async fn default_note(&mut self) -> Result<()> {
        let note = match self.pick_existing_note().await {
            Some(note) => note,
            None => self.seed_default_note().await?,
        };
        self.open_note(&note).await
    }

    async fn pick_existing_note(&self) -> Option<NoteRecord> {
        if let Some(path) = self.registry.last_opened() {
            if self.fs.file_exists(&path).await {
                return Some(
                    self.registry
                        .get(&path)
                        .unwrap_or_else(|| NoteRecord::new(file_name(&path), path.clone())),
                );
            }
        }
        for note in self.registry.list() {
            if self.fs.file_exists(&note.path).await {
                return Some(note);
            }
        }
        None
    }

    async fn seed_default_note(&mut self) -> Result<NoteRecord> {
        let path = self.config.default_note_path();
        let path = path.to_string_lossy().to_string();
        self.fs.create_dir_all(&self.config.notes_dir).await?;
        if !self.fs.file_exists(&path).await {
            tracing::info!("Seeding {path}");
            self.fs.write_note_content(&path, DEFAULT_NOTE_CONTENT).await?;
        }
        let note = NoteRecord::new(file_name(&path), path);
        if let Err(e) = self
            .registry
            .add(note.clone())
            .and_then(|_| self.registry.set_last_opened(&note))
        {
            self.report_persistence(&e);
        }
        Ok(note)
    }

    // ── actions ─────────────────────────────────────────────────────────

    fn emit(&self, action: NoteAction) {
        if self.actions_tx.send(action).is_err() {
            tracing::debug!("No view attached, action dropped");
        }
    }

    fn ensure_note_open(&mut self) {
        if self.state() != ViewState::NoteOpen {
            self.goto(ViewState::NoteOpen);
        }
    }

    /// Scroll the open note to its end.
    pub fn scroll_to_end(&mut self) {
        self.ensure_note_open();
        self.emit(NoteAction::ScrollToEnd);
    }

    /// Scroll the open note to `topic`'s heading.
    pub fn scroll_to_topic(&mut self, topic: Topic) {
        self.ensure_note_open();
        self.emit(NoteAction::ScrollToTopic(topic));
    }

    /// Ask the view to insert `text` where the caret is.
    pub fn insert_text_at_caret(&mut self, text: &str) {
        self.ensure_note_open();
        self.emit(NoteAction::InsertText(text.to_string()));
    }

    /// Ask the view to fold link tokens again.
    pub fn refold_links(&self) {
        self.emit(NoteAction::RefoldLinks);
    }

    pub fn request_focus(&self) {
        self.emit(NoteAction::RequestFocus);
    }

    // ── note content ────────────────────────────────────────────────────

    /// Append `text` as a new paragraph at the end of the open note, then
    /// scroll the view to it.
    pub async fn append_text(&mut self, text: &str) -> Result<()> {
        let note = self
            .current_note()
            .ok_or_else(|| NotesError::NotFound("no open note".to_string()))?;
        let path = note.record.path.clone();
        let written: std::io::Result<String> = {
            let lock = self.locks.for_path(&path);
            let _guard = lock.lock().await;
            async {
                let current = self.fs.read_note_content(&path).await?;
                let updated = format!("{current}\n\n{text}");
                self.fs.write_note_content(&path, &updated).await?;
                Ok::<_, std::io::Error>(updated)
            }
            .await
        };
        match written {
            Ok(updated) => {
                self.note_tx.send_modify(|n| {
                    if let Some(n) = n.as_mut().filter(|n| n.record.path == path) {
                        n.content = updated;
                    }
                });
                self.scroll_to_end();
                Ok(())
            }
            Err(e) => {
                self.notifier.notify_user(
                    "Failed to write note",
                    &format!("Could not write {}: {e}", note.record.display_name),
                    Severity::Error,
                );
                Err(NotesError::Io(e))
            }
        }
    }

    /// Headings of the open note, read from disk so edits made by the view
    /// are included.
    pub async fn topics(&self) -> Vec<Topic> {
        let Some(note) = self.current_note() else {
            return Vec::new();
        };
        let content = match self.fs.read_note_content(&note.record.path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Using loaded content for topics of {}: {e}", note.record.path);
                note.content
            }
        };
        markdown::extract_headings(&content)
    }

    /// Rename the open note after its first heading. Returns the new name.
    pub async fn update_title(&mut self) -> Result<Option<String>> {
        let Some(note) = self.current_note() else {
            return Ok(None);
        };
        let title = refresh_title(&self.registry, self.fs.as_ref(), &note.record.path).await?;
        if let Some(title) = &title {
            apply_title(&self.note_tx, &note.record.path, title);
        }
        Ok(title)
    }

    // ── registry operations ─────────────────────────────────────────────

    /// Synchronize the registry with the notes directory, bootstrap the index
    /// and return the notes to display.
    pub async fn note_cards(&mut self) -> Vec<NoteRecord> {
        match reconcile_directory(&self.config, &self.registry, self.fs.as_ref()).await {
            Ok(_) => {}
            Err(e @ NotesError::Persistence(_)) => self.report_persistence(&e),
            Err(e) => tracing::warn!("Could not list {}: {e}", self.config.notes_dir.display()),
        }
        let notes = self.registry.list();
        index::build_all(&self.index, &notes, self.fs.as_ref()).await;
        notes
    }

    /// Create `<name>.notes` in the notes directory (probing `name1`,
    /// `name2`, … on collision) with a heading, and register it.
    pub async fn create_note(&mut self, name: &str) -> Result<NoteRecord> {
        match self.create_note_file(name).await {
            Ok(note) => {
                if let Err(e) = self.registry.add(note.clone()) {
                    self.report_persistence(&e);
                }
                Ok(note)
            }
            Err(e) => {
                self.notifier
                    .notify_user("Can't create new file", &e.to_string(), Severity::Error);
                Err(e)
            }
        }
    }

    async fn create_note_file(&self, name: &str) -> Result<NoteRecord> {
        self.fs.create_dir_all(&self.config.notes_dir).await?;
        let mut n = 0;
        let mut path = self.config.note_path(name, n);
        while self.fs.file_exists(&path.to_string_lossy()).await {
            n += 1;
            path = self.config.note_path(name, n);
        }
        let path = path.to_string_lossy().to_string();
        self.fs
            .write_note_content(&path, &format!("# {name}"))
            .await?;
        tracing::info!("Created {path}");
        Ok(NoteRecord::new(file_name(&path), path))
    }

    /// Forget `note` and delete its file. The registry entry is removed even
    /// when the file cannot be deleted; that case is `DeleteFailed`.
    pub async fn delete_note(&mut self, note: &NoteRecord) -> Result<()> {
        if let Err(e) = self.registry.remove(note) {
            self.report_persistence(&e);
        }
        if let Err(e) = self.index.write().await.remove(index::note_id(&note.path)) {
            tracing::warn!("Could not unindex {}: {e}", note.path);
        }
        if self
            .current_note()
            .is_some_and(|n| n.record.same_note(note))
        {
            self.note_tx.send_replace(None);
        }

        let deleted = {
            let lock = self.locks.for_path(&note.path);
            let _guard = lock.lock().await;
            self.fs.delete_file(&note.path).await
        };
        self.locks.forget(&note.path);
        match deleted {
            Ok(_) => Ok(()),
            Err(e) => {
                self.notifier.notify_user(
                    "Failed to delete file",
                    &format!("Could not delete {}: {e}", note.display_name),
                    Severity::Error,
                );
                Err(NotesError::DeleteFailed {
                    path: note.path.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Register a note file that lives anywhere on disk. Returns whether it
    /// was new.
    pub fn add_note(&self, note: NoteRecord) -> Result<bool> {
        self.registry.add(note)
    }

    /// Persist a manual reordering of the note list.
    pub fn save_order(&self, notes: Vec<NoteRecord>) -> Result<()> {
        self.registry.set_order(notes)
    }

    /// Color-tag the selected notes; see [`NoteRegistry::toggle_color`].
    pub fn set_color(&self, paths: &[String], color: &str) -> Result<()> {
        self.registry.toggle_color(paths, color)
    }

    // ── search ──────────────────────────────────────────────────────────

    /// Full-text search over indexed notes, best match first.
    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        self.index.read().await.search(query)
    }

    /// Completions for the last word of `query`, capped by the configured
    /// limit.
    pub async fn autocomplete(&self, query: &str) -> Vec<String> {
        self.index
            .read()
            .await
            .autocomplete(query, self.config.autocomplete_limit)
    }

    // ── links ───────────────────────────────────────────────────────────

    /// Check that a link target exists and return where the view should put
    /// the caret. Resolving never registers the target.
    pub async fn resolve_link(&self, link: &LinkReference) -> Result<ResolvedLink> {
        if !self.fs.file_exists(&link.target_path).await {
            self.notifier.notify_user(
                "Can't find file",
                &format!("{} does not exist", link.target_path),
                Severity::Warning,
            );
            return Err(NotesError::NotFound(link.target_path.clone()));
        }
        Ok(ResolvedLink {
            path: link.target_path.clone(),
            offset: link.offset,
        })
    }

    /// Decode and resolve a link token. A token that does not parse is not a
    /// link and is reported as `Parse` without notifying the user.
    pub async fn follow_link(&self, token: &str) -> Result<ResolvedLink> {
        let link = link::decode(token)?;
        self.resolve_link(&link).await
    }

    // ── background work ─────────────────────────────────────────────────

    fn schedule_leave(&mut self, note: NoteRecord) {
        let registry = self.registry.clone();
        let index = self.index.clone();
        let fs = self.fs.clone();
        let note_tx = self.note_tx.clone();
        let locks = self.locks.clone();
        self.spawn(async move {
            leave_note(&registry, &index, fs.as_ref(), &note_tx, &locks, note).await;
        });
    }

    fn schedule_title_refresh(&mut self, path: String) {
        let registry = self.registry.clone();
        let fs = self.fs.clone();
        let note_tx = self.note_tx.clone();
        self.spawn(async move {
            match refresh_title(&registry, fs.as_ref(), &path).await {
                Ok(Some(title)) => apply_title(&note_tx, &path, &title),
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not refresh title of {path}: {e}"),
            }
        });
    }

    /// Run `task` as background work of this session. Finished tasks are
    /// reaped first so the set only holds work still in flight.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        while let Some(res) = self.tasks.try_join_next() {
            log_task_result(res);
        }
        self.tasks.spawn(task);
    }

    /// Background tasks spawned and not yet reaped.
    pub fn background_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for all background work scheduled so far to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(res) = self.tasks.join_next().await {
            log_task_result(res);
        }
    }

    /// Cancel every background task of this session.
    pub fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            tracing::debug!("Cancelling {} background tasks", self.tasks.len());
        }
        self.tasks.abort_all();
    }

    fn report_persistence(&self, err: &NotesError) {
        self.notifier
            .notify_user("Failed to save notes list", &err.to_string(), Severity::Warning);
    }
}

/// List the note files in the configured directory and reconcile the
/// registry with them.
pub async fn reconcile_directory(
    config: &NotesConfig,
    registry: &NoteRegistry,
    fs: &dyn NoteFs,
) -> Result<ReconcileReport> {
    let listing: Vec<String> = fs
        .list_directory(&config.notes_dir)
        .await?
        .into_iter()
        .filter(|p| config.is_note_file(p))
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    registry.reconcile_with_disk(&listing)
}

/// Rename the note at `path` after its first heading, if it has one.
pub async fn refresh_title(registry: &NoteRegistry, fs: &dyn NoteFs, path: &str) -> Result<Option<String>> {
    let content = fs
        .read_note_content(path)
        .await
        .map_err(|e| NotesError::NotFound(format!("{path}: {e}")))?;
    let Some(title) = markdown::extract_first_heading(&content) else {
        return Ok(None);
    };
    registry.rename(path, &title)?;
    Ok(Some(title))
}

/// Bring a note that was just left up to date: rename it after its first
/// heading, then reindex it under the refreshed record.
async fn leave_note(
    registry: &NoteRegistry,
    index: &SharedIndex,
    fs: &dyn NoteFs,
    note_tx: &watch::Sender<Option<LoadedNote>>,
    locks: &NoteLocks,
    note: NoteRecord,
) {
    match refresh_title(registry, fs, &note.path).await {
        Ok(Some(title)) => apply_title(note_tx, &note.path, &title),
        Ok(None) => {}
        Err(e) => tracing::warn!("Could not refresh title of {}: {e}", note.path),
    }
    let note = registry.get(&note.path).unwrap_or(note);
    let lock = locks.for_path(&note.path);
    let _guard = lock.lock().await;
    if let Err(e) = index::rebuild_from_disk(index, &note, fs).await {
        tracing::warn!("Could not reindex {}: {e}", note.path);
    }
}

/// Show `title` as the name of the open note, if it is still `path`.
fn apply_title(note_tx: &watch::Sender<Option<LoadedNote>>, path: &str, title: &str) {
    note_tx.send_if_modified(|current| match current.as_mut() {
        Some(note) if note.record.path == path && note.record.display_name != title => {
            note.record.display_name = title.to_string();
            true
        }
        _ => false,
    });
}

fn log_task_result(res: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            tracing::error!("Background task panicked: {e}");
        }
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::notify::RecordingNotifier;
    use pretty_assertions::assert_eq;

    const DIR: &str = "/home/me/.notes";

    struct Fixture {
        session: NoteSession,
        fs: Arc<MemoryFs>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let fs = Arc::new(MemoryFs::with_files(
            files.iter().map(|(p, t)| (p.to_string(), t.to_string())),
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let session = NoteSession::new(
            NotesConfig::for_dir(DIR),
            Arc::new(NoteRegistry::in_memory().unwrap()),
            index::shared().unwrap(),
            fs.clone(),
            notifier.clone(),
        );
        Fixture {
            session,
            fs,
            notifier,
        }
    }

    fn note(name: &str) -> NoteRecord {
        NoteRecord::new(format!("{name}.notes"), format!("{DIR}/{name}.notes"))
    }

    #[tokio::test]
    async fn starts_loading_and_loading_is_never_pushed() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        assert_eq!(f.session.state(), ViewState::Loading);
        f.session.open_note(&note("a")).await.unwrap();
        assert_eq!(f.session.state(), ViewState::NoteOpen);
        assert!(f.session.history().is_empty());
    }

    #[tokio::test]
    async fn open_then_back_returns_to_list() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        f.session.goto_list();
        f.session.open_note(&note("a")).await.unwrap();
        f.session.back();

        assert_eq!(f.session.state(), ViewState::ListView);
        assert!(f.session.history().is_empty());
    }

    #[tokio::test]
    async fn back_from_search_returns_to_open_note() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        f.session.goto_list();
        f.session.open_note(&note("a")).await.unwrap();
        f.session.goto_search();
        f.session.back();

        assert_eq!(f.session.state(), ViewState::NoteOpen);
        assert_eq!(f.session.current_note().unwrap().record.path, note("a").path);
        assert_eq!(f.session.history(), &[ViewState::ListView]);
    }

    #[tokio::test]
    async fn goto_list_clears_history() {
        let mut f = fixture(&[
            ("/home/me/.notes/a.notes", "# A"),
            ("/home/me/.notes/b.notes", "# B"),
        ]);
        f.session.goto_list();
        f.session.open_note(&note("a")).await.unwrap();
        f.session.goto_search();
        f.session.open_note(&note("b")).await.unwrap();
        assert_eq!(f.session.history().len(), 3);

        f.session.goto_list();
        f.session.open_note(&note("a")).await.unwrap();
        f.session.back();
        assert_eq!(f.session.state(), ViewState::ListView);
        f.session.back();
        assert_eq!(f.session.state(), ViewState::ListView);
    }

    #[tokio::test]
    async fn reopening_replaces_current_note() {
        let mut f = fixture(&[
            ("/home/me/.notes/a.notes", "# A"),
            ("/home/me/.notes/b.notes", "# B"),
        ]);
        f.session.open_note(&note("a")).await.unwrap();
        f.session.open_note(&note("b")).await.unwrap();

        assert_eq!(f.session.state(), ViewState::NoteOpen);
        assert_eq!(f.session.current_note().unwrap().content, "# B");
        assert_eq!(f.session.history(), &[ViewState::NoteOpen]);
        assert_eq!(f.session.registry().last_opened(), Some(note("b").path));
    }

    #[tokio::test]
    async fn open_missing_note_notifies_and_keeps_state() {
        let mut f = fixture(&[]);
        f.session.goto_list();
        let err = f.session.open_note(&note("ghost")).await.unwrap_err();

        assert!(matches!(err, NotesError::NotFound(_)));
        assert_eq!(f.session.state(), ViewState::ListView);
        let seen = f.notifier.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Failed to open file");
        assert_eq!(seen[0].2, Severity::Error);
    }

    #[tokio::test]
    async fn back_from_note_reindexes_it() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A\nold")]);
        let a = note("a");
        f.session.registry().add(a.clone()).unwrap();
        f.session.note_cards().await;
        f.session.goto_list();
        f.session.open_note(&a).await.unwrap();

        f.fs.write_note_content(&a.path, "# A\nfresh").await.unwrap();
        f.session.back();
        f.session.wait_idle().await;

        assert!(f.session.search("old ").await.is_empty());
        assert_eq!(f.session.search("fresh").await.len(), 1);
        assert_eq!(f.session.index().read().await.len(), 1);
    }

    #[tokio::test]
    async fn close_note_reindexes_before_showing_list() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        let a = note("a");
        f.session.open_note(&a).await.unwrap();
        f.fs.write_note_content(&a.path, "# A\nclosing").await.unwrap();

        f.session.close_note().await;
        assert_eq!(f.session.state(), ViewState::ListView);
        assert_eq!(f.session.search("closing").await.len(), 1);
    }

    #[tokio::test]
    async fn scroll_to_topic_forces_note_open_then_emits() {
        let mut f = fixture(&[]);
        let mut actions = f.session.subscribe_actions();
        let mut states = f.session.subscribe_state();
        f.session.goto_list();
        f.session.goto_search();

        let topic = Topic {
            heading_text: "Setup".into(),
            offset: 10,
        };
        f.session.scroll_to_topic(topic.clone());

        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ViewState::NoteOpen);
        assert_eq!(actions.recv().await.unwrap(), NoteAction::ScrollToTopic(topic));
        assert_eq!(f.session.history(), &[ViewState::ListView, ViewState::SearchView]);
    }

    #[tokio::test]
    async fn actions_arrive_in_order_without_replay() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        f.session.refold_links();
        let mut early = f.session.subscribe_actions();

        f.session.open_note_and_find(&note("a"), "needle").await.unwrap();
        f.session.insert_text_at_caret("[a:1](/x)");
        f.session.request_focus();
        let mut late = f.session.subscribe_actions();
        f.session.scroll_to_end();

        assert_eq!(early.recv().await.unwrap(), NoteAction::FindKeyword("needle".into()));
        assert_eq!(early.recv().await.unwrap(), NoteAction::InsertText("[a:1](/x)".into()));
        assert_eq!(early.recv().await.unwrap(), NoteAction::RequestFocus);
        assert_eq!(early.recv().await.unwrap(), NoteAction::ScrollToEnd);
        assert_eq!(late.recv().await.unwrap(), NoteAction::ScrollToEnd);
    }

    #[tokio::test]
    async fn empty_directory_seeds_default_note() {
        let mut f = fixture(&[]);
        let cards = f.session.note_cards().await;
        assert!(cards.is_empty());
        assert!(f.session.registry().is_empty());

        f.session.default_note().await.unwrap();
        let path = format!("{DIR}/default.notes");

        assert_eq!(f.fs.read_note_content(&path).await.unwrap(), "# Notes");
        assert_eq!(f.session.registry().len(), 1);
        assert_eq!(f.session.registry().last_opened(), Some(path.clone()));
        assert_eq!(f.session.state(), ViewState::NoteOpen);
        assert_eq!(f.session.current_note().unwrap().record.path, path);
    }

    #[tokio::test]
    async fn default_prefers_last_opened_then_first_existing() {
        let mut f = fixture(&[
            ("/home/me/.notes/a.notes", "# A"),
            ("/home/me/.notes/b.notes", "# B"),
        ]);
        let registry = f.session.registry().clone();
        registry.add(note("gone")).unwrap();
        registry.add(note("a")).unwrap();
        registry.add(note("b")).unwrap();

        registry.set_last_opened(&note("b")).unwrap();
        f.session.default_note().await.unwrap();
        assert_eq!(f.session.current_note().unwrap().record.path, note("b").path);

        registry.set_last_opened(&note("gone")).unwrap();
        f.session.default_note().await.unwrap();
        assert_eq!(f.session.current_note().unwrap().record.path, note("a").path);
    }

    #[tokio::test]
    async fn update_title_renames_after_first_heading() {
        let mut f = fixture(&[("/home/me/.notes/t.notes", "# My Title\nbody")]);
        let t = note("t");
        f.session.registry().add(t.clone()).unwrap();
        f.session.open_note(&t).await.unwrap();

        let title = f.session.update_title().await.unwrap();
        assert_eq!(title.as_deref(), Some("My Title"));
        assert_eq!(f.session.registry().get(&t.path).unwrap().display_name, "My Title");
        assert_eq!(f.session.current_note().unwrap().record.display_name, "My Title");
    }

    #[tokio::test]
    async fn create_note_picks_free_name() {
        let mut f = fixture(&[("/home/me/.notes/todo.notes", "# todo")]);
        let first = f.session.create_note("todo").await.unwrap();
        let second = f.session.create_note("todo").await.unwrap();

        assert_eq!(first.path, format!("{DIR}/todo1.notes"));
        assert_eq!(second.path, format!("{DIR}/todo2.notes"));
        assert_eq!(f.fs.read_note_content(&second.path).await.unwrap(), "# todo");
        assert_eq!(f.session.registry().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_record_even_when_file_is_locked() {
        let mut f = fixture(&[
            ("/home/me/.notes/a.notes", "# A"),
            ("/home/me/.notes/b.notes", "# B"),
        ]);
        f.session.note_cards().await;
        f.fs.lock_file(&note("b").path);

        f.session.delete_note(&note("a")).await.unwrap();
        assert!(!f.fs.file_exists(&note("a").path).await);

        let err = f.session.delete_note(&note("b")).await.unwrap_err();
        assert!(matches!(err, NotesError::DeleteFailed { .. }));
        assert!(f.session.registry().is_empty());
        assert_eq!(f.notifier.take()[0].0, "Failed to delete file");

        // the file is still there, so the next listing brings it back
        let cards = f.session.note_cards().await;
        assert_eq!(cards, vec![note("b")]);
    }

    #[tokio::test]
    async fn note_cards_reconciles_and_indexes() {
        let mut f = fixture(&[
            ("/home/me/.notes/a.notes", "# A\napples"),
            ("/home/me/.notes/readme.md", "# not a note"),
            ("/elsewhere/x.notes", "# X"),
        ]);
        f.session.registry().add(note("stale")).unwrap();

        let cards = f.session.note_cards().await;
        assert_eq!(cards, vec![note("a")]);
        assert_eq!(f.session.search("apples").await[0].note.path, note("a").path);
        assert_eq!(f.session.autocomplete("app").await, vec!["apples"]);
    }

    #[tokio::test]
    async fn append_text_writes_paragraph_and_scrolls() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        let mut actions = f.session.subscribe_actions();
        f.session.open_note(&note("a")).await.unwrap();
        f.session.goto_search();

        f.session.append_text("more").await.unwrap();

        assert_eq!(f.fs.read_note_content(&note("a").path).await.unwrap(), "# A\n\nmore");
        assert_eq!(f.session.current_note().unwrap().content, "# A\n\nmore");
        assert_eq!(f.session.state(), ViewState::NoteOpen);
        assert_eq!(actions.recv().await.unwrap(), NoteAction::ScrollToEnd);
    }

    #[tokio::test]
    async fn topics_come_from_current_content() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A\n## B")]);
        assert!(f.session.topics().await.is_empty());
        f.session.open_note(&note("a")).await.unwrap();
        let names: Vec<_> = f.session.topics().await.into_iter().map(|t| t.heading_text).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn follow_link_resolves_or_reports() {
        let f = fixture(&[("/src/main.rs", "fn main() {}")]);

        let resolved = f.session.follow_link("[main:3](/src/main.rs)").await.unwrap();
        assert_eq!(resolved, ResolvedLink { path: "/src/main.rs".into(), offset: 3 });
        assert!(f.session.registry().is_empty());

        let missing = f.session.follow_link("[x:1](/nope.rs)").await.unwrap_err();
        assert!(matches!(missing, NotesError::NotFound(_)));
        assert_eq!(f.notifier.take().len(), 1);

        let malformed = f.session.follow_link("[foo](bar)").await.unwrap_err();
        assert!(matches!(malformed, NotesError::Parse(_)));
        assert!(f.notifier.take().is_empty());
    }

    #[tokio::test]
    async fn leaving_note_picks_up_edited_heading() {
        let mut f = fixture(&[("/home/me/.notes/t.notes", "# Old")]);
        f.session.note_cards().await;
        f.session.goto_list();
        f.session.open_note(&note("t")).await.unwrap();
        f.session.wait_idle().await;
        assert_eq!(f.session.registry().get(&note("t").path).unwrap().display_name, "Old");

        f.fs.write_note_content(&note("t").path, "# New Title\nbody").await.unwrap();
        f.session.back();
        f.session.wait_idle().await;

        let cards = f.session.note_cards().await;
        assert_eq!(cards[0].display_name, "New Title");
        assert_eq!(f.session.current_note().unwrap().record.display_name, "New Title");
        assert_eq!(f.session.search("body").await[0].note.display_name, "New Title");
    }

    #[tokio::test]
    async fn close_note_refreshes_title() {
        let mut f = fixture(&[("/home/me/.notes/t.notes", "# First")]);
        f.session.note_cards().await;
        f.session.open_note(&note("t")).await.unwrap();
        f.fs.write_note_content(&note("t").path, "# Second").await.unwrap();

        f.session.close_note().await;
        assert_eq!(f.session.registry().get(&note("t").path).unwrap().display_name, "Second");
    }

    #[tokio::test]
    async fn background_title_refresh_reaches_open_note() {
        let mut f = fixture(&[("/home/me/.notes/t.notes", "# Heading")]);
        let mut current = f.session.subscribe_current_note();
        f.session.registry().add(note("t")).unwrap();
        f.session.open_note(&note("t")).await.unwrap();
        f.session.wait_idle().await;

        assert_eq!(f.session.current_note().unwrap().record.display_name, "Heading");
        let seen = current.borrow_and_update().clone().unwrap();
        assert_eq!(seen.record.display_name, "Heading");
    }

    #[tokio::test]
    async fn finished_background_tasks_are_reaped() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        f.session.goto_list();
        for _ in 0..50 {
            f.session.open_note(&note("a")).await.unwrap();
            f.session.back();
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }
        assert!(f.session.background_tasks() <= 2, "{} tasks kept", f.session.background_tasks());
        f.session.wait_idle().await;
        assert_eq!(f.session.background_tasks(), 0);
    }

    #[tokio::test]
    async fn delete_forgets_the_note_lock() {
        let mut f = fixture(&[("/home/me/.notes/a.notes", "# A")]);
        f.session.note_cards().await;
        f.session.open_note(&note("a")).await.unwrap();
        assert_eq!(f.session.locks().len(), 1);

        f.session.delete_note(&note("a")).await.unwrap();
        assert!(f.session.locks().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_background_work() {
        let mut f = fixture(&[]);
        f.session.spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        f.session.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), f.session.wait_idle())
            .await
            .unwrap();
    }
}
