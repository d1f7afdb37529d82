use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::db;
use crate::error::{NotesError, Result};
use crate::types::{NoteRecord, ReconcileReport, RegistryState};

/// Colors offered for tagging notes.
pub const PALETTE: [&str; 7] = [
    "#E81416", "#FFA500", "#FAEB36", "#79C314", "#487DE7", "#4B369D", "#70369D",
];

/// Ordered, path-deduplicated set of note records.
///
/// Every mutation is applied in memory and then written to the state
/// database before the call returns. If the write fails the in-memory change
/// is kept and `NotesError::Persistence` is returned, so the caller can warn
/// the user and carry on.
pub struct NoteRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    state: RegistryState,
    conn: Connection,
}

impl NoteRegistry {
    /// Open the registry stored in the SQLite file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = db::open_state_db(path)?;
        Self::with_connection(conn)
    }

    /// Registry backed by an in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(db::open_memory_db()?)
    }

    /// Registry over an open connection, loading any persisted state.
    pub fn with_connection(conn: Connection) -> Result<Self> {
        let state = db::load_registry_state(&conn)?;
        tracing::debug!("Loaded registry with {} notes", state.files.len());
        Ok(Self {
            inner: Mutex::new(Inner { state, conn }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to the state and persist if it reports a change.
    fn mutate<R>(&self, f: impl FnOnce(&mut RegistryState) -> Result<(R, bool)>) -> Result<R> {
        let mut inner = self.lock();
        let (out, changed) = f(&mut inner.state)?;
        if changed {
            db::save_registry_state(&inner.conn, &inner.state)?;
        }
        Ok(out)
    }

    /// Snapshot of the records in display order.
    pub fn list(&self) -> Vec<NoteRecord> {
        self.lock().state.files.clone()
    }

    /// Number of registered notes.
    pub fn len(&self) -> usize {
        self.lock().state.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record registered for `path`, if any.
    pub fn get(&self, path: &str) -> Option<NoteRecord> {
        self.lock().state.files.iter().find(|n| n.path == path).cloned()
    }

    /// Path of the note opened most recently.
    pub fn last_opened(&self) -> Option<String> {
        self.lock().state.last_opened.clone()
    }

    /// Append `note` unless a record with the same path exists. The first
    /// record added for a path wins. Returns whether it was inserted.
    pub fn add(&self, note: NoteRecord) -> Result<bool> {
        self.mutate(|state| {
            if state.files.iter().any(|n| n.same_note(&note)) {
                return Ok((false, false));
            }
            tracing::debug!("Registering note {}", note.path);
            state.files.push(note);
            Ok((true, true))
        })
    }

    /// Drop the record with `note`'s path. Removing an unknown note is a no-op.
    pub fn remove(&self, note: &NoteRecord) -> Result<bool> {
        self.remove_path(&note.path)
    }

    /// Drop the record registered for `path`. Returns whether one existed.
    pub fn remove_path(&self, path: &str) -> Result<bool> {
        self.mutate(|state| {
            let before = state.files.len();
            state.files.retain(|n| n.path != path);
            let removed = state.files.len() != before;
            Ok((removed, removed))
        })
    }

    /// Replace the ordered collection. The list may leave records out (they
    /// are dropped) but must not repeat a path or introduce an unknown one.
    pub fn set_order(&self, list: Vec<NoteRecord>) -> Result<()> {
        self.mutate(|state| {
            let known: HashSet<&str> = state.files.iter().map(|n| n.path.as_str()).collect();
            let mut seen = HashSet::new();
            for note in &list {
                if !known.contains(note.path.as_str()) {
                    return Err(NotesError::InvalidOrder(format!("unknown note {}", note.path)));
                }
                if !seen.insert(note.path.as_str()) {
                    return Err(NotesError::InvalidOrder(format!("duplicate note {}", note.path)));
                }
            }
            state.files = list;
            Ok(((), true))
        })
    }

    /// Remember `note` as the last opened note and persist.
    pub fn set_last_opened(&self, note: &NoteRecord) -> Result<()> {
        self.mutate(|state| {
            if state.last_opened.as_deref() == Some(note.path.as_str()) {
                return Ok(((), false));
            }
            state.last_opened = Some(note.path.clone());
            Ok(((), true))
        })
    }

    /// Update the display name of the note at `path`.
    pub fn rename(&self, path: &str, name: &str) -> Result<bool> {
        self.mutate(|state| match state.files.iter_mut().find(|n| n.path == path) {
            Some(note) if note.display_name != name => {
                note.display_name = name.to_string();
                Ok((true, true))
            }
            _ => Ok((false, false)),
        })
    }

    /// Set or clear the color tag of the note at `path`. Returns whether the
    /// record changed.
    pub fn set_color(&self, path: &str, color: Option<&str>) -> Result<bool> {
        let color = color.map(normalize_color).transpose()?;
        self.mutate(|state| match state.files.iter_mut().find(|n| n.path == path) {
            Some(note) if note.color != color => {
                note.color = color;
                Ok((true, true))
            }
            _ => Ok((false, false)),
        })
    }

    /// Color-tag `paths`. A single note that already has `color` is cleared
    /// instead; a multi-note selection is always set.
    pub fn toggle_color(&self, paths: &[String], color: &str) -> Result<()> {
        let color = normalize_color(color)?;
        let single = paths.len() == 1;
        self.mutate(|state| {
            let mut changed = false;
            for note in state.files.iter_mut().filter(|n| paths.contains(&n.path)) {
                let next = if single && note.color.as_deref() == Some(color.as_str()) {
                    None
                } else {
                    Some(color.clone())
                };
                changed |= note.color != next;
                note.color = next;
            }
            Ok(((), changed))
        })
    }

    /// Synchronize with the set of note files present in the notes directory:
    /// every unknown file is registered under its file name and every record
    /// whose path is not listed is dropped.
    pub fn reconcile_with_disk(&self, listing: &[String]) -> Result<ReconcileReport> {
        self.mutate(|state| {
            let mut report = ReconcileReport::default();
            for path in listing {
                if state.files.iter().any(|n| &n.path == path) {
                    continue;
                }
                let name = Path::new(path)
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.clone());
                state.files.push(NoteRecord::new(name, path.clone()));
                report.added.push(path.clone());
            }
            let present: HashSet<&String> = listing.iter().collect();
            state.files.retain(|n| {
                let keep = present.contains(&n.path);
                if !keep {
                    report.removed.push(n.path.clone());
                }
                keep
            });
            if report.has_changes() {
                tracing::info!(
                    "Reconciled notes: {} added, {} removed",
                    report.added.len(),
                    report.removed.len()
                );
            }
            let changed = report.has_changes();
            Ok((report, changed))
        })
    }
}

/// `#rgb`-style input is not accepted; `#rrggbb` in any case becomes uppercase.
pub fn normalize_color(color: &str) -> Result<String> {
    let hex = color.strip_prefix('#').unwrap_or(color);
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(format!("#{}", hex.to_ascii_uppercase()))
    } else {
        Err(NotesError::InvalidColor(color.to_string()))
    }
}
