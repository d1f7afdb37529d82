use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the directory under the user's home that holds note files.
pub const NOTES_DIR_NAME: &str = ".notes";

/// Environment variable that overrides the notes directory.
pub const NOTES_DIR_ENV: &str = "NOTE_CARDS_DIR";

/// Optional JSON config file inside the notes directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_NOTE_NAME: &str = "default";
pub const DEFAULT_NOTE_CONTENT: &str = "# Notes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotesConfig {
    /// Directory where `*.notes` files are discovered and created.
    pub notes_dir: PathBuf,

    /// SQLite file holding the registry. Relative paths resolve against
    /// `notes_dir`.
    pub state_db_path: PathBuf,

    /// Note file extension, without the dot.
    pub extension: String,

    /// Maximum number of autocomplete suggestions.
    pub autocomplete_limit: usize,

    /// How often the directory watcher polls, in seconds.
    pub watch_interval_secs: u64,

    /// Quiet period after a change before reconciling, in seconds.
    pub watch_debounce_secs: u64,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            notes_dir: PathBuf::from(NOTES_DIR_NAME),
            state_db_path: PathBuf::from(".state.sqlite"),
            extension: "notes".to_string(),
            autocomplete_limit: 10,
            watch_interval_secs: 2,
            watch_debounce_secs: 1,
        }
    }
}

impl NotesConfig {
    /// Config rooted at an explicit notes directory.
    pub fn for_dir(notes_dir: impl Into<PathBuf>) -> Self {
        Self {
            notes_dir: notes_dir.into(),
            ..Self::default()
        }
    }

    /// Resolve the notes directory from the environment, then merge the
    /// optional `config.json` found there.
    pub fn detect() -> Self {
        let dir = std::env::var_os(NOTES_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(NOTES_DIR_NAME)))
            .unwrap_or_else(|| PathBuf::from(NOTES_DIR_NAME));
        Self::load(&dir)
    }

    /// Read `<dir>/config.json` if present. A missing or broken file falls
    /// back to defaults; `notes_dir` always points at `dir`.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<NotesConfig>(&raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed {}: {e}", path.display());
                NotesConfig::default()
            }),
            Err(_) => NotesConfig::default(),
        };
        config.notes_dir = dir.to_path_buf();
        config
    }

    pub fn state_db_path(&self) -> PathBuf {
        if self.state_db_path.is_absolute() {
            self.state_db_path.clone()
        } else {
            self.notes_dir.join(&self.state_db_path)
        }
    }

    pub fn default_note_path(&self) -> PathBuf {
        self.note_path(DEFAULT_NOTE_NAME, 0)
    }

    /// `<dir>/<name><n>.<ext>`, with the suffix omitted for `n == 0`.
    pub fn note_path(&self, name: &str, n: usize) -> PathBuf {
        let suffix = if n > 0 { n.to_string() } else { String::new() };
        self.notes_dir
            .join(format!("{name}{suffix}.{}", self.extension))
    }

    pub fn is_note_file(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy() == self.extension.as_str())
            .unwrap_or(false)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_secs(self.watch_debounce_secs)
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        if let Ok(profile) = std::env::var("USERPROFILE") {
            return Some(PathBuf::from(profile));
        }
    }
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn note_path_appends_suffix_only_when_probing() {
        let config = NotesConfig::for_dir("/home/u/.notes");
        assert_eq!(config.note_path("todo", 0), PathBuf::from("/home/u/.notes/todo.notes"));
        assert_eq!(config.note_path("todo", 2), PathBuf::from("/home/u/.notes/todo2.notes"));
    }

    #[test]
    fn load_merges_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{"autocomplete_limit": 3}"#).unwrap();

        let config = NotesConfig::load(dir.path());
        assert_eq!(config.autocomplete_limit, 3);
        assert_eq!(config.extension, "notes");
        assert_eq!(config.notes_dir, dir.path().to_path_buf());
        assert_eq!(config.state_db_path(), dir.path().join(".state.sqlite"));
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{ nope").unwrap();

        let config = NotesConfig::load(dir.path());
        assert_eq!(config.autocomplete_limit, 10);
    }

    #[test]
    fn recognises_note_extension() {
        let config = NotesConfig::for_dir("/n");
        assert!(config.is_note_file(Path::new("/n/a.notes")));
        assert!(!config.is_note_file(Path::new("/n/a.md")));
        assert!(!config.is_note_file(Path::new("/n/notes")));
    }
}
