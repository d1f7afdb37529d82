use serde::{Deserialize, Serialize};

/// A registered note card. Identity is the `path`; name and color are
/// presentation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    #[serde(rename = "name")]
    pub display_name: String,
    pub path: String,
    /// `#RRGGBB`, uppercase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl NoteRecord {
    pub fn new(display_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            path: path.into(),
            color: None,
        }
    }

    pub fn same_note(&self, other: &NoteRecord) -> bool {
        self.path == other.path
    }
}

/// Registry contents as they are persisted.
/// Every field defaults so older or partial records still load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub files: Vec<NoteRecord>,
    #[serde(default, rename = "last_file")]
    pub last_opened: Option<String>,
}

/// A note whose content has been read through the filesystem collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedNote {
    pub record: NoteRecord,
    pub content: String,
}

/// One document in the full-text index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: u64,
    pub path: String,
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    /// Indexed term that produced the strongest match.
    pub term: String,
    pub score: f64,
    /// Byte offset of the first occurrence of `term` in the note text.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub note: NoteRecord,
    pub matched: MatchInfo,
}

/// A heading inside a note, usable as a jump target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub heading_text: String,
    pub offset: usize,
}

/// Parsed form of a `[label:offset](path)` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReference {
    pub label: String,
    pub offset: usize,
    pub target_path: String,
}

/// Location the view layer should open after following a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLink {
    pub path: String,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewState {
    Loading,
    ListView,
    SearchView,
    NoteOpen,
}

/// One-shot commands for the view layer. Not states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteAction {
    ScrollToEnd,
    ScrollToTopic(Topic),
    FindKeyword(String),
    InsertText(String),
    RefoldLinks,
    RequestFocus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Outcome of synchronizing the registry with a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}
