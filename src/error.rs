use thiserror::Error;

use crate::link::ParseError;

#[derive(Debug, Error)]
pub enum NotesError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed link: {0}")]
    Parse(#[from] ParseError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("No indexed note with id {0}")]
    Index(u64),

    #[error("Search index error: {0}")]
    Search(#[from] tantivy::TantivyError),

    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed { path: String, reason: String },

    #[error("Invalid note order: {0}")]
    InvalidOrder(String),

    #[error("Invalid color {0:?}, expected #RRGGBB")]
    InvalidColor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for NotesError {
    fn from(err: rusqlite::Error) -> Self {
        NotesError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for NotesError {
    fn from(err: serde_json::Error) -> Self {
        NotesError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NotesError>;
