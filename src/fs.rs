use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

/// Plain filesystem access used by the registry, index and session.
/// Paths are passed as strings because note paths are registry keys.
#[async_trait]
pub trait NoteFs: Send + Sync {
    async fn read_note_content(&self, path: &str) -> io::Result<String>;

    async fn write_note_content(&self, path: &str, text: &str) -> io::Result<()>;

    async fn file_exists(&self, path: &str) -> bool;

    /// Returns `Ok(false)` if there was nothing to delete.
    async fn delete_file(&self, path: &str) -> io::Result<bool>;

    /// Regular files directly inside `dir`. A missing directory lists as empty.
    async fn list_directory(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}

/// `NoteFs` over the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl NoteFs for LocalFs {
    async fn read_note_content(&self, path: &str) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn write_note_content(&self, path: &str, text: &str) -> io::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, text).await
    }

    async fn file_exists(&self, path: &str) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn delete_file(&self, path: &str) -> io::Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_directory(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(dir).await
    }
}

/// In-memory `NoteFs`, keyed by path string. Directories are implicit.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: Mutex<BTreeMap<String, String>>,
    /// Paths whose deletion fails, for exercising error paths.
    locked: Mutex<Vec<String>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, T>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<String>,
        T: Into<String>,
    {
        let fs = Self::new();
        {
            let mut map = fs.files.lock().unwrap_or_else(|e| e.into_inner());
            for (p, t) in files {
                map.insert(p.into(), t.into());
            }
        }
        fs
    }

    /// Make `delete_file` fail for `path`.
    pub fn lock_file(&self, path: &str) {
        self.locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_string());
    }

    fn files(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl NoteFs for MemoryFs {
    async fn read_note_content(&self, path: &str) -> io::Result<String> {
        self.files()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path} not found")))
    }

    async fn write_note_content(&self, path: &str, text: &str) -> io::Result<()> {
        self.files().insert(path.to_string(), text.to_string());
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.files().contains_key(path)
    }

    async fn delete_file(&self, path: &str) -> io::Result<bool> {
        let locked = self
            .locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|p| p == path);
        if locked {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{path} is locked"),
            ));
        }
        Ok(self.files().remove(path).is_some())
    }

    async fn list_directory(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .files()
            .keys()
            .map(PathBuf::from)
            .filter(|p| p.parent() == Some(dir))
            .collect())
    }

    async fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}
