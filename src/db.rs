use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::Result;
use crate::types::RegistryState;

/// Key under which the registry is stored in the state table.
pub const REGISTRY_KEY: &str = "notes";

/// Open (creating if needed) the state database at `path`.
pub fn open_state_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Volatile state database, used when no path is configured and in tests.
pub fn open_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS state (
             key   TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )?;
    Ok(())
}

pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(value)
}

pub fn put_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Load the persisted registry. An absent record is an empty registry; an
/// unreadable one is logged and treated as empty so startup never fails on it.
pub fn load_registry_state(conn: &Connection) -> Result<RegistryState> {
    let Some(raw) = get_value(conn, REGISTRY_KEY)? else {
        return Ok(RegistryState::default());
    };
    match serde_json::from_str::<RegistryState>(&raw) {
        Ok(state) => Ok(state),
        Err(e) => {
            tracing::warn!("Discarding unreadable registry record: {e}");
            Ok(RegistryState::default())
        }
    }
}

pub fn save_registry_state(conn: &Connection, state: &RegistryState) -> Result<()> {
    let raw = serde_json::to_string(state)?;
    put_value(conn, REGISTRY_KEY, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NoteRecord;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_record_is_empty_registry() {
        let conn = open_memory_db().unwrap();
        assert_eq!(load_registry_state(&conn).unwrap(), RegistryState::default());
    }

    #[test]
    fn registry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let mut state = RegistryState::default();
        state.files.push(NoteRecord::new("a", "/n/a.notes"));
        state.files.push(NoteRecord {
            color: Some("#E81416".into()),
            ..NoteRecord::new("b", "/n/b.notes")
        });
        state.last_opened = Some("/n/b.notes".into());

        {
            let conn = open_state_db(&path).unwrap();
            save_registry_state(&conn, &state).unwrap();
        }
        let conn = open_state_db(&path).unwrap();
        assert_eq!(load_registry_state(&conn).unwrap(), state);
    }

    #[test]
    fn old_records_without_color_or_last_file_load() {
        let conn = open_memory_db().unwrap();
        put_value(&conn, REGISTRY_KEY, r#"{"files":[{"name":"a","path":"/a.notes"}]}"#).unwrap();

        let state = load_registry_state(&conn).unwrap();
        assert_eq!(state.files, vec![NoteRecord::new("a", "/a.notes")]);
        assert_eq!(state.last_opened, None);
    }

    #[test]
    fn garbage_record_loads_as_empty() {
        let conn = open_memory_db().unwrap();
        put_value(&conn, REGISTRY_KEY, "not json").unwrap();
        assert_eq!(load_registry_state(&conn).unwrap(), RegistryState::default());
    }
}
