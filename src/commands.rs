use std::path::Path;

use anyhow::Context;

use crate::link;
use crate::session::NoteSession;
use crate::types::{NoteRecord, Topic};
use crate::watcher;

// ─── Command handlers ──────────────────────────────────────────────────────────

/// Registered notes in display order.
pub async fn list(session: &mut NoteSession) -> anyhow::Result<Vec<NoteRecord>> {
    Ok(session.note_cards().await)
}

pub async fn new_note(session: &mut NoteSession, name: &str) -> anyhow::Result<NoteRecord> {
    session
        .create_note(name)
        .await
        .with_context(|| format!("creating note {name:?}"))
}

pub async fn delete(session: &mut NoteSession, path: &str) -> anyhow::Result<()> {
    session.note_cards().await;
    let note = lookup(session, path);
    session.delete_note(&note).await?;
    Ok(())
}

/// Full-text search. Results are `(note, matched term, score)` ranked best
/// first.
pub async fn search(
    session: &mut NoteSession,
    query: &str,
) -> anyhow::Result<Vec<(NoteRecord, String, f64)>> {
    session.note_cards().await;
    Ok(session
        .search(query)
        .await
        .into_iter()
        .map(|hit| (hit.note, hit.matched.term, hit.matched.score))
        .collect())
}

pub async fn complete(session: &mut NoteSession, prefix: &str) -> anyhow::Result<Vec<String>> {
    session.note_cards().await;
    Ok(session.autocomplete(prefix).await)
}

pub async fn topics(session: &mut NoteSession, path: &str) -> anyhow::Result<Vec<Topic>> {
    let note = lookup(session, path);
    session.open_note(&note).await?;
    let topics = session.topics().await;
    session.wait_idle().await;
    Ok(topics)
}

/// Link token pointing at `offset` in `path`. The label falls back to the
/// note's name when none is given or it contains non-label characters.
pub fn link_to(session: &NoteSession, path: &str, offset: usize, label: Option<&str>) -> String {
    let note = lookup(session, path);
    link::reference(label, &note.display_name, offset, &note.path)
}

pub async fn resolve(session: &NoteSession, token: &str) -> anyhow::Result<(String, usize)> {
    let resolved = session.follow_link(token).await?;
    Ok((resolved.path, resolved.offset))
}

/// Toggle `color` on the note at `path`. Returns the color it ends up with.
pub fn color(session: &NoteSession, path: &str, color: &str) -> anyhow::Result<Option<String>> {
    session.set_color(&[path.to_string()], color)?;
    let note = session
        .registry()
        .get(path)
        .with_context(|| format!("{path} is not a registered note"))?;
    Ok(note.color)
}

pub async fn append(session: &mut NoteSession, path: &str, text: &str) -> anyhow::Result<()> {
    let note = lookup(session, path);
    session.open_note(&note).await?;
    session.append_text(text).await?;
    session.close_note().await;
    session.wait_idle().await;
    Ok(())
}

/// Open the note in the system editor, or the last opened note when no path
/// is given.
pub async fn open_in_editor(session: &mut NoteSession, path: Option<&str>) -> anyhow::Result<()> {
    session.note_cards().await;
    match path {
        Some(path) => {
            let note = lookup(session, path);
            session.open_note(&note).await?;
        }
        None => session.default_note().await?,
    }
    let note = session
        .current_note()
        .context("no note could be opened")?;
    session.wait_idle().await;
    tracing::info!("Opening {} in editor", note.record.path);
    open::that_detached(&note.record.path).with_context(|| format!("launching editor for {}", note.record.path))
}

/// Keep the registry and index in step with the notes directory until Ctrl-C.
pub async fn watch(session: &mut NoteSession) -> anyhow::Result<()> {
    let notes = session.note_cards().await;
    tracing::info!(
        "Watching {} ({} notes)",
        session.config().notes_dir.display(),
        notes.len()
    );
    watcher::start_watcher(session);
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    session.shutdown();
    session.wait_idle().await;
    Ok(())
}

/// Registered record for `path`, or an unregistered one named after the file.
fn lookup(session: &NoteSession, path: &str) -> NoteRecord {
    session.registry().get(path).unwrap_or_else(|| {
        let name = Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());
        NoteRecord::new(name, path)
    })
}
