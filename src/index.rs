use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use nucleo_matcher::pattern::{AtomKind, CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Config as MatcherConfig, Matcher, Utf32Str};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, INDEXED, STORED, STRING, TEXT};
use tantivy::tokenizer::TokenStream;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term};
use tokio::sync::RwLock;

use crate::error::{NotesError, Result};
use crate::fs::NoteFs;
use crate::types::{IndexedDocument, MatchInfo, NoteRecord, SearchHit};

/// Prefix matches of the last query word count for less than whole words.
const PREFIX_WEIGHT: f32 = 0.5;

/// Upper bound on the terms a prefix expands to in one query.
const MAX_PREFIX_EXPANSIONS: usize = 64;

/// Indexing buffer of the single writer thread.
const WRITER_MEMORY: usize = 20_000_000;

/// Index shared between the session (writer) and searches (readers).
/// Rebuilds hold the write lock for the whole delete+add+commit, so a reader
/// sees either the old document or the new one.
pub type SharedIndex = Arc<RwLock<SearchIndex>>;

pub fn shared() -> Result<SharedIndex> {
    Ok(Arc::new(RwLock::new(SearchIndex::new()?)))
}

/// Stable id of a note: 64-bit FNV-1a of its path. Two paths hashing to the
/// same id shadow each other; the later insert wins.
pub fn note_id(path: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(path.as_bytes());
    hasher.finish()
}

struct Fields {
    id: Field,
    path: Field,
    name: Field,
    text: Field,
}

/// Full-text index over note contents, held in RAM.
///
/// Every mutation is committed and the reader reloaded before it returns, so
/// searches always see the latest rebuild.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    fields: Fields,
    /// Registry record for every indexed id.
    notes: HashMap<u64, NoteRecord>,
}

impl SearchIndex {
    pub fn new() -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let id = schema_builder.add_u64_field("id", INDEXED | STORED);
        let path = schema_builder.add_text_field("path", STRING | STORED);
        let name = schema_builder.add_text_field("name", STORED);
        let text = schema_builder.add_text_field("text", TEXT | STORED);
        let index = Index::create_in_ram(schema_builder.build());

        let writer = index.writer_with_num_threads(1, WRITER_MEMORY)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer,
            fields: Fields { id, path, name, text },
            notes: HashMap::new(),
        })
    }

    /// Number of notes currently in the index.
    pub fn len(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored form of the document indexed under `id`.
    pub fn document(&self, id: u64) -> Option<IndexedDocument> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(Term::from_field_u64(self.fields.id, id), IndexRecordOption::Basic);
        let (_, address) = searcher
            .search(&query, &TopDocs::with_limit(1))
            .ok()?
            .into_iter()
            .next()?;
        let doc: TantivyDocument = searcher.doc(address).ok()?;
        Some(IndexedDocument {
            id,
            path: stored_str(&doc, self.fields.path),
            name: stored_str(&doc, self.fields.name),
            text: stored_str(&doc, self.fields.text),
        })
    }

    pub fn note(&self, id: u64) -> Result<&NoteRecord> {
        self.notes.get(&id).ok_or(NotesError::Index(id))
    }

    /// Bootstrap from `(note, content)` pairs. Does nothing if anything is
    /// already indexed. Returns the number of documents inserted.
    pub fn build_from(&mut self, notes: Vec<(NoteRecord, String)>) -> Result<usize> {
        if !self.is_empty() {
            return Ok(0);
        }
        let count = notes.len();
        for (note, text) in notes {
            self.stage(note, &text)?;
        }
        self.commit()?;
        Ok(count)
    }

    /// Replace whatever is indexed for `note` with `content`.
    pub fn rebuild_one(&mut self, note: &NoteRecord, content: String) -> Result<()> {
        self.stage(note.clone(), &content)?;
        self.commit()?;
        tracing::debug!("Reindexed {}", note.path);
        Ok(())
    }

    /// Drop the document indexed under `id`. Returns whether a note was known
    /// under that id.
    pub fn remove(&mut self, id: u64) -> Result<bool> {
        let known = self.notes.remove(&id).is_some();
        self.writer.delete_term(Term::from_field_u64(self.fields.id, id));
        self.commit()?;
        Ok(known)
    }

    /// Queue delete-then-add for `note`; visible after the next commit.
    fn stage(&mut self, note: NoteRecord, text: &str) -> Result<()> {
        let id = note_id(&note.path);
        if let Some(previous) = self.notes.get(&id) {
            if previous.path != note.path {
                tracing::warn!("Note id {id} already indexed, shadowing {} with {}", previous.path, note.path);
            }
        }
        self.writer.delete_term(Term::from_field_u64(self.fields.id, id));
        self.writer.add_document(doc!(
            self.fields.id => id,
            self.fields.path => note.path.as_str(),
            self.fields.name => note.display_name.as_str(),
            self.fields.text => text,
        ))?;
        self.notes.insert(id, note);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Lowercased alphanumeric words of `text` with their byte offsets, split
    /// the way note contents are indexed.
    pub fn analyze(&self, text: &str) -> Vec<(String, usize)> {
        let mut analyzer = match self.index.tokenizer_for_field(self.fields.text) {
            Ok(analyzer) => analyzer,
            Err(e) => {
                tracing::error!("No tokenizer for note text: {e}");
                return Vec::new();
            }
        };
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            let token = stream.token();
            tokens.push((token.text.clone(), token.offset_from));
        }
        tokens
    }

    /// Indexed terms starting with `prefix`, across all segments. May include
    /// terms whose documents were deleted but not merged away yet.
    fn terms_with_prefix(&self, searcher: &Searcher, prefix: &str) -> Result<BTreeSet<String>> {
        let mut terms = BTreeSet::new();
        for segment in searcher.segment_readers() {
            let inverted = segment.inverted_index(self.fields.text)?;
            let mut stream = inverted.terms().range().ge(prefix.as_bytes()).into_stream()?;
            while stream.advance() {
                let Ok(term) = std::str::from_utf8(stream.key()) else {
                    continue;
                };
                if !term.starts_with(prefix) {
                    break;
                }
                terms.insert(term.to_string());
            }
        }
        Ok(terms)
    }

    /// Number of live documents containing `term`.
    fn doc_freq(&self, searcher: &Searcher, term: &str) -> Result<usize> {
        let query = TermQuery::new(
            Term::from_field_text(self.fields.text, term),
            IndexRecordOption::Basic,
        );
        Ok(searcher.search(&query, &Count)?)
    }

    /// Full-text search. Every query word matches whole terms; the last word
    /// also matches as a prefix, so results follow the user's typing. Results
    /// are ordered by BM25 score, then path.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        self.try_search(query).unwrap_or_else(|e| {
            tracing::warn!("Search for {query:?} failed: {e}");
            Vec::new()
        })
    }

    fn try_search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let words: Vec<String> = self.analyze(query).into_iter().map(|(w, _)| w).collect();
        if words.is_empty() || self.is_empty() {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let last_is_prefix = !query.ends_with(char::is_whitespace);

        let mut candidates: Vec<(String, f32)> = Vec::new();
        for (i, word) in words.iter().enumerate() {
            candidates.push((word.clone(), 1.0));
            if last_is_prefix && i == words.len() - 1 {
                let expansions = self
                    .terms_with_prefix(&searcher, word)?
                    .into_iter()
                    .filter(|term| term != word)
                    .take(MAX_PREFIX_EXPANSIONS);
                candidates.extend(expansions.map(|term| (term, PREFIX_WEIGHT)));
            }
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = candidates
            .iter()
            .map(|(term, weight)| {
                let term_query = TermQuery::new(
                    Term::from_field_text(self.fields.text, term),
                    IndexRecordOption::WithFreqs,
                );
                let boosted: Box<dyn Query> = Box::new(BoostQuery::new(Box::new(term_query), *weight));
                (Occur::Should, boosted)
            })
            .collect();
        let limit = (searcher.num_docs() as usize).max(1);
        let top_docs = searcher.search(&BooleanQuery::new(clauses), &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(id) = doc.get_first(self.fields.id).and_then(|v| v.as_u64()) else {
                continue;
            };
            let note = match self.note(id) {
                Ok(note) => note.clone(),
                Err(e) => {
                    tracing::error!("Dropping search result: {e}");
                    continue;
                }
            };
            let (term, offset) = self.best_match(&stored_str(&doc, self.fields.text), &candidates);
            hits.push(SearchHit {
                note,
                matched: MatchInfo {
                    term,
                    score: f64::from(score),
                    offset,
                },
            });
        }
        hits.sort_by(|a, b| {
            b.matched
                .score
                .partial_cmp(&a.matched.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.note.path.cmp(&b.note.path))
        });
        Ok(hits)
    }

    /// The query term that weighs most in `text`, with its first offset.
    fn best_match(&self, text: &str, candidates: &[(String, f32)]) -> (String, usize) {
        let mut seen: HashMap<String, (usize, usize)> = HashMap::new();
        for (token, offset) in self.analyze(text) {
            seen.entry(token)
                .and_modify(|(count, _)| *count += 1)
                .or_insert((1, offset));
        }
        candidates
            .iter()
            .filter_map(|(term, weight)| {
                seen.get(term)
                    .map(|&(count, offset)| (term, weight * (count as f32).sqrt(), offset))
            })
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.0.cmp(a.0))
            })
            .map(|(term, _, offset)| (term.clone(), offset))
            .unwrap_or_default()
    }

    /// Suggestions for the word being typed (the last word of `query`):
    /// indexed terms it prefixes, most widespread first, then fuzzy matches.
    pub fn autocomplete(&self, query: &str, limit: usize) -> Vec<String> {
        self.try_autocomplete(query, limit).unwrap_or_else(|e| {
            tracing::warn!("Autocomplete for {query:?} failed: {e}");
            Vec::new()
        })
    }

    fn try_autocomplete(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        if query.ends_with(char::is_whitespace) || self.is_empty() {
            return Ok(Vec::new());
        }
        let Some((word, _)) = self.analyze(query).pop() else {
            return Ok(Vec::new());
        };
        let searcher = self.reader.searcher();

        let mut prefixed: Vec<(String, usize)> = Vec::new();
        for term in self.terms_with_prefix(&searcher, &word)? {
            let df = self.doc_freq(&searcher, &term)?;
            if df > 0 {
                prefixed.push((term, df));
            }
        }
        prefixed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut suggestions: Vec<String> = prefixed.into_iter().take(limit).map(|(t, _)| t).collect();
        if suggestions.len() >= limit || word.chars().count() < 2 {
            return Ok(suggestions);
        }

        let pattern = Pattern::new(&word, CaseMatching::Ignore, Normalization::Smart, AtomKind::Fuzzy);
        let mut matcher = Matcher::new(MatcherConfig::DEFAULT);
        let mut buf = Vec::new();
        let mut fuzzy: Vec<(u32, String)> = Vec::new();
        for term in self.terms_with_prefix(&searcher, "")? {
            if term.starts_with(word.as_str()) {
                continue;
            }
            let Some(score) = pattern.score(Utf32Str::new(&term, &mut buf), &mut matcher) else {
                continue;
            };
            if self.doc_freq(&searcher, &term)? > 0 {
                fuzzy.push((score, term));
            }
        }
        fuzzy.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let remaining = limit - suggestions.len();
        suggestions.extend(fuzzy.into_iter().take(remaining).map(|(_, t)| t));
        Ok(suggestions)
    }
}

fn stored_str(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Read every note through `fs` and bootstrap `index` if it is empty.
/// Notes that cannot be read are skipped.
pub async fn build_all(index: &SharedIndex, notes: &[NoteRecord], fs: &dyn NoteFs) -> usize {
    if !index.read().await.is_empty() {
        return 0;
    }
    let mut contents = Vec::with_capacity(notes.len());
    for note in notes {
        match fs.read_note_content(&note.path).await {
            Ok(text) => contents.push((note.clone(), text)),
            Err(e) => tracing::warn!("Skipping unreadable note {}: {e}", note.path),
        }
    }
    match index.write().await.build_from(contents) {
        Ok(inserted) => {
            if inserted > 0 {
                tracing::info!("Indexed {inserted} notes");
            }
            inserted
        }
        Err(e) => {
            tracing::error!("Building the search index failed: {e}");
            0
        }
    }
}

/// Re-read `note` through `fs` and replace its indexed document.
pub async fn rebuild_from_disk(index: &SharedIndex, note: &NoteRecord, fs: &dyn NoteFs) -> Result<()> {
    let content = fs
        .read_note_content(&note.path)
        .await
        .map_err(|e| NotesError::NotFound(format!("{}: {e}", note.path)))?;
    index.write().await.rebuild_one(note, content)
}
