//! Cross-note link tokens: `[label:offset](path)`.
//!
//! `label` is `[A-Za-z.]*`, `offset` a decimal byte offset into the target
//! file and `path` anything up to the closing parenthesis. Tokens written by
//! one version must stay readable by every other, so the format is fixed.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::types::LinkReference;

/// Text shown in place of the hidden part of a folded link.
pub const FOLD_PLACEHOLDER: &str = "]";

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([A-Za-z.]*):(\d+)\]\(([^)]+)\)$").expect("link token pattern")
});

static TOKEN_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Za-z.]*):(\d+)\]\(([^)]+)\)").expect("link token pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("not a link token: {0:?}")]
    Malformed(String),

    #[error("offset out of range in {0:?}")]
    OffsetOutOfRange(String),
}

/// Portion of a link token to collapse in the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldRegion {
    /// Stays visible: the opening bracket and the label up to its first dot.
    pub visible: Range<usize>,
    /// Replaced by [`FOLD_PLACEHOLDER`] when collapsed.
    pub hidden: Range<usize>,
    pub collapsed_by_default: bool,
}

pub fn encode(label: &str, offset: usize, path: &str) -> String {
    format!("[{label}:{offset}]({path})")
}

pub fn decode(token: &str) -> Result<LinkReference, ParseError> {
    let caps = TOKEN
        .captures(token)
        .ok_or_else(|| ParseError::Malformed(token.to_string()))?;
    let offset = caps[2]
        .parse::<usize>()
        .map_err(|_| ParseError::OffsetOutOfRange(token.to_string()))?;
    Ok(LinkReference {
        label: caps[1].to_string(),
        offset,
        target_path: caps[3].to_string(),
    })
}

pub fn is_foldable(token: &str) -> bool {
    decode(token).is_ok()
}

pub fn is_valid_label(label: &str) -> bool {
    label.chars().all(|c| c.is_ascii_alphabetic() || c == '.')
}

/// Build a reference to `offset` in `path`. The selected text becomes the
/// label when it is a valid label; otherwise the file's presentable name is
/// used, reduced to label characters.
pub fn reference(selection: Option<&str>, fallback_name: &str, offset: usize, path: &str) -> String {
    let label = match selection.map(str::trim) {
        Some(s) if !s.is_empty() && is_valid_label(s) => s.to_string(),
        _ => fallback_name
            .chars()
            .filter(|c| c.is_ascii_alphabetic() || *c == '.')
            .collect(),
    };
    encode(&label, offset, path)
}

/// A reference followed by the referenced code in a fenced block.
pub fn snippet(reference: &str, language: &str, selection: &str) -> String {
    format!("{reference}\n```{}\n{selection}\n```", language.to_lowercase())
}

/// Fold region for a token starting at byte `start` of a document, or `None`
/// if the token is not a link.
pub fn fold_region(start: usize, token: &str) -> Option<FoldRegion> {
    let link = decode(token).ok()?;
    let shown = 1 + link.label.split('.').next().unwrap_or_default().len();
    Some(FoldRegion {
        visible: start..start + shown,
        hidden: start + shown..start + token.len(),
        collapsed_by_default: true,
    })
}

/// Every well-formed link in `text`, with its byte range. Bracketed text
/// that does not parse is not a link and is skipped.
pub fn find_links(text: &str) -> Vec<(Range<usize>, LinkReference)> {
    TOKEN_IN_TEXT
        .find_iter(text)
        .filter_map(|m| decode(m.as_str()).ok().map(|link| (m.range(), link)))
        .collect()
}

/// Fold regions for every link in `text`.
pub fn fold_regions(text: &str) -> Vec<FoldRegion> {
    find_links(text)
        .into_iter()
        .filter_map(|(range, _)| fold_region(range.start, &text[range]))
        .collect()
}
