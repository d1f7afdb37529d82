use pulldown_cmark::{Event, Parser, Tag, TagEnd};

use crate::types::Topic;

/// Every heading in document order, with the byte offset where its text
/// starts.
pub fn extract_headings(note_text: &str) -> Vec<Topic> {
    let mut topics = Vec::new();
    let mut current: Option<(String, Option<usize>)> = None;

    for (event, range) in Parser::new(note_text).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { .. }) => current = Some((String::new(), None)),
            Event::End(TagEnd::Heading(_)) => {
                if let Some((text, Some(offset))) = current.take() {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        topics.push(Topic {
                            heading_text: text,
                            offset,
                        });
                    }
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if let Some((text, start)) = current.as_mut() {
                    text.push_str(&t);
                    start.get_or_insert(range.start);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some((text, _)) = current.as_mut() {
                    text.push(' ');
                }
            }
            _ => {}
        }
    }
    topics
}

/// Text of the first heading, used as the note's display name.
pub fn extract_first_heading(note_text: &str) -> Option<String> {
    extract_headings(note_text)
        .into_iter()
        .next()
        .map(|t| t.heading_text)
}
