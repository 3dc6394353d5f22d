//! Meeting record extraction from Granola tool payloads.
//!
//! The service's output format is not contractually guaranteed: the same tool
//! has been observed returning well-formed XML, tag soup, and minimal
//! attribute-only tags. Parsing therefore runs through an ordered cascade of
//! strategies, each only attempted when the previous one produced nothing,
//! and never fails — a malformed payload degrades to whatever can be
//! recovered rather than sinking the whole meetings operation.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::warn;

const UNTITLED_MEETING: &str = "Untitled Meeting";
const FALLBACK_TITLE: &str = "Meeting";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub id: String,
    pub title: String,
    pub date: String,
    pub attendees: Vec<String>,
    pub notes: String,
    /// Derived: notes if present, else private notes, else the record's
    /// trimmed inner text.
    pub content: String,
}

pub fn parse_meeting_records(text: &str) -> Vec<MeetingRecord> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let strategies: [fn(&str) -> Vec<MeetingRecord>; 3] =
        [parse_markup, parse_blocks, parse_bare_tags];
    for strategy in strategies {
        let records = strategy(text);
        if !records.is_empty() {
            return records;
        }
    }
    Vec::new()
}

/// Strategy 1: wrap the payload in a synthetic root and parse it as tag-soup
/// HTML, so unclosed tags and stray entities still yield elements.
fn parse_markup(text: &str) -> Vec<MeetingRecord> {
    let Ok(meeting_selector) = Selector::parse("meeting") else {
        warn!("meeting selector failed to compile");
        return Vec::new();
    };
    let document = Html::parse_fragment(&format!("<root>{text}</root>"));
    document
        .select(&meeting_selector)
        .map(record_from_element)
        .collect()
}

fn record_from_element(element: ElementRef<'_>) -> MeetingRecord {
    let id = attr(element, "id").unwrap_or_default();
    let title = attr(element, "title")
        .or_else(|| child_text(element, "title"))
        .unwrap_or_else(|| UNTITLED_MEETING.to_string());
    let date = attr(element, "date")
        .or_else(|| attr(element, "meeting_date"))
        .or_else(|| child_text(element, "date"))
        .unwrap_or_default();

    let notes = ["notes", "enhanced_notes", "summary", "summary_text"]
        .iter()
        .find_map(|name| child_text(element, name));
    let private_notes = child_text(element, "private_notes");
    let inner_text = element.text().collect::<String>().trim().to_string();
    let content = notes
        .clone()
        .or_else(|| private_notes.clone())
        .unwrap_or(inner_text);

    MeetingRecord {
        id,
        title,
        date,
        attendees: attendees_of(element),
        notes: notes.or(private_notes).unwrap_or_default(),
        content,
    }
}

fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn child_text(element: ElementRef<'_>, name: &str) -> Option<String> {
    let selector = Selector::parse(name).ok()?;
    element
        .select(&selector)
        .next()
        .map(|child| child.text().collect::<String>().trim().to_string())
        .filter(|value| !value.is_empty())
}

/// An `attendees` container wins over the attribute even when it is empty.
fn attendees_of(element: ElementRef<'_>) -> Vec<String> {
    if let (Ok(container_selector), Ok(item_selector)) =
        (Selector::parse("attendees"), Selector::parse("attendee"))
    {
        if let Some(container) = element.select(&container_selector).next() {
            return container
                .select(&item_selector)
                .map(|item| item.text().collect::<String>().trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
    }
    element
        .value()
        .attr("attendees")
        .map(|attrs| {
            attrs
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Strategy 2: tolerant regex over `<meeting ...>...</meeting>` blocks. The
/// whole block body becomes the notes; attendees are not recoverable here.
fn parse_blocks(text: &str) -> Vec<MeetingRecord> {
    let Ok(block) = Regex::new(r"(?is)<meeting\s+([^>]+)>(.*?)</meeting>") else {
        warn!("meeting block pattern failed to compile");
        return Vec::new();
    };
    block
        .captures_iter(text)
        .map(|captures| {
            let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let body = captures
                .get(2)
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            MeetingRecord {
                id: quoted_attr(attrs, "id").unwrap_or_default(),
                title: quoted_attr(attrs, "title").unwrap_or_else(|| FALLBACK_TITLE.to_string()),
                date: quoted_attr(attrs, "date").unwrap_or_default(),
                attendees: Vec::new(),
                notes: body.to_string(),
                content: body.to_string(),
            }
        })
        .collect()
}

/// Strategy 3: self-closing or attribute-only tags carrying at minimum an id
/// and a title. Everything else is left empty.
fn parse_bare_tags(text: &str) -> Vec<MeetingRecord> {
    let Ok(tag) = Regex::new(r#"(?i)<meeting[^>]*id="([^"]*)"[^>]*title="([^"]*)"[^>]*/?>"#)
    else {
        warn!("meeting tag pattern failed to compile");
        return Vec::new();
    };
    tag.captures_iter(text)
        .map(|captures| MeetingRecord {
            id: captures.get(1).map(|m| m.as_str()).unwrap_or_default().to_string(),
            title: captures.get(2).map(|m| m.as_str()).unwrap_or_default().to_string(),
            date: String::new(),
            attendees: Vec::new(),
            notes: String::new(),
            content: String::new(),
        })
        .collect()
}

fn quoted_attr(attrs: &str, name: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r#"{name}="([^"]*)""#)).ok()?;
    pattern
        .captures(attrs)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}
