//! FIFO conversational memory and context handoff persistence.
//!
//! Memories are kept newest-first with a hard overall cap; chat exports carry
//! their own smaller sub-cap so bulk exports cannot crowd out individual
//! memories. Handoffs are the compressed transcripts produced by
//! [`crate::compress`].

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::credentials::current_epoch_ms;
use crate::core::oauth::random_urlsafe;
use crate::core::storage::KvStore;

pub const MEMORIES_KEY: &str = "notula_memories";
pub const CONTEXTS_KEY: &str = "notula_contexts";

pub const MAX_MEMORIES: usize = 50;
pub const MAX_CHAT_EXPORTS: usize = 10;
pub const MAX_CONTEXT_HANDOFFS: usize = 10;

const MAX_TITLE_LENGTH: usize = 80;
const DEFAULT_HANDOFF_TITLE: &str = "Context handoff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    User,
    Assistant,
    ChatExport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub text: String,
    pub timestamp: i64,
    pub kind: MemoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHandoff {
    pub id: String,
    pub title: String,
    pub content: String,
    pub timestamp: i64,
    pub message_count: usize,
    pub source: String,
}

fn generate_id() -> String {
    format!("{:x}{}", current_epoch_ms(), random_urlsafe(4))
}

pub struct MemoryLog {
    store: Arc<dyn KvStore>,
}

impl MemoryLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<MemoryEntry>, String> {
        Ok(self
            .store
            .get(MEMORIES_KEY)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    pub fn save(
        &self,
        text: &str,
        kind: MemoryKind,
        message_count: Option<usize>,
    ) -> Result<MemoryEntry, String> {
        let mut memories = self.list()?;
        let entry = MemoryEntry {
            id: generate_id(),
            text: text.trim().to_string(),
            timestamp: current_epoch_ms(),
            kind,
            message_count,
        };
        memories.insert(0, entry.clone());

        if kind == MemoryKind::ChatExport {
            let excess: Vec<String> = memories
                .iter()
                .filter(|memory| memory.kind == MemoryKind::ChatExport)
                .skip(MAX_CHAT_EXPORTS)
                .map(|memory| memory.id.clone())
                .collect();
            memories.retain(|memory| !excess.contains(&memory.id));
        }
        memories.truncate(MAX_MEMORIES);

        self.persist(&memories)?;
        Ok(entry)
    }

    pub fn delete(&self, memory_id: &str) -> Result<(), String> {
        let mut memories = self.list()?;
        memories.retain(|memory| memory.id != memory_id);
        self.persist(&memories)
    }

    fn persist(&self, memories: &[MemoryEntry]) -> Result<(), String> {
        let encoded = serde_json::to_string(memories).map_err(|err| err.to_string())?;
        self.store.set(MEMORIES_KEY, &encoded)
    }
}

pub struct HandoffLog {
    store: Arc<dyn KvStore>,
}

impl HandoffLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<ContextHandoff>, String> {
        Ok(self
            .store
            .get(CONTEXTS_KEY)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    pub fn save(
        &self,
        compressed_markdown: &str,
        message_count: usize,
        source: &str,
    ) -> Result<ContextHandoff, String> {
        let mut handoffs = self.list()?;
        let handoff = ContextHandoff {
            id: generate_id(),
            title: extract_project_title(compressed_markdown),
            content: compressed_markdown.to_string(),
            timestamp: current_epoch_ms(),
            message_count,
            source: source.to_string(),
        };
        handoffs.insert(0, handoff.clone());
        handoffs.truncate(MAX_CONTEXT_HANDOFFS);

        let encoded = serde_json::to_string(&handoffs).map_err(|err| err.to_string())?;
        self.store.set(CONTEXTS_KEY, &encoded)?;
        Ok(handoff)
    }

    pub fn delete(&self, handoff_id: &str) -> Result<(), String> {
        let mut handoffs = self.list()?;
        handoffs.retain(|handoff| handoff.id != handoff_id);
        let encoded = serde_json::to_string(&handoffs).map_err(|err| err.to_string())?;
        self.store.set(CONTEXTS_KEY, &encoded)
    }
}

/// Title from the handoff's `### PROJECT` section, ellipsized to fit list
/// views.
pub fn extract_project_title(markdown: &str) -> String {
    let Ok(pattern) = Regex::new(r"(?s)### PROJECT\s*\n(.+?)(?:\n###|$)") else {
        return DEFAULT_HANDOFF_TITLE.to_string();
    };
    let Some(raw) = pattern
        .captures(markdown)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim())
    else {
        return DEFAULT_HANDOFF_TITLE.to_string();
    };
    let title = raw
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim()
        .to_string();
    if title.is_empty() {
        return DEFAULT_HANDOFF_TITLE.to_string();
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        let truncated: String = title.chars().take(MAX_TITLE_LENGTH - 3).collect();
        format!("{truncated}...")
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::InMemoryStore;

    fn log() -> MemoryLog {
        MemoryLog::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn memories_are_newest_first() {
        let log = log();
        log.save("first", MemoryKind::User, None).expect("save");
        log.save("second", MemoryKind::Assistant, None).expect("save");
        let memories = log.list().expect("list");
        assert_eq!(memories.len(), 2);
        assert_eq!(memories[0].text, "second");
        assert_eq!(memories[1].text, "first");
    }

    #[test]
    fn overall_cap_evicts_the_oldest() {
        let log = log();
        for index in 0..=MAX_MEMORIES {
            log.save(&format!("memory {index}"), MemoryKind::User, None)
                .expect("save");
        }
        let memories = log.list().expect("list");
        assert_eq!(memories.len(), MAX_MEMORIES);
        assert_eq!(memories[0].text, format!("memory {MAX_MEMORIES}"));
        assert!(memories.iter().all(|memory| memory.text != "memory 0"));
    }

    #[test]
    fn chat_export_cap_spares_other_kinds() {
        let log = log();
        log.save("keep me", MemoryKind::User, None).expect("save");
        for index in 0..=MAX_CHAT_EXPORTS {
            log.save(&format!("export {index}"), MemoryKind::ChatExport, Some(4))
                .expect("save");
        }
        let memories = log.list().expect("list");
        let exports: Vec<&MemoryEntry> = memories
            .iter()
            .filter(|memory| memory.kind == MemoryKind::ChatExport)
            .collect();
        assert_eq!(exports.len(), MAX_CHAT_EXPORTS);
        assert!(exports.iter().all(|memory| memory.text != "export 0"));
        assert!(memories.iter().any(|memory| memory.text == "keep me"));
    }

    #[test]
    fn delete_removes_by_id() {
        let log = log();
        let entry = log.save("target", MemoryKind::User, None).expect("save");
        log.save("other", MemoryKind::User, None).expect("save");
        log.delete(&entry.id).expect("delete");
        let memories = log.list().expect("list");
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].text, "other");
    }

    #[test]
    fn handoffs_cap_at_ten() {
        let handoffs = HandoffLog::new(Arc::new(InMemoryStore::new()));
        for index in 0..=MAX_CONTEXT_HANDOFFS {
            handoffs
                .save(
                    &format!("## CONTEXT HANDOFF\n\n### PROJECT\nProject {index}\n"),
                    3,
                    "chatgpt",
                )
                .expect("save");
        }
        let list = handoffs.list().expect("list");
        assert_eq!(list.len(), MAX_CONTEXT_HANDOFFS);
        assert_eq!(list[0].title, format!("Project {MAX_CONTEXT_HANDOFFS}"));
    }

    #[test]
    fn project_title_is_extracted_and_unbracketed() {
        let markdown = "## CONTEXT HANDOFF\n\n### PROJECT\n[Migrating the billing service]\n\n### KEY DECISIONS\n- use stripe\n";
        assert_eq!(
            extract_project_title(markdown),
            "Migrating the billing service"
        );
    }

    #[test]
    fn long_project_title_is_ellipsized() {
        let long_title = "x".repeat(120);
        let markdown = format!("### PROJECT\n{long_title}\n### NEXT\n");
        let title = extract_project_title(&markdown);
        assert_eq!(title.chars().count(), MAX_TITLE_LENGTH);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn missing_project_section_gets_default_title() {
        assert_eq!(extract_project_title("no sections here"), "Context handoff");
    }
}
