//! Live conversation transcript
//!
//! Items are kept in creation order and mutated in place by streaming deltas.
//! A delta for an item the transcript has not seen yet creates a placeholder;
//! the later `item.created` merges into it without losing accumulated text or
//! audio.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use crate::protocol::{Role, WireItem, WireItemType};

/// What an item represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    UserText,
    /// Spoken user turn; text holds the derived transcript
    UserAudio,
    Assistant,
    System,
    FunctionCall,
    FunctionCallOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Incomplete,
    Completed,
}

impl ItemStatus {
    fn from_wire(status: Option<&str>) -> Self {
        match status {
            Some("completed") => ItemStatus::Completed,
            Some("incomplete") => ItemStatus::Incomplete,
            _ => ItemStatus::InProgress,
        }
    }
}

/// One entry of the transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    pub id: String,
    pub kind: ItemKind,
    pub status: ItemStatus,
    pub text: String,
    /// PCM16 bytes of audio attributed to the item
    pub audio_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    pub fn placeholder(id: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: ItemStatus::InProgress,
            text: String::new(),
            audio_bytes: 0,
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        }
    }

    /// Convert a wire item; items without an id cannot be tracked
    pub fn from_wire(item: &WireItem) -> Option<Self> {
        let id = item.id.clone()?;

        let kind = match (item.kind, item.role) {
            (WireItemType::FunctionCall, _) => ItemKind::FunctionCall,
            (WireItemType::FunctionCallOutput, _) => ItemKind::FunctionCallOutput,
            (WireItemType::Message, Some(Role::Assistant)) => ItemKind::Assistant,
            (WireItemType::Message, Some(Role::System)) => ItemKind::System,
            (WireItemType::Message, _) => {
                if item.content.iter().any(|part| part.kind == "input_audio") {
                    ItemKind::UserAudio
                } else {
                    ItemKind::UserText
                }
            }
        };

        let text: String = item
            .content
            .iter()
            .filter_map(|part| part.text.as_deref().or(part.transcript.as_deref()))
            .collect();

        Some(Self {
            id,
            kind,
            status: ItemStatus::from_wire(item.status.as_deref()),
            text,
            audio_bytes: 0,
            call_id: item.call_id.clone(),
            name: item.name.clone(),
            arguments: item.arguments.clone(),
            output: item.output.clone(),
        })
    }

    fn merge(&mut self, incoming: ConversationItem) {
        self.kind = incoming.kind;
        self.status = self.status.max(incoming.status);
        if !incoming.text.is_empty() {
            self.text = incoming.text;
        }
        self.audio_bytes = self.audio_bytes.max(incoming.audio_bytes);
        self.call_id = incoming.call_id.or(self.call_id.take());
        self.name = incoming.name.or(self.name.take());
        self.arguments = incoming.arguments.or(self.arguments.take());
        self.output = incoming.output.or(self.output.take());
    }
}

/// Ordered, id-addressable list of conversation items
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    items: Vec<ConversationItem>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ConversationItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn get_or_insert(&mut self, id: &str, kind: ItemKind) -> &mut ConversationItem {
        let index = match self.position(id) {
            Some(index) => index,
            None => {
                self.items.push(ConversationItem::placeholder(id, kind));
                self.items.len() - 1
            }
        };
        &mut self.items[index]
    }

    /// Index right after a call and the outputs already attached to it
    fn slot_after_call(&self, call_id: &str) -> Option<usize> {
        let call = self
            .items
            .iter()
            .position(|item| item.kind == ItemKind::FunctionCall && item.call_id.as_deref() == Some(call_id))?;
        let mut slot = call + 1;
        while slot < self.items.len()
            && self.items[slot].kind == ItemKind::FunctionCallOutput
            && self.items[slot].call_id.as_deref() == Some(call_id)
        {
            slot += 1;
        }
        Some(slot)
    }

    /// Insert or merge an item by id
    pub fn upsert(&mut self, item: ConversationItem) {
        if let Some(index) = self.position(&item.id) {
            self.items[index].merge(item);
            let merged = self.items[index].clone();
            self.place_related(index, &merged);
            return;
        }

        if item.kind == ItemKind::FunctionCallOutput {
            if let Some(slot) = item.call_id.as_deref().and_then(|c| self.slot_after_call(c)) {
                self.items.insert(slot, item);
                return;
            }
        }

        self.items.push(item);
        let index = self.items.len() - 1;
        let inserted = self.items[index].clone();
        self.place_related(index, &inserted);
    }

    /// Keep function-call outputs directly behind their call
    fn place_related(&mut self, index: usize, item: &ConversationItem) {
        let Some(call_id) = item.call_id.as_deref() else {
            return;
        };

        match item.kind {
            ItemKind::FunctionCall => {
                let orphans: Vec<usize> = self.items[..index]
                    .iter()
                    .enumerate()
                    .filter(|(_, other)| {
                        other.kind == ItemKind::FunctionCallOutput && other.call_id.as_deref() == Some(call_id)
                    })
                    .map(|(i, _)| i)
                    .collect();
                // Remove back to front so earlier indices stay valid
                let mut moved: Vec<ConversationItem> =
                    orphans.iter().rev().map(|&i| self.items.remove(i)).collect();
                moved.reverse();
                if let Some(slot) = self.slot_after_call(call_id) {
                    for (offset, output) in moved.into_iter().enumerate() {
                        self.items.insert(slot + offset, output);
                    }
                }
            }
            ItemKind::FunctionCallOutput => {
                let Some(call) = self.items.iter().position(|other| {
                    other.kind == ItemKind::FunctionCall && other.call_id.as_deref() == Some(call_id)
                }) else {
                    return;
                };
                if call > index {
                    let output = self.items.remove(index);
                    // The call shifted down by one after the removal
                    let slot = self.slot_after_call(call_id).unwrap_or(call);
                    self.items.insert(slot, output);
                }
            }
            _ => {}
        }
    }

    /// Append streamed text; creates a placeholder of `kind` if needed
    pub fn append_text(&mut self, id: &str, delta: &str, kind: ItemKind) {
        self.get_or_insert(id, kind).text.push_str(delta);
    }

    /// Replace the text with a finished transcript
    pub fn set_text(&mut self, id: &str, text: &str, kind: ItemKind) {
        let item = self.get_or_insert(id, kind);
        item.text = text.to_string();
    }

    /// Account for a decoded audio delta
    pub fn add_audio(&mut self, id: &str, bytes: usize) {
        self.get_or_insert(id, ItemKind::Assistant).audio_bytes += bytes;
    }

    /// Cut the item's audio down to what was actually heard
    pub fn truncate_audio(&mut self, id: &str, bytes: usize) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.audio_bytes = item.audio_bytes.min(bytes);
                item.status = item.status.max(ItemStatus::Incomplete);
                true
            }
            None => false,
        }
    }

    pub fn complete(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.status = ItemStatus::Completed;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ConversationItem> {
        let index = self.position(id)?;
        Some(self.items.remove(index))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Bounded memory of recently applied event ids
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `false` if the id was seen within the window
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, call_id: &str) -> ConversationItem {
        ConversationItem {
            call_id: Some(call_id.to_string()),
            name: Some("lookup".to_string()),
            ..ConversationItem::placeholder(id, ItemKind::FunctionCall)
        }
    }

    fn output(id: &str, call_id: &str) -> ConversationItem {
        ConversationItem {
            call_id: Some(call_id.to_string()),
            output: Some("{}".to_string()),
            ..ConversationItem::placeholder(id, ItemKind::FunctionCallOutput)
        }
    }

    fn ids(transcript: &Transcript) -> Vec<&str> {
        transcript.items().iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn test_placeholder_merges_into_created_item() {
        let mut transcript = Transcript::new();
        transcript.append_text("a1", "Hel", ItemKind::Assistant);
        transcript.append_text("a1", "lo", ItemKind::Assistant);
        transcript.add_audio("a1", 40);

        transcript.upsert(ConversationItem::placeholder("a1", ItemKind::Assistant));
        let item = transcript.get("a1").unwrap();
        assert_eq!(item.text, "Hello");
        assert_eq!(item.audio_bytes, 40);
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_status_never_regresses() {
        let mut transcript = Transcript::new();
        transcript.upsert(ConversationItem::placeholder("u1", ItemKind::UserText));
        transcript.complete("u1");
        transcript.upsert(ConversationItem::placeholder("u1", ItemKind::UserText));
        assert_eq!(transcript.get("u1").unwrap().status, ItemStatus::Completed);
    }

    #[test]
    fn test_function_output_follows_call() {
        let mut transcript = Transcript::new();
        transcript.upsert(call("c1", "call_1"));
        transcript.upsert(ConversationItem::placeholder("a1", ItemKind::Assistant));
        transcript.upsert(output("o1", "call_1"));
        assert_eq!(ids(&transcript), vec!["c1", "o1", "a1"]);
    }

    #[test]
    fn test_orphan_output_moves_behind_late_call() {
        let mut transcript = Transcript::new();
        transcript.upsert(output("o1", "call_1"));
        transcript.upsert(ConversationItem::placeholder("a1", ItemKind::Assistant));
        transcript.upsert(call("c1", "call_1"));
        assert_eq!(ids(&transcript), vec!["a1", "c1", "o1"]);
    }

    #[test]
    fn test_truncate_and_remove() {
        let mut transcript = Transcript::new();
        transcript.add_audio("a1", 100);
        assert!(transcript.truncate_audio("a1", 60));
        assert_eq!(transcript.get("a1").unwrap().audio_bytes, 60);
        assert!(!transcript.truncate_audio("missing", 0));

        assert!(transcript.remove("a1").is_some());
        assert!(transcript.remove("a1").is_none());
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_from_wire_user_audio() {
        let wire: WireItem = serde_json::from_value(serde_json::json!({
            "id": "u1",
            "type": "message",
            "role": "user",
            "status": "completed",
            "content": [{"type": "input_audio", "transcript": "hi there"}]
        }))
        .unwrap();
        let item = ConversationItem::from_wire(&wire).unwrap();
        assert_eq!(item.kind, ItemKind::UserAudio);
        assert_eq!(item.text, "hi there");
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[test]
    fn test_recent_ids_window() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        // "a" fell out of the window
        assert!(recent.insert("a"));
    }
}
