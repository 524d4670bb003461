//! Built-in note tools: four readers and three writers.
//!
//! Notes live behind the [`NoteStore`] trait; the crate only ships an
//! in-memory store used by the CLI demo and tests.

use super::{Tool, ToolError, ToolOutput};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Note {
    pub fn new(id: &str, title: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            parent_id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    fn summary(&self) -> Value {
        json!({"noteId": self.id, "title": self.title})
    }
}

pub trait NoteStore: Send + Sync {
    fn all(&self) -> Vec<Note>;

    /// Stores `note`, replacing any note with the same id.
    fn save(&self, note: Note);

    fn get(&self, id: &str) -> Option<Note> {
        self.all().into_iter().find(|n| n.id == id)
    }

    /// Children of `parent_id`, or top-level notes when `None`.
    fn children(&self, parent_id: Option<&str>) -> Vec<Note> {
        self.all()
            .into_iter()
            .filter(|n| n.parent_id.as_deref() == parent_id)
            .collect()
    }

    /// Whether `id` sits somewhere below `ancestor_id`.
    fn is_descendant(&self, id: &str, ancestor_id: &str) -> bool {
        let mut current = self.get(id).and_then(|n| n.parent_id);
        let mut hops = 0;
        while let Some(parent) = current {
            if parent == ancestor_id {
                return true;
            }
            hops += 1;
            if hops > 1024 {
                return false;
            }
            current = self.get(&parent).and_then(|n| n.parent_id);
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct MemoryNoteStore {
    notes: RwLock<Vec<Note>>,
}

impl MemoryNoteStore {
    pub fn with_notes(notes: Vec<Note>) -> Self {
        Self {
            notes: RwLock::new(notes),
        }
    }
}

impl NoteStore for MemoryNoteStore {
    fn all(&self) -> Vec<Note> {
        self.notes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, note: Note) {
        let mut notes = self.notes.write().unwrap_or_else(PoisonError::into_inner);
        match notes.iter_mut().find(|n| n.id == note.id) {
            Some(existing) => *existing = note,
            None => notes.push(note),
        }
    }
}

fn limit_arg(args: &Map<String, Value>) -> usize {
    args.get("limit")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_LIMIT)
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{}' argument", key)))
}

fn optional_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn existing_note(store: &dyn NoteStore, id: &str, role: &str) -> Result<Note, ToolError> {
    store
        .get(id)
        .ok_or_else(|| ToolError::NotFound(format!("{} '{}'", role, id)))
}

fn search_results(query: &str, matches: Vec<Note>, limit: usize) -> ToolOutput {
    let total = matches.len();
    let results: Vec<Value> = matches.iter().take(limit).map(Note::summary).collect();
    if results.is_empty() {
        return ToolOutput::Structured(json!({
            "count": 0,
            "results": [],
            "message": format!("No notes found matching \"{}\".", query),
        }));
    }
    ToolOutput::Structured(json!({
        "count": results.len(),
        "totalFound": total,
        "results": results,
    }))
}

pub struct ListNotesTool {
    store: Arc<dyn NoteStore>,
}

impl ListNotesTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for ListNotesTool {
    fn name(&self) -> &str {
        "list_notes"
    }

    fn description(&self) -> &str {
        "List notes under a parent note, or top-level notes when no parent is given"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "parentNoteId": {
                    "type": "string",
                    "description": "ID of the parent note (default: top level)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of notes to return (default: 10)"
                }
            },
            "required": []
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let parent = args
            .get("parentNoteId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        if let Some(parent_id) = parent {
            if self.store.get(parent_id).is_none() {
                return Err(ToolError::NotFound(format!("note '{}'", parent_id)));
            }
        }

        let children = self.store.children(parent);
        let limit = limit_arg(args);
        let results: Vec<Value> = children.iter().take(limit).map(Note::summary).collect();

        Ok(ToolOutput::Structured(json!({
            "parentNoteId": parent.unwrap_or("root"),
            "count": results.len(),
            "totalFound": children.len(),
            "results": results,
        })))
    }
}

/// Case-insensitive full-text search over titles and content. A note matches
/// when it contains every word of the query.
pub struct SearchNotesTool {
    store: Arc<dyn NoteStore>,
}

impl SearchNotesTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for SearchNotesTool {
    fn name(&self) -> &str {
        "search_notes"
    }

    fn description(&self) -> &str {
        "Search notes by words in their title or content"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Words to search for"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results (default: 10)"
                }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let query = required_str(args, "query")?;
        let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();

        let matches: Vec<Note> = self
            .store
            .all()
            .into_iter()
            .filter(|note| {
                let haystack = format!("{}\n{}", note.title, note.content).to_lowercase();
                words.iter().all(|w| haystack.contains(w.as_str()))
            })
            .collect();

        Ok(search_results(query, matches, limit_arg(args)))
    }
}

/// Exact-phrase search, or attribute search with `#name` / `#name=value`.
pub struct KeywordSearchNotesTool {
    store: Arc<dyn NoteStore>,
}

impl KeywordSearchNotesTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for KeywordSearchNotesTool {
    fn name(&self) -> &str {
        "keyword_search_notes"
    }

    fn description(&self) -> &str {
        "Find notes containing an exact phrase, or with an attribute using #name or #name=value"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Exact phrase, or #attribute / #attribute=value"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results (default: 10)"
                }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let query = required_str(args, "query")?;
        let notes = self.store.all().into_iter();

        let matches: Vec<Note> = match query.strip_prefix('#') {
            Some(attr) => {
                let (name, value) = match attr.split_once('=') {
                    Some((n, v)) => (n.trim(), Some(v.trim())),
                    None => (attr.trim(), None),
                };
                notes
                    .filter(|note| match (note.attributes.get(name), value) {
                        (Some(actual), Some(expected)) => actual == expected,
                        (Some(_), None) => true,
                        (None, _) => false,
                    })
                    .collect()
            }
            None => {
                let phrase = query.to_lowercase();
                notes
                    .filter(|note| {
                        note.title.to_lowercase().contains(&phrase)
                            || note.content.to_lowercase().contains(&phrase)
                    })
                    .collect()
            }
        };

        Ok(search_results(query, matches, limit_arg(args)))
    }
}

pub struct ReadNoteTool {
    store: Arc<dyn NoteStore>,
}

impl ReadNoteTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for ReadNoteTool {
    fn name(&self) -> &str {
        "read_note"
    }

    fn description(&self) -> &str {
        "Read the full content of a note by its ID"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "noteId": {
                    "type": "string",
                    "description": "ID of the note to read"
                }
            },
            "required": ["noteId"]
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let id = required_str(args, "noteId")?;
        let note = self
            .store
            .get(id)
            .ok_or_else(|| ToolError::NotFound(format!("note '{}'", id)))?;
        Ok(ToolOutput::Text(format!("# {}\n\n{}", note.title, note.content)))
    }
}

/// Labels given as `[{"name": "#tag", "value": "x"}]`. A leading `#` or `~`
/// is dropped from the name; entries without a name are skipped.
fn attribute_args(args: &Map<String, Value>) -> Result<Vec<(String, String)>, ToolError> {
    let Some(value) = args.get("attributes") else {
        return Ok(vec![]);
    };
    let items = value
        .as_array()
        .ok_or_else(|| ToolError::InvalidArguments("'attributes' must be an array".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(Value::as_str)?.trim();
            let name = name.trim_start_matches(['#', '~']);
            if name.is_empty() {
                return None;
            }
            let value = item.get("value").and_then(Value::as_str).unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect())
}

pub struct CreateNoteTool {
    store: Arc<dyn NoteStore>,
}

impl CreateNoteTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for CreateNoteTool {
    fn name(&self) -> &str {
        "create_note"
    }

    fn description(&self) -> &str {
        "Create a new note with a title, content and optional labels, under a parent note or at the top level"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "parentNoteId": {
                    "type": "string",
                    "description": "ID of the parent note (default: top level)"
                },
                "title": {
                    "type": "string",
                    "description": "Title of the new note"
                },
                "content": {
                    "type": "string",
                    "description": "Content of the new note"
                },
                "attributes": {
                    "type": "array",
                    "description": "Labels to set, e.g. [{\"name\": \"#todo\"}, {\"name\": \"priority\", \"value\": \"high\"}]",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "value": {"type": "string"}
                        },
                        "required": ["name"]
                    }
                }
            },
            "required": ["title", "content"]
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let title = required_str(args, "title")?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("missing 'content' argument".to_string()))?;
        let parent = optional_str(args, "parentNoteId");
        if let Some(parent_id) = parent {
            existing_note(self.store.as_ref(), parent_id, "parent note")?;
        }

        let id: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        let mut note = Note::new(&id, title, content);
        note.parent_id = parent.map(str::to_string);
        for (name, value) in attribute_args(args)? {
            note.attributes.insert(name, value);
        }
        self.store.save(note);
        info!(note = %id, parent = parent.unwrap_or("root"), "created note");

        Ok(ToolOutput::Structured(json!({
            "success": true,
            "noteId": id,
            "title": title,
            "message": format!("Note \"{}\" created successfully", title),
        })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    Replace,
    Append,
    Prepend,
}

impl UpdateMode {
    fn parse(value: Option<&str>) -> Result<Self, ToolError> {
        match value.map(str::to_ascii_lowercase).as_deref() {
            None | Some("replace") => Ok(UpdateMode::Replace),
            Some("append") => Ok(UpdateMode::Append),
            Some("prepend") => Ok(UpdateMode::Prepend),
            Some(other) => Err(ToolError::InvalidArguments(format!(
                "unknown mode '{}', expected replace, append or prepend",
                other
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            UpdateMode::Replace => "replace",
            UpdateMode::Append => "append",
            UpdateMode::Prepend => "prepend",
        }
    }
}

pub struct UpdateNoteTool {
    store: Arc<dyn NoteStore>,
}

impl UpdateNoteTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for UpdateNoteTool {
    fn name(&self) -> &str {
        "update_note"
    }

    fn description(&self) -> &str {
        "Update the title or content of an existing note"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "noteId": {
                    "type": "string",
                    "description": "ID of the note to update"
                },
                "title": {
                    "type": "string",
                    "description": "New title for the note"
                },
                "content": {
                    "type": "string",
                    "description": "New content for the note"
                },
                "mode": {
                    "type": "string",
                    "description": "How to apply content: replace (default), append or prepend",
                    "enum": ["replace", "append", "prepend"]
                }
            },
            "required": ["noteId"]
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let id = required_str(args, "noteId")?;
        let title = optional_str(args, "title");
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty());
        if title.is_none() && content.is_none() {
            return Err(ToolError::InvalidArguments(
                "At least one of title or content must be provided to update a note.".to_string(),
            ));
        }
        let mode = UpdateMode::parse(args.get("mode").and_then(Value::as_str))?;
        let mut note = existing_note(self.store.as_ref(), id, "note")?;

        let title_update = match title {
            Some(t) => {
                note.title = t.to_string();
                format!("Title updated to \"{}\"", t)
            }
            None => "No title update requested".to_string(),
        };
        let content_update = match content {
            Some(c) => {
                note.content = match mode {
                    UpdateMode::Replace => c.to_string(),
                    UpdateMode::Append => format!("{}\n\n{}", note.content, c),
                    UpdateMode::Prepend => format!("{}\n\n{}", c, note.content),
                };
                format!("Content updated successfully ({} mode)", mode.as_str())
            }
            None => "No content update requested".to_string(),
        };
        let title = note.title.clone();
        self.store.save(note);
        info!(note = %id, mode = mode.as_str(), "updated note");

        Ok(ToolOutput::Structured(json!({
            "success": true,
            "noteId": id,
            "title": title,
            "titleUpdate": title_update,
            "contentUpdate": content_update,
            "message": format!("Note \"{}\" updated successfully", title),
        })))
    }
}

pub struct MoveNoteTool {
    store: Arc<dyn NoteStore>,
}

impl MoveNoteTool {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }
}

impl Tool for MoveNoteTool {
    fn name(&self) -> &str {
        "move_note"
    }

    fn description(&self) -> &str {
        "Move a note under a different parent note"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "noteId": {
                    "type": "string",
                    "description": "ID of the note to move"
                },
                "targetParentNoteId": {
                    "type": "string",
                    "description": "ID of the destination parent note"
                }
            },
            "required": ["noteId", "targetParentNoteId"]
        })
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let id = required_str(args, "noteId")?;
        let target = required_str(args, "targetParentNoteId")?;
        let mut note = existing_note(self.store.as_ref(), id, "note")?;
        existing_note(self.store.as_ref(), target, "target parent note")?;
        if id == target || self.store.is_descendant(target, id) {
            return Err(ToolError::InvalidArguments(format!(
                "cannot move note '{}' under itself or one of its descendants",
                id
            )));
        }

        let from = note.parent_id.replace(target.to_string());
        let title = note.title.clone();
        self.store.save(note);
        info!(note = %id, to = %target, "moved note");

        Ok(ToolOutput::Structured(json!({
            "success": true,
            "noteId": id,
            "title": title,
            "fromParentNoteId": from.as_deref().unwrap_or("root"),
            "toParentNoteId": target,
            "message": format!("Moved \"{}\" to new parent {}", title, target),
        })))
    }
}
