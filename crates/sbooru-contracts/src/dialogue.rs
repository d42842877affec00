use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::records::ValidationResult;

/// Clarification prompts allowed before the best guess is forced.
pub const MAX_CLARIFICATION_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisambiguationState {
    pub attempt_count: u8,
    #[serde(default)]
    pub pending_tag: Option<String>,
    #[serde(default)]
    pub pending_candidates: Vec<String>,
}

/// What the handler should do with one validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogueStep {
    /// Ask the user to pick; do not search.
    Clarify {
        tag: String,
        candidates: Vec<String>,
        attempt: u8,
    },
    /// Input made only of generic tags; ask for detail, do not search.
    LowEntropy,
    /// Search with `tags`. `forced` lists `(ambiguous tag, chosen candidate)`
    /// pairs picked without the user's help.
    Proceed {
        tags: String,
        forced: Vec<(String, String)>,
    },
}

/// Runs one turn of the clarification dialogue.
///
/// Returns the step to take and the state to keep for the conversation
/// (`None` clears it). Ambiguity is checked before low entropy; a low-entropy
/// turn leaves the existing state untouched.
pub fn advance(
    current: Option<DisambiguationState>,
    result: &ValidationResult,
) -> (DialogueStep, Option<DisambiguationState>) {
    let attempts = current
        .as_ref()
        .map(|state| state.attempt_count)
        .unwrap_or(0);

    if let Some((tag, candidates)) = result.first_ambiguous() {
        if attempts < MAX_CLARIFICATION_ATTEMPTS {
            let names: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
            let next = DisambiguationState {
                attempt_count: attempts + 1,
                pending_tag: Some(tag.to_string()),
                pending_candidates: names.clone(),
            };
            return (
                DialogueStep::Clarify {
                    tag: tag.to_string(),
                    candidates: names,
                    attempt: next.attempt_count,
                },
                Some(next),
            );
        }
    }

    if result.low_entropy {
        return (DialogueStep::LowEntropy, current);
    }

    let mut tags = result.validated_tags.clone();
    let mut forced = Vec::new();
    if attempts >= MAX_CLARIFICATION_ATTEMPTS {
        for (tag, candidates) in &result.ambiguous_entities {
            if let Some(first) = candidates.first() {
                tags.push(first.name.clone());
                forced.push((tag.clone(), first.name.clone()));
            }
        }
    }
    (
        DialogueStep::Proceed {
            tags: tags.join(" "),
            forced,
        },
        None,
    )
}

/// Conversation id -> pending clarification.
pub trait DialogueStore: Send + Sync {
    fn load(&self, conversation_id: &str) -> Option<DisambiguationState>;
    fn save(&self, conversation_id: &str, state: &DisambiguationState) -> anyhow::Result<()>;
    fn clear(&self, conversation_id: &str) -> anyhow::Result<()>;

    fn store(
        &self,
        conversation_id: &str,
        state: Option<&DisambiguationState>,
    ) -> anyhow::Result<()> {
        match state {
            Some(state) => self.save(conversation_id, state),
            None => self.clear(conversation_id),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryDialogueStore {
    states: Mutex<HashMap<String, DisambiguationState>>,
}

impl MemoryDialogueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialogueStore for MemoryDialogueStore {
    fn load(&self, conversation_id: &str) -> Option<DisambiguationState> {
        self.states.lock().ok()?.get(conversation_id).cloned()
    }

    fn save(&self, conversation_id: &str, state: &DisambiguationState) -> anyhow::Result<()> {
        self.states
            .lock()
            .map_err(|_| anyhow!("dialogue store lock poisoned"))?
            .insert(conversation_id.to_string(), state.clone());
        Ok(())
    }

    fn clear(&self, conversation_id: &str) -> anyhow::Result<()> {
        self.states
            .lock()
            .map_err(|_| anyhow!("dialogue store lock poisoned"))?
            .remove(conversation_id);
        Ok(())
    }
}

/// JSON-file backed store. Every call re-reads the file, so stores sharing a
/// path see each other's writes. Writes replace the file by rename; there is
/// no lock between processes, so concurrent writers can lose updates.
#[derive(Debug)]
pub struct FileDialogueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDialogueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("dialogue store lock poisoned"))?;
        // A corrupt file is an error rather than an empty map, so other
        // conversations' state is never overwritten.
        let mut on_disk = if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path)
                .with_context(|| format!("failed reading {}", self.path.display()))?;
            parse_json_object(&raw)
                .with_context(|| format!("corrupt dialogue store {}", self.path.display()))?
        } else {
            Map::new()
        };
        apply(&mut on_disk);
        write_json_object(&self.path, &on_disk)
    }
}

impl DialogueStore for FileDialogueStore {
    fn load(&self, conversation_id: &str) -> Option<DisambiguationState> {
        let payload = read_json_object(&self.path)?;
        let value = payload.get(conversation_id)?.clone();
        serde_json::from_value(value).ok()
    }

    fn save(&self, conversation_id: &str, state: &DisambiguationState) -> anyhow::Result<()> {
        let snapshot = serde_json::to_value(state)?;
        self.update(|payload| {
            payload.insert(conversation_id.to_string(), snapshot);
        })
    }

    fn clear(&self, conversation_id: &str) -> anyhow::Result<()> {
        if self.load(conversation_id).is_none() {
            return Ok(());
        }
        self.update(|payload| {
            payload.remove(conversation_id);
        })
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    parse_json_object(&raw).ok()
}

fn parse_json_object(raw: &str) -> anyhow::Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, found {other}")),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    std::fs::write(
        &staging,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}
