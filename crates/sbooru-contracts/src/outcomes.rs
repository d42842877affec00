use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type OutcomePayload = Map<String, Value>;

/// Structured outcome the host folds back into its planner prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub build_into_prompt: bool,
    pub prompt_display: String,
    pub done: bool,
}

impl ActionRecord {
    pub fn finished(prompt_display: impl Into<String>) -> Self {
        Self {
            build_into_prompt: true,
            prompt_display: prompt_display.into(),
            done: true,
        }
    }
}

/// Append-only JSONL log of action outcomes.
///
/// Every line carries `type`, `conversation_id` and `ts`; the caller payload
/// is merged last and may override them.
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    inner: Arc<OutcomeLogInner>,
}

#[derive(Debug)]
struct OutcomeLogInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OutcomeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(OutcomeLogInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn record(
        &self,
        event_type: &str,
        conversation_id: &str,
        payload: OutcomePayload,
    ) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "conversation_id".to_string(),
            Value::String(conversation_id.to_string()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("outcome log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    pub fn record_action(
        &self,
        conversation_id: &str,
        record: &ActionRecord,
    ) -> anyhow::Result<Value> {
        let payload = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.record("action_outcome", conversation_id, payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
