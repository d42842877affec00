use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use sbooru_contracts::records::TagCandidate;
use serde_json::Value;
use tracing::debug;

use crate::http::{build_client, json_rows, response_json_or_error};

/// Remote lookup of canonical tag names.
pub trait TagIndex: Send + Sync {
    /// Exact match by name; `None` when the index has no such tag.
    fn lookup_exact(&self, name: &str) -> Result<Option<TagCandidate>>;
    /// Tags starting with `prefix`, most used first.
    fn lookup_prefix(&self, prefix: &str) -> Result<Vec<TagCandidate>>;
}

pub struct SafebooruTagIndex {
    api_base: String,
    http: HttpClient,
}

impl SafebooruTagIndex {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: build_client(timeout)?,
        })
    }

    fn query(&self, params: &[(&str, String)]) -> Result<Vec<TagCandidate>> {
        let mut query: Vec<(&str, String)> = vec![
            ("page", "dapi".to_string()),
            ("s", "tag".to_string()),
            ("q", "index".to_string()),
        ];
        query.extend(params.iter().cloned());
        query.push(("json", "1".to_string()));

        let response = self
            .http
            .get(&self.api_base)
            .query(&query)
            .send()
            .with_context(|| format!("tag index request failed ({})", self.api_base))?;
        let payload = response_json_or_error("tag index", response)?;
        Ok(parse_tag_rows(payload))
    }
}

impl TagIndex for SafebooruTagIndex {
    fn lookup_exact(&self, name: &str) -> Result<Option<TagCandidate>> {
        let rows = self.query(&[("name", name.to_string())])?;
        debug!("tag index exact '{name}': {} row(s)", rows.len());
        Ok(rows.into_iter().next())
    }

    fn lookup_prefix(&self, prefix: &str) -> Result<Vec<TagCandidate>> {
        let rows = self.query(&[
            ("name_pattern", format!("{prefix}*")),
            ("order", "count".to_string()),
        ])?;
        debug!("tag index prefix '{prefix}*': {} row(s)", rows.len());
        Ok(rows)
    }
}

fn parse_tag_rows(payload: Value) -> Vec<TagCandidate> {
    json_rows(payload)
        .into_iter()
        .filter_map(|row| {
            let name = row
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())?
                .to_string();
            let count = row.get("count").and_then(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
            });
            Some(TagCandidate { name, count })
        })
        .collect()
}
