use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Content-maturity filter understood by the board's `rating:` meta tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    #[default]
    Safe,
    Questionable,
    Explicit,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Safe => "safe",
            Rating::Questionable => "questionable",
            Rating::Explicit => "explicit",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Rating::Safe),
            "questionable" => Ok(Rating::Questionable),
            "explicit" => Ok(Rating::Explicit),
            other => bail!("unknown rating '{other}' (expected safe, questionable or explicit)"),
        }
    }
}

/// One post from the board's search index. Read-only; never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: u64,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub sample_url: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
}

impl ImageRecord {
    /// Full-size file first, then the sample rendition.
    pub fn best_url(&self) -> Option<&str> {
        [self.file_url.as_deref(), self.sample_url.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|url| !url.is_empty())
    }
}

/// A canonical tag name returned by the tag index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCandidate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl TagCandidate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: None,
        }
    }
}

/// Outcome of pre-validating one tag string. Built per request, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub validated_tags: Vec<String>,
    /// Input tag -> up to five candidate canonical names, in encounter order.
    pub ambiguous_entities: IndexMap<String, Vec<TagCandidate>>,
    pub low_entropy: bool,
    pub fast_path: bool,
}

impl ValidationResult {
    pub fn first_ambiguous(&self) -> Option<(&str, &[TagCandidate])> {
        self.ambiguous_entities
            .first()
            .map(|(tag, candidates)| (tag.as_str(), candidates.as_slice()))
    }

    pub fn joined_tags(&self) -> String {
        self.validated_tags.join(" ")
    }
}
