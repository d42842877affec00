use anyhow::Result;
use sbooru_contracts::records::{TagCandidate, ValidationResult};
use sbooru_contracts::tags::{is_fast_path_tag, is_weak_semantic_tag};
use tracing::{debug, error};

use crate::http::error_chain_text;
use crate::tag_index::TagIndex;

/// Candidates kept per ambiguous tag.
pub const MAX_AMBIGUOUS_CANDIDATES: usize = 5;

enum TagResolution {
    Canonical(String),
    Ambiguous(Vec<TagCandidate>),
}

/// Classifies a space-separated tag string.
///
/// Allow-listed tags never touch the index. An input made only of weak
/// descriptors (or no tags at all) is flagged `low_entropy` without any
/// remote call. Everything else is looked up one tag at a time; a failed
/// lookup keeps the tag as typed and moves on.
pub fn validate_tags(index: &dyn TagIndex, raw: &str) -> ValidationResult {
    let tags: Vec<&str> = raw.split_whitespace().collect();
    let mut result = ValidationResult {
        fast_path: true,
        ..ValidationResult::default()
    };

    if tags.iter().all(|tag| is_weak_semantic_tag(tag)) {
        debug!("low-entropy tag input: '{raw}'");
        result.low_entropy = true;
        result.fast_path = false;
        return result;
    }

    for tag in tags {
        if is_fast_path_tag(tag) {
            result.validated_tags.push(tag.to_string());
            continue;
        }
        result.fast_path = false;

        match resolve_tag(index, tag) {
            Ok(TagResolution::Canonical(name)) => result.validated_tags.push(name),
            Ok(TagResolution::Ambiguous(candidates)) => {
                debug!("ambiguous tag '{tag}': {} candidate(s)", candidates.len());
                result.ambiguous_entities.insert(tag.to_string(), candidates);
            }
            Err(err) => {
                error!(
                    "tag validation failed for '{tag}': {}",
                    error_chain_text(&err, 300)
                );
                result.validated_tags.push(tag.to_string());
            }
        }
    }

    result
}

fn resolve_tag(index: &dyn TagIndex, tag: &str) -> Result<TagResolution> {
    if let Some(found) = index.lookup_exact(tag)? {
        return Ok(TagResolution::Canonical(found.name));
    }

    let mut candidates: Vec<TagCandidate> = index
        .lookup_prefix(tag)?
        .into_iter()
        .filter(|candidate| candidate.name.is_ascii())
        .collect();
    match candidates.len() {
        0 => Ok(TagResolution::Canonical(tag.to_string())),
        1 => Ok(TagResolution::Canonical(candidates.remove(0).name)),
        _ => {
            candidates.truncate(MAX_AMBIGUOUS_CANDIDATES);
            Ok(TagResolution::Ambiguous(candidates))
        }
    }
}
