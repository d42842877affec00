use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use sbooru_contracts::config::DEFAULT_TAGS;
use sbooru_contracts::records::{ImageRecord, Rating};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::fetch::{self, EncodedImage};
use crate::http::{build_client, error_chain_text, is_timeout, json_rows, response_json_or_error};

/// Highest `pid` sampled per search.
pub const MAX_PAGE_INDEX: u32 = 10;
pub const MAX_SEARCH_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub tags: String,
    pub limit: u32,
    pub rating: Rating,
    pub timeout: Duration,
}

/// The image board as the plugin sees it. Neither call fails: problems are
/// logged and surface as an empty list or `None`.
pub trait ImageBoard: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Vec<ImageRecord>;
    fn fetch_image(&self, url: &str) -> Option<EncodedImage>;
}

/// Commas become spaces, non-ASCII characters are dropped (the board rejects
/// non-Latin tags) and whitespace is collapsed. Falls back to `anime cute`.
pub fn normalize_search_tags(raw: &str) -> String {
    let ascii: String = raw
        .chars()
        .map(|ch| if ch == ',' { ' ' } else { ch })
        .filter(char::is_ascii)
        .collect();
    let collapsed = ascii.split_whitespace().collect::<Vec<&str>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_TAGS.to_string();
    }
    collapsed
}

pub fn search_params(request: &SearchRequest, pid: u32) -> Vec<(&'static str, String)> {
    vec![
        ("page", "dapi".to_string()),
        ("s", "post".to_string()),
        ("q", "index".to_string()),
        (
            "tags",
            format!(
                "{} rating:{}",
                normalize_search_tags(&request.tags),
                request.rating
            ),
        ),
        ("limit", request.limit.min(MAX_SEARCH_LIMIT).to_string()),
        ("pid", pid.to_string()),
        ("json", "1".to_string()),
    ]
}

/// One random page in `[0, MAX_PAGE_INDEX]`. Matches that live only on other
/// pages are missed; there is no second attempt.
pub fn sample_page<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(0..=MAX_PAGE_INDEX)
}

pub fn parse_image_records(payload: Value) -> Vec<ImageRecord> {
    json_rows(payload)
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<ImageRecord>(row) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!("skipping undecodable post: {err}");
                None
            }
        })
        .collect()
}

pub struct SafebooruClient {
    api_base: String,
    http: HttpClient,
    download_timeout: Duration,
}

impl SafebooruClient {
    pub fn new(api_base: impl Into<String>, download_timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: build_client(download_timeout.max(Duration::from_secs(1)))?,
            download_timeout,
        })
    }

    /// Searches one given page.
    pub fn search_page(&self, request: &SearchRequest, pid: u32) -> Vec<ImageRecord> {
        match self.try_search_page(request, pid) {
            Ok(records) if records.is_empty() => {
                info!(
                    "no images for '{}' on pid={pid}",
                    normalize_search_tags(&request.tags)
                );
                records
            }
            Ok(records) => {
                debug!("found {} image(s) on pid={pid}", records.len());
                records
            }
            Err(err) if is_timeout(&err) => {
                error!("image search timed out after {:?} (pid={pid})", request.timeout);
                Vec::new()
            }
            Err(err) => {
                warn!("image search failed (pid={pid}): {}", error_chain_text(&err, 300));
                Vec::new()
            }
        }
    }

    fn try_search_page(&self, request: &SearchRequest, pid: u32) -> Result<Vec<ImageRecord>> {
        let params = search_params(request, pid);
        debug!("searching {} with {:?}", self.api_base, params);
        let response = self
            .http
            .get(&self.api_base)
            .query(&params)
            .timeout(request.timeout)
            .send()
            .with_context(|| format!("image search request failed ({})", self.api_base))?;
        let payload = response_json_or_error("image search", response)?;
        Ok(parse_image_records(payload))
    }

    fn try_fetch_image(&self, url: &str) -> Result<EncodedImage> {
        let response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        if !response.status().is_success() {
            anyhow::bail!("image download failed: HTTP {}", response.status().as_u16());
        }
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec();
        fetch::normalize_image(&bytes)
    }
}

impl ImageBoard for SafebooruClient {
    fn search(&self, request: &SearchRequest) -> Vec<ImageRecord> {
        let pid = sample_page(&mut rand::thread_rng());
        self.search_page(request, pid)
    }

    fn fetch_image(&self, url: &str) -> Option<EncodedImage> {
        match self.try_fetch_image(url) {
            Ok(image) => {
                debug!("image ready: {} base64 chars", image.base64.len());
                Some(image)
            }
            Err(err) if is_timeout(&err) => {
                error!("image download timed out ({url})");
                None
            }
            Err(err) => {
                error!("{}", error_chain_text(&err, 300));
                None
            }
        }
    }
}
