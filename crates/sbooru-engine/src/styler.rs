use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use sbooru_contracts::config::{non_empty_env, PluginConfig, StylerMode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::http::{build_client, error_chain_text, response_json_or_error};

pub const REWRITE_REQUEST_TYPE: &str = "safebooru_personality";

/// Something the plugin wants to tell the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyIntent {
    BadCommandFormat,
    Clarify { tag: String, candidates: Vec<String> },
    LowEntropy { input: String },
    ForcedResolution { tags: String },
    Searching { tags: String },
    ImageTags { tags: String },
    SendFailed,
    DownloadFailed,
    LinkMissing,
    UnknownError,
}

impl ReplyIntent {
    pub fn description(&self) -> &'static str {
        match self {
            Self::BadCommandFormat => {
                "tell the user the command format is wrong; it should be /safebooru [tags]"
            }
            Self::Clarify { .. } => "a tag is ambiguous; ask the user which candidate they meant",
            Self::LowEntropy { .. } => {
                "the request is too vague; ask the user for more specific features"
            }
            Self::ForcedResolution { .. } => {
                "after several unclear attempts the best matching tags were picked automatically"
            }
            Self::Searching { .. } => {
                "search request received; tell the user naturally that you are looking for images"
            }
            Self::ImageTags { .. } => "share the tags of the image just sent",
            Self::SendFailed => {
                "sending the image failed (possibly too large); ask whether to try again"
            }
            Self::DownloadFailed => "downloading the image failed; ask whether to try again",
            Self::LinkMissing => "the image link is missing; ask whether to try again",
            Self::UnknownError => {
                "an unknown error interrupted the search; ask whether to try again"
            }
        }
    }

    pub fn context(&self) -> Option<Value> {
        match self {
            Self::Clarify { tag, candidates } => Some(json!({
                "tag": tag,
                "candidates": candidates,
            })),
            Self::LowEntropy { input } => Some(json!({ "input": input })),
            Self::ForcedResolution { tags } | Self::Searching { tags } | Self::ImageTags { tags } => {
                Some(json!({ "tags": tags }))
            }
            _ => None,
        }
    }

    /// Deterministic reply used when nothing rewrites the draft.
    pub fn fallback_text(&self) -> String {
        match self {
            Self::BadCommandFormat => {
                "命令格式不对哦，应该是 /safebooru [标签] 或 /sb [标签]".to_string()
            }
            Self::Clarify { tag, candidates } => format!(
                "标签 '{tag}' 有点模糊，你想要的是哪一个？{}",
                candidates.join(", ")
            ),
            Self::LowEntropy { input } => format!(
                "'{input}' 太笼统啦，能再具体一点吗？比如角色名、作品名或服装特征。"
            ),
            Self::ForcedResolution { tags } => {
                format!("试了几次还是没能确定，先按 '{tags}' 帮你找吧。")
            }
            Self::Searching { tags } => format!("正在寻找 '{tags}' 的图片，稍等一下~"),
            Self::ImageTags { tags } => format!("标签: {tags}"),
            Self::SendFailed => "图片发送失败了（可能文件太大），要再试一次吗？".to_string(),
            Self::DownloadFailed => "图片下载失败了，要再试一次吗？".to_string(),
            Self::LinkMissing => "图片链接失效了，要再试一次吗？".to_string(),
            Self::UnknownError => "发生了未知错误，搜索中断了，要再试一次吗？".to_string(),
        }
    }

    /// `[INTENT: ..]` optionally followed by `[CONTEXT: {json}]`.
    pub fn draft(&self) -> String {
        let mut draft = format!("[INTENT: {}]", self.description());
        if let Some(context) = self.context() {
            draft.push_str(&format!(" [CONTEXT: {context}]"));
        }
        draft
    }
}

/// Turns an intent into the text actually sent.
pub trait ReplyStyler: Send + Sync {
    fn render(&self, conversation_id: &str, intent: &ReplyIntent) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughStyler;

impl ReplyStyler for PassthroughStyler {
    fn render(&self, _conversation_id: &str, intent: &ReplyIntent) -> String {
        intent.fallback_text()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRequest<'a> {
    pub conversation_id: &'a str,
    pub raw_reply: String,
    pub reason: String,
    pub request_type: &'static str,
    pub style: &'a str,
}

/// Rewrites a factual draft in the bot's voice.
pub trait ReplyRewriter: Send + Sync {
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<String>;
}

pub struct RewritingStyler {
    rewriter: Box<dyn ReplyRewriter>,
    style: String,
}

impl RewritingStyler {
    pub fn new(rewriter: Box<dyn ReplyRewriter>, style: impl Into<String>) -> Self {
        Self {
            rewriter,
            style: style.into(),
        }
    }
}

impl ReplyStyler for RewritingStyler {
    fn render(&self, conversation_id: &str, intent: &ReplyIntent) -> String {
        let request = RewriteRequest {
            conversation_id,
            raw_reply: intent.draft(),
            reason: format!("safebooru plugin: {}", intent.description()),
            request_type: REWRITE_REQUEST_TYPE,
            style: &self.style,
        };
        match self.rewriter.rewrite(&request) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("reply rewrite came back empty, using fallback: {}", intent.description());
                intent.fallback_text()
            }
            Err(err) => {
                warn!(
                    "reply rewrite failed, using fallback: {}",
                    error_chain_text(&err, 300)
                );
                intent.fallback_text()
            }
        }
    }
}

pub const DEFAULT_REWRITE_MODEL: &str = "gpt-4o-mini";
const REWRITE_MAX_OUTPUT_TOKENS: u64 = 200;

/// Rewriter backed by an OpenAI-compatible Responses endpoint.
pub struct OpenAiRewriter {
    api_key: String,
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OpenAiRewriter {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let model = model.trim();
        Ok(Self {
            api_key: api_key.into(),
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            model: if model.is_empty() {
                DEFAULT_REWRITE_MODEL.to_string()
            } else {
                model.to_string()
            },
            http: build_client(timeout)?,
        })
    }

    /// Reads `OPENAI_API_KEY` and `OPENAI_API_BASE`.
    pub fn from_env(model: &str, timeout: Duration) -> Result<Self> {
        let Some(api_key) = openai_api_key() else {
            bail!("OPENAI_API_KEY not set");
        };
        Self::new(api_key, openai_api_base(), model, timeout)
    }

    fn payload(&self, request: &RewriteRequest<'_>) -> Value {
        json!({
            "model": self.model,
            "instructions": format!(
                "You are a chat bot with a {} personality. Rewrite the draft below into one short, \
                 natural chat reply in the user's language (Chinese unless the context says \
                 otherwise). Keep every fact from CONTEXT, never mention INTENT or CONTEXT, and \
                 output only the reply.",
                request.style
            ),
            "input": request.raw_reply,
            "max_output_tokens": REWRITE_MAX_OUTPUT_TOKENS,
            "metadata": {
                "request_type": request.request_type,
                "reason": request.reason,
            },
        })
    }
}

impl ReplyRewriter for OpenAiRewriter {
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<String> {
        let endpoint = format!("{}/responses", self.api_base);
        debug!(
            "rewriting reply for {} via {endpoint}",
            request.conversation_id
        );
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.payload(request))
            .send()
            .with_context(|| format!("rewrite request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        Ok(extract_openai_output_text(&parsed))
    }
}

fn openai_api_key() -> Option<String> {
    ["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]
        .iter()
        .find_map(|key| non_empty_env(key))
}

fn openai_api_base() -> String {
    let raw = ["OPENAI_API_BASE", "OPENAI_BASE_URL"]
        .iter()
        .find_map(|key| non_empty_env(key))
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base
}

fn extract_openai_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        if row.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let content = row
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }
    parts.join("\n")
}

/// Picks the styler named in `response.styler`. A rewrite styler without
/// credentials degrades to pass-through.
pub fn styler_from_config(config: &PluginConfig) -> Box<dyn ReplyStyler> {
    match config.response.styler {
        StylerMode::Passthrough => Box::new(PassthroughStyler),
        StylerMode::Rewrite => {
            let timeout = Duration::from_secs(config.safebooru.timeout_secs.max(1));
            match OpenAiRewriter::from_env(&config.response.rewrite_model, timeout) {
                Ok(rewriter) => Box::new(RewritingStyler::new(
                    Box::new(rewriter),
                    config.response.personality_style.clone(),
                )),
                Err(err) => {
                    warn!(
                        "rewrite styler unavailable, falling back to pass-through: {}",
                        error_chain_text(&err, 200)
                    );
                    Box::new(PassthroughStyler)
                }
            }
        }
    }
}
