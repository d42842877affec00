use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use rand::seq::SliceRandom;
use sbooru_contracts::chat::parse_intent;
use sbooru_contracts::config::PluginConfig;
use sbooru_contracts::dialogue::{advance, DialogueStep, DialogueStore};
use sbooru_contracts::outcomes::ActionRecord;
use sbooru_contracts::records::{ImageRecord, Rating};
use sbooru_contracts::tags::extract_tags;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::host::{Host, InboundMessage};
use crate::http::error_chain_text;
use crate::search::{ImageBoard, SafebooruClient, SearchRequest};
use crate::styler::{styler_from_config, ReplyIntent, ReplyStyler};
use crate::tag_index::{SafebooruTagIndex, TagIndex};
use crate::validate::validate_tags;

pub const TOOL_NAME: &str = "safebooru_search";
pub const TOOL_MAX_LIMIT: i64 = 10;
pub const TOOL_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Tool replies list at most this many images in `content`.
pub const TOOL_LISTED_IMAGES: usize = 3;
pub const SHOWN_TAG_CHARS: usize = 50;

/// What a handler reports back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// `false` when the plugin stayed out of the conversation.
    pub handled: bool,
    pub message: String,
}

impl HandlerOutcome {
    fn silent(message: impl Into<String>) -> Self {
        Self {
            handled: false,
            message: message.into(),
        }
    }

    fn done(message: impl Into<String>) -> Self {
        Self {
            handled: true,
            message: message.into(),
        }
    }
}

enum FlowOutcome {
    Clarifying(String),
    NeedsDetail,
    Sent,
    NothingSent,
}

pub struct SafebooruPlugin {
    config: PluginConfig,
    tag_index: Arc<dyn TagIndex>,
    board: Arc<dyn ImageBoard>,
    styler: Box<dyn ReplyStyler>,
    dialogue: Arc<dyn DialogueStore>,
}

impl SafebooruPlugin {
    pub fn new(
        config: PluginConfig,
        tag_index: Arc<dyn TagIndex>,
        board: Arc<dyn ImageBoard>,
        styler: Box<dyn ReplyStyler>,
        dialogue: Arc<dyn DialogueStore>,
    ) -> Self {
        Self {
            config,
            tag_index,
            board,
            styler,
            dialogue,
        }
    }

    /// Wires the live Safebooru collaborators and the configured styler.
    pub fn from_config(config: PluginConfig, dialogue: Arc<dyn DialogueStore>) -> Result<Self> {
        let api_base = config.safebooru.api_base.clone();
        let tag_index = SafebooruTagIndex::new(
            &api_base,
            Duration::from_secs(config.safebooru.timeout_secs.max(1)),
        )?;
        let board = SafebooruClient::new(
            &api_base,
            Duration::from_secs(config.safebooru.download_timeout_secs.max(1)),
        )?;
        let styler = styler_from_config(&config);
        Ok(Self::new(
            config,
            Arc::new(tag_index),
            Arc::new(board),
            styler,
            dialogue,
        ))
    }

    /// True when the message is aimed at the bot: an @-mention, the bot's
    /// nickname in the text, or a conversation that is still warm.
    pub fn is_explicitly_triggered(&self, message: &InboundMessage) -> bool {
        self.triggered_at(message, SystemTime::now())
    }

    fn triggered_at(&self, message: &InboundMessage, now: SystemTime) -> bool {
        if message.is_mentioned {
            debug!("trigger: mentioned");
            return true;
        }
        let nickname = self
            .config
            .bot
            .nickname
            .as_deref()
            .map(str::trim)
            .filter(|nickname| !nickname.is_empty());
        if let Some(nickname) = nickname {
            if message.text.contains(nickname) {
                debug!("trigger: nickname '{nickname}'");
                return true;
            }
        }
        if let Some(last_active) = message.last_active {
            let window = Duration::from_secs(self.config.bot.active_window_secs);
            // A clock that went backwards still counts as active.
            let warm = now
                .duration_since(last_active)
                .map(|elapsed| elapsed < window)
                .unwrap_or(true);
            if warm {
                debug!("trigger: conversation active within {window:?}");
                return true;
            }
        }
        false
    }

    /// `/safebooru <tags>` and `/sb <tags>`.
    pub fn handle_command(&self, message: &InboundMessage, host: &mut dyn Host) -> HandlerOutcome {
        if !self.is_explicitly_triggered(message) {
            debug!("not addressed, staying silent");
            return HandlerOutcome::silent("not triggered");
        }
        match self.run_command(message, host) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("command failed: {}", error_chain_text(&err, 300));
                self.reply(host, &message.conversation_id, &ReplyIntent::UnknownError);
                HandlerOutcome::done(format!("error: {err}"))
            }
        }
    }

    fn run_command(&self, message: &InboundMessage, host: &mut dyn Host) -> Result<HandlerOutcome> {
        let conversation_id = message.conversation_id.as_str();
        let intent = parse_intent(&message.text);
        if intent.action != "search" {
            self.reply(host, conversation_id, &ReplyIntent::BadCommandFormat);
            return Ok(HandlerOutcome::silent("bad command format"));
        }

        let raw = intent.arg_str("tags").unwrap_or_default().trim();
        let tags = if raw.is_empty() {
            self.config.safebooru.default_tags.clone()
        } else {
            extract_tags(raw).join()
        };

        Ok(match self.search_and_send(conversation_id, &tags, host)? {
            FlowOutcome::Clarifying(tag) => {
                HandlerOutcome::done(format!("awaiting clarification: {tag}"))
            }
            FlowOutcome::NeedsDetail => HandlerOutcome::done("asked for more specific tags"),
            FlowOutcome::Sent => HandlerOutcome::done(format!("image sent: {tags}")),
            FlowOutcome::NothingSent => HandlerOutcome::done("finished, waiting for the user"),
        })
    }

    /// Natural-language request routed by the host's planner. `search_tags`
    /// is the planner's own tag guess, if it made one.
    pub fn handle_action(
        &self,
        message: &InboundMessage,
        search_tags: Option<&str>,
        host: &mut dyn Host,
    ) -> HandlerOutcome {
        if !self.config.response.enable_natural_search {
            debug!("natural-language search disabled");
            return HandlerOutcome::silent("natural-language search disabled");
        }
        if !self.is_explicitly_triggered(message) {
            debug!("not addressed, staying silent");
            return HandlerOutcome::silent("not triggered");
        }
        let conversation_id = message.conversation_id.as_str();
        match self.run_action(message, search_tags, host) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("action failed: {}", error_chain_text(&err, 300));
                self.reply(host, conversation_id, &ReplyIntent::UnknownError);
                let record = ActionRecord::finished(format!(
                    "执行过程中发生错误: {err}。已告知用户并等待反馈。严禁自动重试。"
                ));
                if let Err(store_err) = host.store_action_info(conversation_id, &record) {
                    error!(
                        "storing action info failed: {}",
                        error_chain_text(&store_err, 300)
                    );
                }
                HandlerOutcome::done(format!("error: {err}"))
            }
        }
    }

    fn run_action(
        &self,
        message: &InboundMessage,
        search_tags: Option<&str>,
        host: &mut dyn Host,
    ) -> Result<HandlerOutcome> {
        let conversation_id = message.conversation_id.as_str();
        let tags = self.action_tags(message, search_tags);

        match self.search_and_send(conversation_id, &tags, host)? {
            FlowOutcome::Clarifying(tag) => Ok(HandlerOutcome::done(format!(
                "awaiting clarification: {tag}"
            ))),
            FlowOutcome::NeedsDetail => Ok(HandlerOutcome::done("asked for more specific tags")),
            FlowOutcome::Sent => {
                host.store_action_info(
                    conversation_id,
                    &ActionRecord::finished(format!(
                        "已成功发送关于 '{tags}' 的图片。任务已完成。除非用户明确要求再次搜索或更换标签，否则严禁自动重试或继续搜索相关内容。"
                    )),
                )?;
                Ok(HandlerOutcome::done(format!("image sent: {tags}")))
            }
            FlowOutcome::NothingSent => {
                host.store_action_info(
                    conversation_id,
                    &ActionRecord::finished(format!(
                        "尝试搜索 '{tags}' 但未找到结果或下载失败。请告知用户结果并询问是否重试。在用户回复之前，不要进行任何自动搜索。"
                    )),
                )?;
                Ok(HandlerOutcome::done("search failed, user informed"))
            }
        }
    }

    /// Planner tags go through the phrase table when it recognises them;
    /// without planner tags the message itself is mined.
    fn action_tags(&self, message: &InboundMessage, search_tags: Option<&str>) -> String {
        let planned = search_tags.map(str::trim).filter(|raw| !raw.is_empty());
        let tags = match planned {
            Some(raw) => {
                let mapped = extract_tags(raw);
                if mapped.is_empty() {
                    raw.to_string()
                } else {
                    mapped.join()
                }
            }
            None => extract_tags(&message.text.to_lowercase()).join(),
        };
        if tags.is_empty() {
            return self.config.safebooru.default_tags.clone();
        }
        tags
    }

    fn search_and_send(
        &self,
        conversation_id: &str,
        tags: &str,
        host: &mut dyn Host,
    ) -> Result<FlowOutcome> {
        let validation = validate_tags(self.tag_index.as_ref(), tags);
        let (step, next_state) = advance(self.dialogue.load(conversation_id), &validation);

        let final_tags = match step {
            DialogueStep::Clarify {
                tag,
                candidates,
                attempt,
            } => {
                self.dialogue.store(conversation_id, next_state.as_ref())?;
                info!("asking {conversation_id} to clarify '{tag}' (attempt {attempt})");
                self.reply(
                    host,
                    conversation_id,
                    &ReplyIntent::Clarify {
                        tag: tag.clone(),
                        candidates,
                    },
                );
                return Ok(FlowOutcome::Clarifying(tag));
            }
            DialogueStep::LowEntropy => {
                self.reply(
                    host,
                    conversation_id,
                    &ReplyIntent::LowEntropy {
                        input: tags.to_string(),
                    },
                );
                return Ok(FlowOutcome::NeedsDetail);
            }
            DialogueStep::Proceed { tags, forced } => {
                if !forced.is_empty() {
                    info!("forced resolution for {conversation_id}: {forced:?}");
                    self.reply(
                        host,
                        conversation_id,
                        &ReplyIntent::ForcedResolution { tags: tags.clone() },
                    );
                }
                self.dialogue.store(conversation_id, next_state.as_ref())?;
                tags
            }
        };

        self.reply(
            host,
            conversation_id,
            &ReplyIntent::Searching {
                tags: final_tags.clone(),
            },
        );
        let request = SearchRequest {
            tags: final_tags,
            limit: self.config.safebooru.search_limit(),
            rating: self.config.safebooru.rating,
            timeout: Duration::from_secs(self.config.safebooru.timeout_secs.max(1)),
        };
        let records = self.board.search(&request);
        let Some(picked) = records.choose(&mut rand::thread_rng()) else {
            return Ok(FlowOutcome::NothingSent);
        };

        let Some(url) = picked.best_url() else {
            self.reply(host, conversation_id, &ReplyIntent::LinkMissing);
            return Ok(FlowOutcome::NothingSent);
        };
        let Some(image) = self.board.fetch_image(url) else {
            self.reply(host, conversation_id, &ReplyIntent::DownloadFailed);
            return Ok(FlowOutcome::NothingSent);
        };
        if !host.send_image(conversation_id, &image)? {
            self.reply(host, conversation_id, &ReplyIntent::SendFailed);
            return Ok(FlowOutcome::NothingSent);
        }
        info!("sent post {} to {conversation_id}", picked.id);

        if self.config.response.show_tags && !picked.tags.trim().is_empty() {
            self.reply(
                host,
                conversation_id,
                &ReplyIntent::ImageTags {
                    tags: shorten_tags(picked.tags.trim()),
                },
            );
        }
        Ok(FlowOutcome::Sent)
    }

    /// Text replies are best effort; a failed send is logged and dropped.
    fn reply(&self, host: &mut dyn Host, conversation_id: &str, intent: &ReplyIntent) {
        let text = self.styler.render(conversation_id, intent);
        if let Err(err) = host.send_text(conversation_id, &text) {
            error!("sending reply failed: {}", error_chain_text(&err, 300));
        }
    }

    /// The `safebooru_search` tool. Stateless: ambiguity is reported back to
    /// the caller instead of starting a dialogue.
    pub fn call_tool(&self, args: &Value) -> Value {
        match self.run_tool(args) {
            Ok(response) => response,
            Err(err) => {
                error!("tool call failed: {}", error_chain_text(&err, 300));
                json!({
                    "content": format!("💥 搜索过程中出现错误: {err}"),
                    "success": false,
                })
            }
        }
    }

    fn run_tool(&self, args: &Value) -> Result<Value> {
        let tags = args
            .get("tags")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if tags.is_empty() {
            return Ok(json!({
                "content": "❌ 缺少必需参数: tags",
                "success": false,
            }));
        }
        let limit = tool_limit(args.get("limit"))?;
        let rating = match args.get("rating").and_then(Value::as_str) {
            Some(raw) => raw.parse::<Rating>()?,
            None => Rating::Safe,
        };

        let validation = validate_tags(self.tag_index.as_ref(), tags);
        if let Some((tag, candidates)) = validation.first_ambiguous() {
            let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
            return Ok(json!({
                "content": format!(
                    "⚠️ 标签 '{tag}' 存在歧义，请从以下建议中选择更具体的标签：{}",
                    names.join(", ")
                ),
                "success": false,
                "ambiguity": serde_json::to_value(&validation.ambiguous_entities)?,
            }));
        }
        if validation.low_entropy {
            return Ok(json!({
                "content": format!(
                    "⚠️ 标签 '{tags}' 语义太弱（如 girl, solo 等），请提供更具体的特征（如角色名、作品名或具体的服装描述）。"
                ),
                "success": false,
            }));
        }

        let records = self.board.search(&SearchRequest {
            tags: validation.joined_tags(),
            limit,
            rating,
            timeout: TOOL_SEARCH_TIMEOUT,
        });
        if records.is_empty() {
            return Ok(json!({
                "content": format!("😔 没有找到标签为 '{tags}' 的图片呢~试试其他标签吧！"),
                "success": false,
            }));
        }

        let mut content = format!("✅ 找到 {} 张关于 '{tags}' 的图片：\n\n", records.len());
        for (position, record) in records.iter().take(TOOL_LISTED_IMAGES).enumerate() {
            content.push_str(&format!(
                "{}. ID: {}, 评分: {}\n   标签: {}\n\n",
                position + 1,
                record.id,
                record.score.unwrap_or(0),
                shorten_tags(&record.tags)
            ));
        }
        let images: Vec<Value> = records.iter().map(tool_image_json).collect();
        Ok(json!({
            "content": content,
            "success": true,
            "tags": tags,
            "count": records.len(),
            "images": images,
        }))
    }
}

/// `limit` may arrive as an integer, a float or a numeric string depending on
/// the caller's JSON encoder. Missing or null means 1.
fn tool_limit(value: Option<&Value>) -> Result<u32> {
    let value = match value {
        None | Some(Value::Null) => return Ok(1),
        Some(value) => value,
    };
    let requested = match value {
        Value::Number(number) => number.as_i64().or_else(|| whole(number.as_f64())),
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse::<i64>()
                .ok()
                .or_else(|| whole(raw.parse::<f64>().ok()))
        }
        _ => None,
    };
    let Some(requested) = requested else {
        anyhow::bail!("invalid limit: {value}");
    };
    Ok(requested.clamp(1, TOOL_MAX_LIMIT) as u32)
}

fn whole(number: Option<f64>) -> Option<i64> {
    number
        .filter(|n| n.is_finite() && n.fract() == 0.0)
        .map(|n| n as i64)
}

fn tool_image_json(record: &ImageRecord) -> Value {
    json!({
        "id": record.id,
        "file_url": record.file_url,
        "sample_url": record.sample_url,
        "preview_url": record.preview_url,
        "width": record.width,
        "height": record.height,
        "tags": record.tags,
        "rating": record.rating.as_deref().unwrap_or("unknown"),
        "score": record.score.unwrap_or(0),
    })
}

fn shorten_tags(tags: &str) -> String {
    if tags.chars().count() <= SHOWN_TAG_CHARS {
        return tags.to_string();
    }
    tags.chars().take(SHOWN_TAG_CHARS).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use anyhow::{bail, Result};
    use sbooru_contracts::config::PluginConfig;
    use sbooru_contracts::dialogue::{DialogueStore, MemoryDialogueStore};
    use sbooru_contracts::outcomes::ActionRecord;
    use sbooru_contracts::records::{ImageRecord, Rating};
    use serde_json::json;

    use super::{shorten_tags, tool_limit, SafebooruPlugin};
    use crate::fetch::EncodedImage;
    use crate::host::{Host, InboundMessage};
    use crate::search::{ImageBoard, SearchRequest};
    use crate::styler::{PassthroughStyler, ReplyIntent};
    use crate::validate::tests::FakeIndex;

    #[derive(Default)]
    struct FakeBoard {
        records: Vec<ImageRecord>,
        image: Option<EncodedImage>,
        requests: Mutex<Vec<SearchRequest>>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeBoard {
        fn serving(records: Vec<ImageRecord>) -> Self {
            Self {
                records,
                image: Some(EncodedImage {
                    bytes: vec![0xFF, 0xD8, 0xFF],
                    base64: "/9j/".to_string(),
                }),
                ..Self::default()
            }
        }

        fn without_image(mut self) -> Self {
            self.image = None;
            self
        }

        fn requests(&self) -> Vec<SearchRequest> {
            self.requests
                .lock()
                .map(|requests| requests.clone())
                .unwrap_or_default()
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched
                .lock()
                .map(|fetched| fetched.clone())
                .unwrap_or_default()
        }
    }

    impl ImageBoard for FakeBoard {
        fn search(&self, request: &SearchRequest) -> Vec<ImageRecord> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            self.records.clone()
        }

        fn fetch_image(&self, url: &str) -> Option<EncodedImage> {
            if let Ok(mut fetched) = self.fetched.lock() {
                fetched.push(url.to_string());
            }
            self.image.clone()
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        texts: Vec<String>,
        images: Vec<EncodedImage>,
        actions: Vec<ActionRecord>,
        refuse_images: bool,
        break_images: bool,
    }

    impl Host for RecordingHost {
        fn send_text(&mut self, _conversation_id: &str, text: &str) -> Result<()> {
            self.texts.push(text.to_string());
            Ok(())
        }

        fn send_image(&mut self, _conversation_id: &str, image: &EncodedImage) -> Result<bool> {
            if self.break_images {
                bail!("upload socket closed");
            }
            if self.refuse_images {
                return Ok(false);
            }
            self.images.push(image.clone());
            Ok(true)
        }

        fn store_action_info(&mut self, _conversation_id: &str, record: &ActionRecord) -> Result<()> {
            self.actions.push(record.clone());
            Ok(())
        }
    }

    fn post(id: u64, url: Option<&str>, tags: &str) -> ImageRecord {
        ImageRecord {
            id,
            file_url: url.map(str::to_string),
            sample_url: None,
            preview_url: None,
            width: Some(800),
            height: Some(600),
            tags: tags.to_string(),
            rating: Some("safe".to_string()),
            score: Some(7),
        }
    }

    struct Fixture {
        plugin: SafebooruPlugin,
        index: Arc<FakeIndex>,
        board: Arc<FakeBoard>,
        dialogue: Arc<MemoryDialogueStore>,
    }

    fn fixture(config: PluginConfig, index: FakeIndex, board: FakeBoard) -> Fixture {
        let index = Arc::new(index);
        let board = Arc::new(board);
        let dialogue = Arc::new(MemoryDialogueStore::new());
        let plugin = SafebooruPlugin::new(
            config,
            index.clone(),
            board.clone(),
            Box::new(PassthroughStyler),
            dialogue.clone(),
        );
        Fixture {
            plugin,
            index,
            board,
            dialogue,
        }
    }

    fn rem_index() -> FakeIndex {
        FakeIndex::default().with_prefix("rem", &["rem_(re:zero)", "remilia_scarlet", "rem_galleu"])
    }

    fn to_bot(text: &str) -> InboundMessage {
        InboundMessage::new("conv-1", text).mentioned()
    }

    #[test]
    fn unaddressed_message_is_ignored() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();

        let outcome = fx
            .plugin
            .handle_command(&InboundMessage::new("conv-1", "/sb maid"), &mut host);
        assert!(!outcome.handled);
        assert!(host.texts.is_empty());
        assert_eq!(fx.index.call_count(), 0);
        assert!(fx.board.requests().is_empty());
    }

    #[test]
    fn trigger_accepts_nickname_and_recent_activity() {
        let mut config = PluginConfig::default();
        config.bot.nickname = Some("小雪".to_string());
        let fx = fixture(config, FakeIndex::default(), FakeBoard::default());
        let now = SystemTime::now();

        assert!(fx
            .plugin
            .triggered_at(&InboundMessage::new("c", "小雪 来张图"), now));
        assert!(fx.plugin.triggered_at(
            &InboundMessage::new("c", "/sb maid").active_at(now - Duration::from_secs(10)),
            now
        ));
        assert!(!fx.plugin.triggered_at(
            &InboundMessage::new("c", "/sb maid").active_at(now - Duration::from_secs(120)),
            now
        ));
        assert!(!fx
            .plugin
            .triggered_at(&InboundMessage::new("c", "/sb maid"), now));
    }

    #[test]
    fn command_searches_validated_tags_and_sends_image() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::serving(vec![post(
                11,
                Some("https://example.test/11.jpg"),
                "hatsune_miku highres",
            )]),
        );
        let mut host = RecordingHost::default();

        let outcome = fx.plugin.handle_command(&to_bot("/sb 初音的高清图"), &mut host);
        assert!(outcome.handled);
        assert_eq!(outcome.message, "image sent: hatsune_miku highres");

        let requests = fx.board.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tags, "hatsune_miku highres");
        assert_eq!(requests[0].limit, 10);
        assert_eq!(requests[0].rating, Rating::Safe);
        assert_eq!(requests[0].timeout, Duration::from_secs(60));
        assert_eq!(fx.board.fetched(), vec!["https://example.test/11.jpg"]);

        assert_eq!(host.images.len(), 1);
        assert_eq!(
            host.texts,
            vec![ReplyIntent::Searching {
                tags: "hatsune_miku highres".to_string()
            }
            .fallback_text()]
        );
        assert!(host.actions.is_empty());
    }

    #[test]
    fn show_tags_follows_the_image() {
        let mut config = PluginConfig::default();
        config.response.show_tags = true;
        let long_tags = "hatsune_miku 1girl aqua_hair twintails long_hair very_long_hair smile";
        let fx = fixture(
            config,
            FakeIndex::default(),
            FakeBoard::serving(vec![post(3, Some("https://example.test/3.jpg"), long_tags)]),
        );
        let mut host = RecordingHost::default();

        fx.plugin.handle_command(&to_bot("/safebooru hatsune_miku"), &mut host);
        let last = host.texts.last().cloned().unwrap_or_default();
        assert_eq!(last, format!("标签: {}", shorten_tags(long_tags)));
        assert!(last.ends_with("..."));
    }

    #[test]
    fn ambiguity_clarifies_three_times_then_forces_first_candidate() {
        let fx = fixture(
            PluginConfig::default(),
            rem_index(),
            FakeBoard::serving(vec![post(5, Some("https://example.test/5.jpg"), "rem_(re:zero)")]),
        );
        let mut host = RecordingHost::default();

        for attempt in 1..=3u8 {
            let outcome = fx.plugin.handle_command(&to_bot("/sb rem"), &mut host);
            assert_eq!(outcome.message, "awaiting clarification: rem");
            let state = fx.dialogue.load("conv-1");
            assert_eq!(state.as_ref().map(|s| s.attempt_count), Some(attempt));
            assert_eq!(
                state.and_then(|s| s.pending_tag),
                Some("rem".to_string())
            );
        }
        assert!(fx.board.requests().is_empty());
        assert!(host.texts[0].contains("rem_(re:zero), remilia_scarlet, rem_galleu"));

        let outcome = fx.plugin.handle_command(&to_bot("/sb rem"), &mut host);
        assert_eq!(outcome.message, "image sent: rem");
        assert_eq!(fx.board.requests()[0].tags, "rem_(re:zero)");
        assert!(fx.dialogue.load("conv-1").is_none());

        let forced = ReplyIntent::ForcedResolution {
            tags: "rem_(re:zero)".to_string(),
        }
        .fallback_text();
        assert_eq!(host.texts[3], forced);
        assert_eq!(host.images.len(), 1);
    }

    #[test]
    fn low_entropy_asks_for_detail_and_keeps_state() -> Result<()> {
        let fx = fixture(
            PluginConfig::default(),
            rem_index(),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();
        fx.plugin.handle_command(&to_bot("/sb rem"), &mut host);

        let outcome = fx.plugin.handle_command(&to_bot("/sb girl"), &mut host);
        assert_eq!(outcome.message, "asked for more specific tags");
        assert_eq!(
            host.texts.last().cloned().unwrap_or_default(),
            ReplyIntent::LowEntropy {
                input: "girl".to_string()
            }
            .fallback_text()
        );
        assert_eq!(
            fx.dialogue.load("conv-1").map(|state| state.attempt_count),
            Some(1)
        );
        assert!(fx.board.requests().is_empty());
        Ok(())
    }

    #[test]
    fn bare_command_uses_default_tags() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();

        fx.plugin.handle_command(&to_bot("/sb"), &mut host);
        assert_eq!(
            host.texts,
            vec![ReplyIntent::LowEntropy {
                input: "anime cute".to_string()
            }
            .fallback_text()]
        );
        assert_eq!(fx.index.call_count(), 0);
    }

    #[test]
    fn non_search_command_gets_format_hint() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();

        let outcome = fx.plugin.handle_command(&to_bot("/sbx maid"), &mut host);
        assert!(!outcome.handled);
        assert_eq!(
            host.texts,
            vec![ReplyIntent::BadCommandFormat.fallback_text()]
        );
    }

    #[test]
    fn empty_results_send_nothing_more() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("maid", "maid"),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();

        let outcome = fx.plugin.handle_command(&to_bot("/sb maid"), &mut host);
        assert_eq!(outcome.message, "finished, waiting for the user");
        assert_eq!(host.texts.len(), 1);
        assert!(host.images.is_empty());
    }

    #[test]
    fn delivery_failures_are_reported() {
        let cases = [
            (
                FakeBoard::serving(vec![post(1, None, "maid")]),
                RecordingHost::default(),
                ReplyIntent::LinkMissing,
            ),
            (
                FakeBoard::serving(vec![post(1, Some("https://example.test/1.jpg"), "maid")])
                    .without_image(),
                RecordingHost::default(),
                ReplyIntent::DownloadFailed,
            ),
            (
                FakeBoard::serving(vec![post(1, Some("https://example.test/1.jpg"), "maid")]),
                RecordingHost {
                    refuse_images: true,
                    ..RecordingHost::default()
                },
                ReplyIntent::SendFailed,
            ),
        ];
        for (board, mut host, expected) in cases {
            let fx = fixture(
                PluginConfig::default(),
                FakeIndex::default().with_exact("maid", "maid"),
                board,
            );
            let outcome = fx.plugin.handle_command(&to_bot("/sb maid"), &mut host);
            assert!(outcome.handled);
            assert_eq!(
                host.texts.last().cloned().unwrap_or_default(),
                expected.fallback_text()
            );
            assert!(host.images.is_empty());
        }
    }

    #[test]
    fn host_error_is_caught_as_unknown_error() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("maid", "maid"),
            FakeBoard::serving(vec![post(1, Some("https://example.test/1.jpg"), "maid")]),
        );
        let mut host = RecordingHost {
            break_images: true,
            ..RecordingHost::default()
        };

        let outcome = fx.plugin.handle_command(&to_bot("/sb maid"), &mut host);
        assert!(outcome.handled);
        assert!(outcome.message.contains("upload socket closed"));
        assert_eq!(
            host.texts.last().cloned().unwrap_or_default(),
            ReplyIntent::UnknownError.fallback_text()
        );
    }

    #[test]
    fn action_maps_planner_tags_and_records_success() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("maid", "maid"),
            FakeBoard::serving(vec![post(9, Some("https://example.test/9.jpg"), "maid")]),
        );
        let mut host = RecordingHost::default();

        let outcome = fx
            .plugin
            .handle_action(&to_bot("来张女仆图"), Some("女仆"), &mut host);
        assert_eq!(outcome.message, "image sent: maid");
        assert_eq!(host.actions.len(), 1);
        assert!(host.actions[0].done && host.actions[0].build_into_prompt);
        assert!(host.actions[0].prompt_display.starts_with("已成功发送关于 'maid' 的图片"));
    }

    #[test]
    fn action_without_planner_tags_mines_the_message() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("maid", "maid"),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();

        let outcome = fx.plugin.handle_action(&to_bot("来一张女仆"), None, &mut host);
        assert_eq!(outcome.message, "search failed, user informed");
        assert_eq!(fx.board.requests()[0].tags, "maid");
        assert_eq!(host.actions.len(), 1);
        assert!(host.actions[0].prompt_display.starts_with("尝试搜索 'maid'"));
    }

    #[test]
    fn unmapped_planner_tags_are_used_verbatim() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("xy", "xy"),
            FakeBoard::default(),
        );
        let mut host = RecordingHost::default();
        fx.plugin.handle_action(&to_bot("?"), Some("xy"), &mut host);
        assert_eq!(fx.board.requests()[0].tags, "xy");
    }

    #[test]
    fn action_error_still_records_outcome() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("maid", "maid"),
            FakeBoard::serving(vec![post(1, Some("https://example.test/1.jpg"), "maid")]),
        );
        let mut host = RecordingHost {
            break_images: true,
            ..RecordingHost::default()
        };

        let outcome = fx.plugin.handle_action(&to_bot("女仆"), None, &mut host);
        assert!(outcome.handled);
        assert_eq!(host.actions.len(), 1);
        assert!(host.actions[0]
            .prompt_display
            .starts_with("执行过程中发生错误: upload socket closed"));
    }

    #[test]
    fn action_respects_natural_search_switch() {
        let mut config = PluginConfig::default();
        config.response.enable_natural_search = false;
        let fx = fixture(config, FakeIndex::default(), FakeBoard::default());
        let mut host = RecordingHost::default();

        let outcome = fx.plugin.handle_action(&to_bot("女仆"), None, &mut host);
        assert!(!outcome.handled);
        assert!(host.texts.is_empty() && host.actions.is_empty());
    }

    #[test]
    fn tool_requires_tags() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::default(),
        );
        let response = fx.plugin.call_tool(&json!({"limit": 2}));
        assert_eq!(response["success"], json!(false));
        assert_eq!(response["content"], json!("❌ 缺少必需参数: tags"));
    }

    #[test]
    fn tool_reports_ambiguity_without_dialogue_state() {
        let fx = fixture(
            PluginConfig::default(),
            rem_index(),
            FakeBoard::default(),
        );
        let response = fx.plugin.call_tool(&json!({"tags": "rem"}));
        assert_eq!(response["success"], json!(false));
        assert_eq!(response["ambiguity"]["rem"][0]["name"], json!("rem_(re:zero)"));
        assert!(response["content"]
            .as_str()
            .unwrap_or_default()
            .contains("rem_(re:zero), remilia_scarlet, rem_galleu"));
        assert!(fx.dialogue.load("conv-1").is_none());
        assert!(fx.board.requests().is_empty());
    }

    #[test]
    fn tool_rejects_weak_tags_and_empty_results() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default().with_exact("maid", "maid"),
            FakeBoard::default(),
        );
        let weak = fx.plugin.call_tool(&json!({"tags": "girl solo"}));
        assert_eq!(weak["success"], json!(false));
        assert!(weak["content"].as_str().unwrap_or_default().contains("语义太弱"));

        let empty = fx.plugin.call_tool(&json!({"tags": "maid"}));
        assert_eq!(empty["success"], json!(false));
        assert_eq!(
            empty["content"],
            json!("😔 没有找到标签为 'maid' 的图片呢~试试其他标签吧！")
        );
    }

    #[test]
    fn tool_lists_results_and_clamps_limit() {
        let records: Vec<ImageRecord> = (1..=4)
            .map(|id| post(id, Some("https://example.test/x.jpg"), "hatsune_miku"))
            .collect();
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::serving(records),
        );

        let response = fx.plugin.call_tool(&json!({
            "tags": "hatsune_miku",
            "limit": 50,
            "rating": "questionable",
        }));
        assert_eq!(response["success"], json!(true));
        assert_eq!(response["count"], json!(4));
        assert_eq!(response["tags"], json!("hatsune_miku"));
        assert_eq!(response["images"][0]["rating"], json!("safe"));
        let content = response["content"].as_str().unwrap_or_default();
        assert!(content.starts_with("✅ 找到 4 张关于 'hatsune_miku' 的图片："));
        assert!(content.contains("3. ID: 3, 评分: 7"));
        assert!(!content.contains("4. ID: 4"));

        let request = &fx.board.requests()[0];
        assert_eq!(request.limit, 10);
        assert_eq!(request.rating, Rating::Questionable);
        assert_eq!(request.timeout, Duration::from_secs(30));
    }

    #[test]
    fn tool_rejects_unknown_rating() {
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::default(),
        );
        let response = fx
            .plugin
            .call_tool(&json!({"tags": "hatsune_miku", "rating": "spicy"}));
        assert_eq!(response["success"], json!(false));
        assert!(response["content"]
            .as_str()
            .unwrap_or_default()
            .starts_with("💥 搜索过程中出现错误"));
    }

    #[test]
    fn tool_limit_accepts_floats_and_numeric_strings() -> Result<()> {
        assert_eq!(tool_limit(None)?, 1);
        assert_eq!(tool_limit(Some(&json!(null)))?, 1);
        assert_eq!(tool_limit(Some(&json!(3)))?, 3);
        assert_eq!(tool_limit(Some(&json!(3.0)))?, 3);
        assert_eq!(tool_limit(Some(&json!("4")))?, 4);
        assert_eq!(tool_limit(Some(&json!(" 5.0 ")))?, 5);
        assert_eq!(tool_limit(Some(&json!("40")))?, 10);
        assert_eq!(tool_limit(Some(&json!(-2)))?, 1);
        assert!(tool_limit(Some(&json!(2.5))).is_err());
        assert!(tool_limit(Some(&json!("a few"))).is_err());
        assert!(tool_limit(Some(&json!([3]))).is_err());
        Ok(())
    }

    #[test]
    fn tool_passes_string_limit_to_search() {
        let records: Vec<ImageRecord> = (1..=2)
            .map(|id| post(id, Some("https://example.test/x.jpg"), "hatsune_miku"))
            .collect();
        let fx = fixture(
            PluginConfig::default(),
            FakeIndex::default(),
            FakeBoard::serving(records),
        );

        let response = fx
            .plugin
            .call_tool(&json!({"tags": "hatsune_miku", "limit": "3"}));
        assert_eq!(response["success"], json!(true));
        let response = fx
            .plugin
            .call_tool(&json!({"tags": "hatsune_miku", "limit": 4.0}));
        assert_eq!(response["success"], json!(true));
        let limits: Vec<u32> = fx.board.requests().iter().map(|r| r.limit).collect();
        assert_eq!(limits, vec![3, 4]);

        let response = fx
            .plugin
            .call_tool(&json!({"tags": "hatsune_miku", "limit": "lots"}));
        assert_eq!(response["success"], json!(false));
        assert_eq!(fx.board.requests().len(), 2);
    }
}
