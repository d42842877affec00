use std::time::SystemTime;

use anyhow::Result;
use sbooru_contracts::outcomes::ActionRecord;

use crate::fetch::EncodedImage;

/// Capabilities the surrounding chat runtime lends the plugin.
pub trait Host {
    fn send_text(&mut self, conversation_id: &str, text: &str) -> Result<()>;
    /// `Ok(false)` when the host refused the image (size limits and the like).
    fn send_image(&mut self, conversation_id: &str, image: &EncodedImage) -> Result<bool>;
    fn store_action_info(&mut self, conversation_id: &str, record: &ActionRecord) -> Result<()>;
}

/// One inbound chat message as the host hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub conversation_id: String,
    pub text: String,
    pub is_mentioned: bool,
    /// Last time the bot spoke in this conversation.
    pub last_active: Option<SystemTime>,
}

impl InboundMessage {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            is_mentioned: false,
            last_active: None,
        }
    }

    pub fn mentioned(mut self) -> Self {
        self.is_mentioned = true;
        self
    }

    pub fn active_at(mut self, at: SystemTime) -> Self {
        self.last_active = Some(at);
        self
    }
}
