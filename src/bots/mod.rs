//! C5 Bot Kernel: the bot abstraction, capability-typed interface, and the
//! process-wide registry of bot *types* (§4.5, §9 "duck-typed bot class →
//! capability-typed interface").

pub mod config_schema;
pub mod joke;
pub mod translation;

use crate::llm::Llm;
use crate::media::MediaPipeline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_schema::ConfigSchema;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Text,
    Image,
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// The outcome of the kernel's capability-gated pre-download. A failed
/// download is handed to the bot rather than aborting the dispatch, so the
/// bot can phrase a human-readable reply in its own voice (§4.5, §7
/// "the translation bot always replies on media-handling failure").
#[derive(Debug, Clone)]
pub enum MediaLoad {
    Loaded(MediaPayload),
    DownloadFailed { kind: MediaKind, error: String },
}

/// The gateway message plus any media the kernel pre-loaded according to
/// the bot type's declared capabilities.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub external_id: String,
    pub sender_jid: String,
    pub is_from_me: bool,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub media: Option<MediaLoad>,
}

pub struct BotContext {
    pub llm: Arc<dyn Llm>,
    pub media_pipeline: Arc<MediaPipeline>,
    pub config: serde_json::Value,
    /// Process-wide model ids (`LLM_MODEL`/`LLM_VISION_MODEL`/`LLM_AUDIO_MODEL`),
    /// distinct from the per-instance `config` above.
    pub text_model: Arc<str>,
    pub vision_model: Arc<str>,
    pub audio_model: Arc<str>,
}

impl BotContext {
    pub fn config_str(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    }

    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        self.config.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn config_str_list(&self, key: &str) -> Vec<String> {
        self.config
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct BotTypeInfo {
    pub type_key: &'static str,
    pub display_name: &'static str,
    pub capabilities: Vec<Capability>,
}

#[async_trait]
pub trait BotType: Send + Sync {
    fn type_key(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn capabilities(&self) -> &'static [Capability];
    fn config_schema(&self) -> ConfigSchema;

    fn info(&self) -> BotTypeInfo {
        BotTypeInfo {
            type_key: self.type_key(),
            display_name: self.display_name(),
            capabilities: self.capabilities().to_vec(),
        }
    }

    /// `Ok(None)` means "do not reply". `Err` records the dispatch as
    /// failed and sends no reply — reserved for genuine internal faults,
    /// not user-facing media errors (those are `Ok(Some(message))`, §7).
    async fn process(
        &self,
        message: &IncomingMessage,
        context: &BotContext,
    ) -> anyhow::Result<Option<String>>;
}

#[derive(Default)]
pub struct BotRegistry {
    types: HashMap<&'static str, Arc<dyn BotType>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, bot_type: Arc<dyn BotType>) {
        self.types.insert(bot_type.type_key(), bot_type);
    }

    pub fn get(&self, type_key: &str) -> Option<Arc<dyn BotType>> {
        self.types.get(type_key).cloned()
    }

    pub fn list(&self) -> Vec<BotTypeInfo> {
        let mut infos: Vec<BotTypeInfo> = self.types.values().map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.type_key.cmp(b.type_key));
        infos
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(translation::TranslationBot));
        registry.register(Arc::new(joke::JokeBot));
        registry
    }
}

/// Every declared capability pre-download guard the kernel consults before
/// invoking `process` — if the bot didn't declare `Capability::Image` it
/// never receives image bytes even if one was downloaded for another bot.
pub fn capability_for_media_type(media_type: &str) -> Option<Capability> {
    match media_type {
        "image" => Some(Capability::Image),
        "audio" | "voice" => Some(Capability::Audio),
        "video" => Some(Capability::Video),
        _ => None,
    }
}

/// The `MediaKind` a pre-downloaded payload carries for a given capability —
/// the inverse of `capability_for_media_type`, used once the kernel has
/// already decided a download is warranted and needs to tag the bytes.
pub fn media_kind_for_capability(capability: Capability) -> MediaKind {
    match capability {
        Capability::Text => MediaKind::Document,
        Capability::Image => MediaKind::Image,
        Capability::Audio => MediaKind::Audio,
        Capability::Video => MediaKind::Video,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_both_builtin_types() {
        let registry = BotRegistry::with_builtins();
        let keys: Vec<&str> = registry.list().iter().map(|i| i.type_key).collect();
        assert!(keys.contains(&"translation"));
        assert!(keys.contains(&"joke"));
    }

    #[test]
    fn unknown_type_key_returns_none() {
        let registry = BotRegistry::with_builtins();
        assert!(registry.get("does-not-exist").is_none());
    }

    #[test]
    fn media_type_maps_to_capability() {
        assert_eq!(capability_for_media_type("image"), Some(Capability::Image));
        assert_eq!(capability_for_media_type("voice"), Some(Capability::Audio));
        assert_eq!(capability_for_media_type("sticker"), None);
    }

    #[test]
    fn capability_maps_back_to_media_kind() {
        assert_eq!(media_kind_for_capability(Capability::Image), MediaKind::Image);
        assert_eq!(media_kind_for_capability(Capability::Audio), MediaKind::Audio);
        assert_eq!(media_kind_for_capability(Capability::Video), MediaKind::Video);
    }
}
