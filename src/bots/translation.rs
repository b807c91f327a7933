use super::config_schema::{ConfigFieldSchema, ConfigSchema, ConfigValueType};
use super::{BotContext, BotType, Capability, IncomingMessage, MediaKind, MediaLoad, MediaPayload};
use crate::llm::LlmError;
use crate::media::MediaError;
use async_trait::async_trait;

static CAPABILITIES: [Capability; 4] = [
    Capability::Text,
    Capability::Image,
    Capability::Audio,
    Capability::Video,
];

const SUPPORTED_LANGUAGES: [&str; 2] = ["en", "pt"];

pub struct TranslationBot;

#[async_trait]
impl BotType for TranslationBot {
    fn type_key(&self) -> &'static str {
        "translation"
    }

    fn display_name(&self) -> &'static str {
        "Text Translation Bot"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &CAPABILITIES
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new([
            (
                "prefix",
                ConfigFieldSchema {
                    value_type: ConfigValueType::String,
                    default: serde_json::json!("[ai]"),
                    required: false,
                },
            ),
            (
                "source_languages",
                ConfigFieldSchema {
                    value_type: ConfigValueType::ListEnum(SUPPORTED_LANGUAGES.to_vec()),
                    default: serde_json::json!(["en", "pt"]),
                    required: false,
                },
            ),
            (
                "translate_images",
                ConfigFieldSchema {
                    value_type: ConfigValueType::Bool,
                    default: serde_json::json!(false),
                    required: false,
                },
            ),
            (
                "translate_audio",
                ConfigFieldSchema {
                    value_type: ConfigValueType::Bool,
                    default: serde_json::json!(false),
                    required: false,
                },
            ),
            (
                "translate_video",
                ConfigFieldSchema {
                    value_type: ConfigValueType::Bool,
                    default: serde_json::json!(false),
                    required: false,
                },
            ),
        ])
    }

    async fn process(
        &self,
        message: &IncomingMessage,
        context: &BotContext,
    ) -> anyhow::Result<Option<String>> {
        let prefix = context.config_str("prefix", "[ai]");

        match &message.media {
            Some(MediaLoad::DownloadFailed { kind, error }) => {
                if !media_kind_enabled(context, *kind) {
                    return Ok(None);
                }
                Ok(Some(format!("{prefix} failed to download {}: {error}", kind_label(*kind))))
            }
            Some(MediaLoad::Loaded(media)) if media.kind == MediaKind::Image => {
                if !context.config_bool("translate_images", false) {
                    return Ok(None);
                }
                Ok(Some(self.handle_image(message, media, context, &prefix).await))
            }
            Some(MediaLoad::Loaded(media)) if media.kind == MediaKind::Audio => {
                if !context.config_bool("translate_audio", false) {
                    return Ok(None);
                }
                let langs = configured_languages(context);
                let reply = self
                    .handle_audio_bytes(&media.bytes, context, &prefix, &langs)
                    .await;
                Ok(Some(reply))
            }
            Some(MediaLoad::Loaded(media)) if media.kind == MediaKind::Video => {
                if !context.config_bool("translate_video", false) {
                    return Ok(None);
                }
                Ok(Some(self.handle_video(media, context, &prefix).await))
            }
            Some(MediaLoad::Loaded(_)) => Ok(None),
            None => Ok(self.handle_text(message, context, &prefix).await),
        }
    }
}

fn media_kind_enabled(context: &BotContext, kind: MediaKind) -> bool {
    match kind {
        MediaKind::Image => context.config_bool("translate_images", false),
        MediaKind::Audio => context.config_bool("translate_audio", false),
        MediaKind::Video => context.config_bool("translate_video", false),
        MediaKind::Document => false,
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
        MediaKind::Document => "document",
    }
}

fn configured_languages(context: &BotContext) -> Vec<String> {
    let configured = context.config_str_list("source_languages");
    if configured.is_empty() {
        SUPPORTED_LANGUAGES.iter().map(|s| s.to_string()).collect()
    } else {
        configured
    }
}

/// A bracketed prefix at the start of a message (`[ai]`, `[joke]`, any
/// `[...]`) marks it as a bot's own reply — never translate those back.
fn starts_with_bot_prefix(content: &str) -> bool {
    let trimmed = content.trim_start();
    trimmed.starts_with('[') && trimmed.contains(']')
}

/// Minimal stopword-overlap detector restricted to the two supported
/// languages — good enough to pick a direction for short chat messages
/// without pulling in a full language-id dependency.
fn detect_language(text: &str, candidates: &[String]) -> Option<&'static str> {
    const EN_STOPWORDS: &[&str] = &[
        "the", "is", "are", "and", "you", "hello", "what", "how", "this", "that", "with", "for",
    ];
    const PT_STOPWORDS: &[&str] = &[
        "o", "a", "é", "são", "e", "você", "olá", "que", "como", "isso", "com", "para",
    ];

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    let en_score = words
        .iter()
        .filter(|w| EN_STOPWORDS.contains(w))
        .count();
    let pt_score = words
        .iter()
        .filter(|w| PT_STOPWORDS.contains(w))
        .count();

    let en_allowed = candidates.iter().any(|l| l == "en");
    let pt_allowed = candidates.iter().any(|l| l == "pt");

    match (en_allowed, pt_allowed) {
        (true, true) => {
            if en_score == 0 && pt_score == 0 {
                None
            } else if en_score >= pt_score {
                Some("en")
            } else {
                Some("pt")
            }
        }
        (true, false) => Some("en"),
        (false, true) => Some("pt"),
        (false, false) => None,
    }
}

fn opposite_language(lang: &str) -> &'static str {
    if lang == "en" { "pt" } else { "en" }
}

fn language_name(code: &str) -> &'static str {
    match code {
        "pt" => "Portuguese",
        _ => "English",
    }
}

impl TranslationBot {
    async fn handle_text(
        &self,
        message: &IncomingMessage,
        context: &BotContext,
        prefix: &str,
    ) -> Option<String> {
        let content = message.content.trim();
        if content.is_empty() || starts_with_bot_prefix(content) {
            return None;
        }

        let langs = configured_languages(context);
        let source = detect_language(content, &langs)?;
        let target = opposite_language(source);

        let system = format!(
            "Translate the user's message from {} to {}. Output only the translation, nothing else.",
            language_name(source),
            language_name(target)
        );

        match context.llm.complete(&context.text_model, &system, content).await {
            Ok(translation) => Some(format!("{prefix} {}", translation.trim())),
            Err(e) => Some(format!("{prefix} translation unavailable: {e}")),
        }
    }

    async fn handle_image(
        &self,
        message: &IncomingMessage,
        media: &MediaPayload,
        context: &BotContext,
        prefix: &str,
    ) -> String {
        let langs = configured_languages(context);
        let target = langs
            .iter()
            .find(|l| l.as_str() != "en")
            .cloned()
            .unwrap_or_else(|| "en".to_string());

        let system = format!(
            "Extract any visible text in this image exactly as written. \
             If there is visible text, respond with exactly two lines: \
             `Original Text: <text>` then `Translation: <the text translated to {}>`. \
             If there is no visible text, respond with exactly one line: \
             `Original Text: (none)` followed on the next line by `Translation: <a short description of the image>`.",
            language_name(&target)
        );

        match context
            .llm
            .complete_vision(&context.vision_model, &system, &message.content, &media.bytes)
            .await
        {
            Ok(text) => format!("{prefix} {}", text.trim()),
            Err(LlmError::TooLarge(msg)) => format!("{prefix} image too large to process: {msg}"),
            Err(LlmError::Unsupported(msg)) => format!("{prefix} unsupported image format: {msg}"),
            Err(e) => format!("{prefix} could not process image: {e}"),
        }
    }

    async fn handle_audio_bytes(
        &self,
        audio_bytes: &[u8],
        context: &BotContext,
        prefix: &str,
        langs: &[String],
    ) -> String {
        let transcript = match context.llm.transcribe(&context.audio_model, audio_bytes, None).await {
            Ok(text) => text,
            Err(LlmError::TooLarge(msg)) => return format!("{prefix} audio too large to process: {msg}"),
            Err(LlmError::Unsupported(msg)) => {
                return format!("{prefix} unsupported audio format: {msg}");
            }
            Err(e) => return format!("{prefix} transcription failed: {e}"),
        };

        let source = detect_language(&transcript, langs).unwrap_or("en");
        let target = opposite_language(source);
        let system = format!(
            "Translate the following transcript from {} to {}. Output only the translation.",
            language_name(source),
            language_name(target)
        );

        match context.llm.complete(&context.text_model, &system, &transcript).await {
            Ok(translation) => format!(
                "{prefix} Transcription: {}\nTranslation: {}",
                transcript.trim(),
                translation.trim()
            ),
            Err(_) => format!("{prefix} Transcription: {} (translation unavailable)", transcript.trim()),
        }
    }

    async fn handle_video(
        &self,
        media: &super::MediaPayload,
        context: &BotContext,
        prefix: &str,
    ) -> String {
        match context.media_pipeline.extract_audio(&media.bytes).await {
            Ok(audio_bytes) => {
                let langs = configured_languages(context);
                self.handle_audio_bytes(&audio_bytes, context, prefix, &langs).await
            }
            Err(MediaError::NoAudio) => format!("{prefix} this video has no audio track to translate"),
            Err(MediaError::TooLarge(msg)) => format!("{prefix} video too large to process: {msg}"),
            Err(MediaError::ExtractionFailed(msg)) => {
                format!("{prefix} could not extract audio from video: {msg}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_english_by_stopwords() {
        let langs = vec!["en".to_string(), "pt".to_string()];
        assert_eq!(detect_language("Hello, how are you today?", &langs), Some("en"));
    }

    #[test]
    fn detects_portuguese_by_stopwords() {
        let langs = vec!["en".to_string(), "pt".to_string()];
        assert_eq!(detect_language("Olá, como você está?", &langs), Some("pt"));
    }

    #[test]
    fn returns_none_when_ambiguous() {
        let langs = vec!["en".to_string(), "pt".to_string()];
        assert_eq!(detect_language("12345", &langs), None);
    }

    #[test]
    fn bracketed_prefix_is_recognized() {
        assert!(starts_with_bot_prefix("[ai] Olá"));
        assert!(starts_with_bot_prefix("[joke] why did..."));
        assert!(!starts_with_bot_prefix("hello [world]"));
    }

    #[test]
    fn opposite_language_swaps_en_pt() {
        assert_eq!(opposite_language("en"), "pt");
        assert_eq!(opposite_language("pt"), "en");
    }
}
