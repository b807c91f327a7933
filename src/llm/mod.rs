//! C2 LLM Client: chat completion, vision completion, speech-to-text
//! against an OpenAI-style provider. Retry policy lives here, not at call
//! sites (§9 design note "retry-as-policy").

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const TEXT_TIMEOUT: Duration = Duration::from_secs(60);
const VISION_TIMEOUT: Duration = Duration::from_secs(90);
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(120);

const TRANSCRIBE_SIZE_CAP: usize = 25 * 1024 * 1024;
const TRANSCRIBE_RETRY_DELAYS_MS: [u64; 3] = [2000, 4000, 8000];

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transient error: {0}")]
    TransientError(String),
    #[error("permanent error: {0}")]
    PermanentError(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("too large: {0}")]
    TooLarge(String),
}

impl LlmError {
    fn is_retriable(&self) -> bool {
        matches!(self, LlmError::TransientError(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Mp4,
    Wav,
    WebM,
    Ogg,
}

impl AudioFormat {
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 3 && (&bytes[0..3] == b"ID3" || (bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0)) {
            Some(Self::Mp3)
        } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            Some(Self::Mp4)
        } else if bytes.starts_with(b"RIFF") && bytes.len() >= 12 && &bytes[8..12] == b"WAVE" {
            Some(Self::Wav)
        } else if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            Some(Self::WebM)
        } else if bytes.starts_with(b"OggS") {
            Some(Self::Ogg)
        } else {
            None
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Mp4 => "m4a",
            Self::Wav => "wav",
            Self::WebM => "webm",
            Self::Ogg => "ogg",
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, model: &str, system: &str, user_text: &str) -> Result<String, LlmError>;
    async fn complete_vision(
        &self,
        model: &str,
        system: &str,
        user_text: &str,
        image_bytes: &[u8],
    ) -> Result<String, LlmError>;
    async fn transcribe(
        &self,
        model: &str,
        audio_bytes: &[u8],
        hint_language: Option<&str>,
    ) -> Result<String, LlmError>;
}

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn classify_response_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            429 => LlmError::TransientError(format!("rate limited: {body}")),
            500..=599 => LlmError::TransientError(format!("server error {status}: {body}")),
            _ => LlmError::PermanentError(format!("{status}: {body}")),
        }
    }

    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&ChatRequest {
                model,
                messages,
                temperature: 0.2,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::TransientError(format!("request timed out: {e}"))
                } else {
                    LlmError::TransientError(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_response_error(status, &body));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::PermanentError(format!("malformed response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::PermanentError("empty completion".to_string()))
    }

    async fn transcribe_once(
        &self,
        model: &str,
        audio_bytes: &[u8],
        filename: &str,
        hint_language: Option<&str>,
    ) -> Result<String, LlmError> {
        let part = reqwest::multipart::Part::bytes(audio_bytes.to_vec()).file_name(filename.to_string());
        let mut form = reqwest::multipart::Form::new()
            .text("model", model.to_string())
            .part("file", part);
        if let Some(lang) = hint_language {
            form = form.text("language", lang.to_string());
        }

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(TRANSCRIBE_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::TransientError(format!("request timed out: {e}"))
                } else {
                    LlmError::TransientError(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_response_error(status, &body));
        }

        let body: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::PermanentError(format!("malformed response: {e}")))?;
        Ok(body.text)
    }
}

/// A fresh filename per attempt so no server-side identity cache can treat
/// retries as duplicate uploads (§4.2).
fn fresh_filename(extension: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random();
    format!("audio-{millis}-{suffix:08x}.{extension}")
}

#[async_trait]
impl Llm for LlmClient {
    async fn complete(&self, model: &str, system: &str, user_text: &str) -> Result<String, LlmError> {
        let messages = vec![
            ChatMessage {
                role: "system",
                content: serde_json::Value::String(system.to_string()),
            },
            ChatMessage {
                role: "user",
                content: serde_json::Value::String(user_text.to_string()),
            },
        ];
        self.chat(model, messages, TEXT_TIMEOUT).await
    }

    async fn complete_vision(
        &self,
        model: &str,
        system: &str,
        user_text: &str,
        image_bytes: &[u8],
    ) -> Result<String, LlmError> {
        let format = ImageFormat::detect(image_bytes)
            .ok_or_else(|| LlmError::Unsupported("unrecognized image format".to_string()))?;
        let data_uri = format!(
            "data:{};base64,{}",
            format.mime(),
            BASE64.encode(image_bytes)
        );

        let messages = vec![
            ChatMessage {
                role: "system",
                content: serde_json::Value::String(system.to_string()),
            },
            ChatMessage {
                role: "user",
                content: serde_json::json!([
                    {"type": "text", "text": user_text},
                    {"type": "image_url", "image_url": {"url": data_uri}},
                ]),
            },
        ];
        self.chat(model, messages, VISION_TIMEOUT).await
    }

    async fn transcribe(
        &self,
        model: &str,
        audio_bytes: &[u8],
        hint_language: Option<&str>,
    ) -> Result<String, LlmError> {
        if audio_bytes.len() > TRANSCRIBE_SIZE_CAP {
            return Err(LlmError::TooLarge(format!(
                "audio is {} bytes, cap is {TRANSCRIBE_SIZE_CAP}",
                audio_bytes.len()
            )));
        }
        let format = AudioFormat::detect(audio_bytes)
            .ok_or_else(|| LlmError::Unsupported("unrecognized audio format".to_string()))?;

        let mut last_err = None;
        for attempt in 0..=TRANSCRIBE_RETRY_DELAYS_MS.len() {
            if attempt > 0 {
                let delay = TRANSCRIBE_RETRY_DELAYS_MS[attempt - 1];
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let filename = fresh_filename(format.extension());
            match self
                .transcribe_once(model, audio_bytes, &filename, hint_language)
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retriable() && attempt < TRANSCRIBE_RETRY_DELAYS_MS.len() => {
                    tracing::warn!(attempt, error = %e, "transcription attempt failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::TransientError("transcription exhausted retries".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_jpeg_png_gif_webp() {
        assert_eq!(ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(
            ImageFormat::detect(b"\x89PNG\r\n\x1a\nrest"),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::detect(b"GIF89arest"), Some(ImageFormat::Gif));
        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0, 0, 0, 0]);
        webp.extend_from_slice(b"WEBP");
        assert_eq!(ImageFormat::detect(&webp), Some(ImageFormat::Webp));
    }

    #[test]
    fn rejects_unknown_image_format() {
        assert_eq!(ImageFormat::detect(b"not an image"), None);
    }

    #[test]
    fn detects_audio_formats() {
        assert_eq!(AudioFormat::detect(b"OggSrest"), Some(AudioFormat::Ogg));
        assert_eq!(
            AudioFormat::detect(&[0x1A, 0x45, 0xDF, 0xA3]),
            Some(AudioFormat::WebM)
        );
        let mut wav = b"RIFF".to_vec();
        wav.extend_from_slice(&[0, 0, 0, 0]);
        wav.extend_from_slice(b"WAVErest");
        assert_eq!(AudioFormat::detect(&wav), Some(AudioFormat::Wav));
    }

    #[test]
    fn fresh_filename_varies_between_calls() {
        let a = fresh_filename("ogg");
        let b = fresh_filename("ogg");
        assert_ne!(a, b);
        assert!(a.ends_with(".ogg"));
    }

    #[test]
    fn size_cap_boundary() {
        assert!(TRANSCRIBE_SIZE_CAP == 25 * 1024 * 1024);
    }
}
