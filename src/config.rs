//! Process-wide configuration, loaded once from the environment at startup
//! (C10 step 1). No component reaches back into `std::env` itself — each
//! external client is constructed from an explicit field of this struct,
//! per the "implicit global state → lifecycle-managed fields" design note.

use anyhow::{Context, Result, anyhow};

use crate::gateway::GatewayAuth;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub whatsapp_base_url: String,
    pub whatsapp_auth: GatewayAuth,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_vision_model: String,
    pub llm_audio_model: String,

    pub poll_interval_seconds: u64,
    pub message_limit_per_poll: u32,

    pub jwt_secret: String,
    pub access_token_expire_days: i64,

    pub max_concurrent_media_jobs: usize,

    pub bind_addr: String,

    /// If set, an initial REST-surface user is created at startup when the
    /// `users` table is empty, so a freshly provisioned instance has
    /// something to log in with. Unset on every later start once a user
    /// already exists.
    pub bootstrap_admin_username: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads and validates configuration per §6's environment table. Fails
    /// fast (a Fatal-class startup error per §7) rather than starting with
    /// a half-configured gateway or LLM client.
    pub fn from_env() -> Result<Self> {
        let whatsapp_base_url = env_var("WHATSAPP_BASE_URL")?;

        let whatsapp_auth = if let Some(token) = env_var_opt("WHATSAPP_API_TOKEN") {
            GatewayAuth::Bearer { token }
        } else {
            let username = env_var_opt("WHATSAPP_USER")
                .ok_or_else(|| anyhow!("one of WHATSAPP_API_TOKEN or WHATSAPP_USER/WHATSAPP_PASSWORD is required"))?;
            let password = env_var("WHATSAPP_PASSWORD")?;
            GatewayAuth::Basic { username, password }
        };

        Ok(Self {
            database_url: env_var("DATABASE_URL")?,

            whatsapp_base_url,
            whatsapp_auth,

            llm_base_url: env_var("LLM_BASE_URL")?,
            llm_api_key: env_var("LLM_API_KEY")?,
            llm_model: env_var_opt("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            llm_vision_model: env_var_opt("LLM_VISION_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            llm_audio_model: env_var_opt("LLM_AUDIO_MODEL").unwrap_or_else(|| "whisper-1".to_string()),

            poll_interval_seconds: env_parse_or("POLL_INTERVAL_SECONDS", 5),
            message_limit_per_poll: env_parse_or("MESSAGE_LIMIT_PER_POLL", 20),

            jwt_secret: env_var_opt("JWT_SECRET").unwrap_or_else(|| {
                tracing::warn!("JWT_SECRET not set, using an insecure development default");
                "dev-insecure-secret-change-me".to_string()
            }),
            access_token_expire_days: env_parse_or("ACCESS_TOKEN_EXPIRE_DAYS", 30),

            max_concurrent_media_jobs: env_parse_or("MAX_CONCURRENT_MEDIA_JOBS", 8),

            bind_addr: env_var_opt("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),

            bootstrap_admin_username: env_var_opt("BOOTSTRAP_ADMIN_USERNAME"),
            bootstrap_admin_password: env_var_opt("BOOTSTRAP_ADMIN_PASSWORD"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_or_falls_back_on_missing_or_bad_value() {
        assert_eq!(env_parse_or::<u64>("YUI_TEST_DOES_NOT_EXIST", 5), 5);
    }
}
