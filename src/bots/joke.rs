use super::config_schema::{ConfigFieldSchema, ConfigSchema, ConfigValueType};
use super::{BotContext, BotType, Capability, IncomingMessage};
use async_trait::async_trait;

const JOKE_SYSTEM_PROMPT: &str = "You write short, family-friendly jokes. \
Output only the joke itself, one or two lines, no preamble.";

pub struct JokeBot;

static CAPABILITIES: [Capability; 1] = [Capability::Text];

#[async_trait]
impl BotType for JokeBot {
    fn type_key(&self) -> &'static str {
        "joke"
    }

    fn display_name(&self) -> &'static str {
        "Joke Bot"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &CAPABILITIES
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new([(
            "prefix",
            ConfigFieldSchema {
                value_type: ConfigValueType::String,
                default: serde_json::json!("[joke]"),
                required: false,
            },
        )])
    }

    async fn process(
        &self,
        message: &IncomingMessage,
        context: &BotContext,
    ) -> anyhow::Result<Option<String>> {
        if message.content.trim().is_empty() {
            return Ok(None);
        }

        let prefix = context.config_str("prefix", "[joke]");
        let user_prompt = format!(
            "Write a short joke themed around this message, but don't repeat it verbatim: \"{}\"",
            message.content.trim()
        );

        let joke = context
            .llm
            .complete(&context.text_model, JOKE_SYSTEM_PROMPT, &user_prompt)
            .await
            .map_err(|e| anyhow::anyhow!("joke completion failed: {e}"))?;

        Ok(Some(format!("{prefix} {}", joke.trim())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_is_joke_bracket() {
        let bot = JokeBot;
        let schema = bot.config_schema();
        let config = schema.validate(&serde_json::json!({})).unwrap();
        assert_eq!(config["prefix"], serde_json::json!("[joke]"));
    }

    #[test]
    fn only_declares_text_capability() {
        let bot = JokeBot;
        assert_eq!(bot.capabilities(), &[Capability::Text]);
    }
}
