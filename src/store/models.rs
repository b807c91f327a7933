use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Chat {
    pub id: Uuid,
    pub jid: String,
    pub name: String,
    pub kind: ChatKind,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_processed_message_id: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct BotInstance {
    pub id: Uuid,
    pub type_key: String,
    pub name: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct ChatBotAssignment {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub bot_instance_id: Uuid,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[forge::forge_enum]
pub enum ProcessedStatus {
    Pending,
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct ProcessedMessage {
    pub id: Uuid,
    pub bot_instance_id: Uuid,
    pub chat_id: Uuid,
    pub external_message_id: String,
    pub status: ProcessedStatus,
    pub response_excerpt: Option<String>,
    pub error_kind: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[forge::forge_enum]
pub enum ScheduleKind {
    Once,
    Cron,
}

#[forge::forge_enum]
pub enum ScheduleResult {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Schedule {
    pub id: Uuid,
    pub kind: ScheduleKind,
    pub fire_at: Option<DateTime<Utc>>,
    pub expression: Option<String>,
    pub timezone: String,
    pub target_jid: String,
    pub content: String,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub last_result: Option<ScheduleResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
