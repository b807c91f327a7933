//! C4 Store: typed, transactional access to every persisted entity.
//!
//! All fallible operations return `anyhow::Result` per the crate's error
//! convention; the handful of callers needing to match on outcome (the
//! at-most-once upsert, duplicate rejection) get small enums instead of
//! booleans so call sites read naturally.

pub mod models;

pub use models::*;

use chrono::{DateTime, Utc};
use forge::prelude::*;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New,
    Existed,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Other(e.into())
    }
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ForgeError::Internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    // ---------------------------------------------------------------- chats

    pub async fn create_chat(
        &self,
        jid: &str,
        name: &str,
        kind: ChatKind,
    ) -> Result<Chat, StoreError> {
        let existing = sqlx::query_scalar!("SELECT id FROM chats WHERE jid = $1", jid)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Duplicate(format!("chat {jid} already registered")));
        }

        let chat = sqlx::query_as!(
            Chat,
            r#"
            INSERT INTO chats (jid, name, kind)
            VALUES ($1, $2, $3)
            RETURNING id, jid, name, kind as "kind: ChatKind", last_message_at,
                      last_processed_message_id, enabled, created_at, updated_at
            "#,
            jid,
            name,
            kind as ChatKind,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(chat)
    }

    pub async fn get_chat(&self, id: Uuid) -> Result<Chat, StoreError> {
        sqlx::query_as!(
            Chat,
            r#"
            SELECT id, jid, name, kind as "kind: ChatKind", last_message_at,
                   last_processed_message_id, enabled, created_at, updated_at
            FROM chats WHERE id = $1
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("chat {id}")))
    }

    pub async fn get_chat_by_jid(&self, jid: &str) -> Result<Option<Chat>, StoreError> {
        let chat = sqlx::query_as!(
            Chat,
            r#"
            SELECT id, jid, name, kind as "kind: ChatKind", last_message_at,
                   last_processed_message_id, enabled, created_at, updated_at
            FROM chats WHERE jid = $1
            "#,
            jid
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(chat)
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let chats = sqlx::query_as!(
            Chat,
            r#"
            SELECT id, jid, name, kind as "kind: ChatKind", last_message_at,
                   last_processed_message_id, enabled, created_at, updated_at
            FROM chats ORDER BY created_at
            "#
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(chats)
    }

    pub async fn list_enabled_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let chats = sqlx::query_as!(
            Chat,
            r#"
            SELECT id, jid, name, kind as "kind: ChatKind", last_message_at,
                   last_processed_message_id, enabled, created_at, updated_at
            FROM chats WHERE enabled = true ORDER BY created_at
            "#
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(chats)
    }

    pub async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query!("DELETE FROM chats WHERE id = $1", id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("chat {id}")));
        }
        Ok(())
    }

    /// Idempotent: only applies if `new_last_message_at` is newer than (or
    /// equal to) the current value, per the monotonic watermark invariant.
    pub async fn advance_chat_watermark(
        &self,
        chat_id: Uuid,
        new_last_processed_id: &str,
        new_last_message_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE chats
            SET last_processed_message_id = $2,
                last_message_at = $3,
                updated_at = now()
            WHERE id = $1
              AND (last_message_at IS NULL OR last_message_at <= $3)
            "#,
            chat_id,
            new_last_processed_id,
            new_last_message_at,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_last_message_at(
        &self,
        chat_id: Uuid,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE chats
            SET last_message_at = $2, updated_at = now()
            WHERE id = $1
              AND (last_message_at IS NULL OR last_message_at < $2)
            "#,
            chat_id,
            observed_at,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_chat_from_sync(
        &self,
        jid: &str,
        name: &str,
        kind: ChatKind,
    ) -> Result<Chat, StoreError> {
        let chat = sqlx::query_as!(
            Chat,
            r#"
            INSERT INTO chats (jid, name, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (jid) DO UPDATE SET name = EXCLUDED.name, updated_at = now()
            RETURNING id, jid, name, kind as "kind: ChatKind", last_message_at,
                      last_processed_message_id, enabled, created_at, updated_at
            "#,
            jid,
            name,
            kind as ChatKind,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(chat)
    }

    // --------------------------------------------------------- bot instances

    pub async fn create_bot_instance(
        &self,
        type_key: &str,
        name: &str,
        description: Option<&str>,
        config: serde_json::Value,
    ) -> Result<BotInstance, StoreError> {
        let bot = sqlx::query_as!(
            BotInstance,
            r#"
            INSERT INTO bot_instances (type_key, name, description, config)
            VALUES ($1, $2, $3, $4)
            RETURNING id, type_key, name, description, config, enabled, created_at, updated_at
            "#,
            type_key,
            name,
            description,
            config,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(bot)
    }

    pub async fn get_bot_instance(&self, id: Uuid) -> Result<BotInstance, StoreError> {
        sqlx::query_as!(
            BotInstance,
            r#"
            SELECT id, type_key, name, description, config, enabled, created_at, updated_at
            FROM bot_instances WHERE id = $1
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("bot instance {id}")))
    }

    pub async fn list_bot_instances(&self) -> Result<Vec<BotInstance>, StoreError> {
        let bots = sqlx::query_as!(
            BotInstance,
            r#"
            SELECT id, type_key, name, description, config, enabled, created_at, updated_at
            FROM bot_instances ORDER BY created_at
            "#
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(bots)
    }

    pub async fn update_bot_instance(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<Option<&str>>,
        config: Option<serde_json::Value>,
        enabled: Option<bool>,
    ) -> Result<BotInstance, StoreError> {
        let mut bot = self.get_bot_instance(id).await?;
        if let Some(name) = name {
            bot.name = name.to_string();
        }
        if let Some(description) = description {
            bot.description = description.map(str::to_string);
        }
        if let Some(config) = config {
            bot.config = config;
        }
        if let Some(enabled) = enabled {
            bot.enabled = enabled;
        }

        let bot = sqlx::query_as!(
            BotInstance,
            r#"
            UPDATE bot_instances
            SET name = $2, description = $3, config = $4, enabled = $5, updated_at = now()
            WHERE id = $1
            RETURNING id, type_key, name, description, config, enabled, created_at, updated_at
            "#,
            id,
            bot.name,
            bot.description,
            bot.config,
            bot.enabled,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(bot)
    }

    pub async fn delete_bot_instance(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query!("DELETE FROM bot_instances WHERE id = $1", id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("bot instance {id}")));
        }
        Ok(())
    }

    // -------------------------------------------------------- assignments

    pub async fn create_assignment(
        &self,
        chat_id: Uuid,
        bot_instance_id: Uuid,
        priority: i32,
    ) -> Result<ChatBotAssignment, StoreError> {
        // referential checks first so the caller gets NotFound rather than a
        // raw foreign-key violation
        self.get_chat(chat_id).await?;
        self.get_bot_instance(bot_instance_id).await?;

        let existing = sqlx::query_scalar!(
            "SELECT id FROM chat_bot_assignments WHERE chat_id = $1 AND bot_instance_id = $2",
            chat_id,
            bot_instance_id,
        )
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(StoreError::Duplicate(format!(
                "bot {bot_instance_id} already assigned to chat {chat_id}"
            )));
        }

        let assignment = sqlx::query_as!(
            ChatBotAssignment,
            r#"
            INSERT INTO chat_bot_assignments (chat_id, bot_instance_id, priority)
            VALUES ($1, $2, $3)
            RETURNING id, chat_id, bot_instance_id, priority, enabled, created_at, updated_at
            "#,
            chat_id,
            bot_instance_id,
            priority,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(assignment)
    }

    pub async fn list_assignments_for_chat(
        &self,
        chat_id: Uuid,
    ) -> Result<Vec<ChatBotAssignment>, StoreError> {
        let assignments = sqlx::query_as!(
            ChatBotAssignment,
            r#"
            SELECT id, chat_id, bot_instance_id, priority, enabled, created_at, updated_at
            FROM chat_bot_assignments
            WHERE chat_id = $1
            ORDER BY priority ASC, bot_instance_id ASC
            "#,
            chat_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(assignments)
    }

    /// Read-through snapshot of the currently-enabled assignments for a
    /// chat, in dispatch order. Called once per surviving message so a
    /// mid-tick disable is honored at the next message (§4.6 step 5a).
    pub async fn list_enabled_assignments_for_chat(
        &self,
        chat_id: Uuid,
    ) -> Result<Vec<ChatBotAssignment>, StoreError> {
        let assignments = sqlx::query_as!(
            ChatBotAssignment,
            r#"
            SELECT a.id, a.chat_id, a.bot_instance_id, a.priority, a.enabled, a.created_at, a.updated_at
            FROM chat_bot_assignments a
            JOIN bot_instances b ON b.id = a.bot_instance_id
            WHERE a.chat_id = $1 AND a.enabled = true AND b.enabled = true
            ORDER BY a.priority ASC, a.bot_instance_id ASC
            "#,
            chat_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(assignments)
    }

    /// Reverse lookup of `list_assignments_for_chat`: every chat this bot
    /// instance is currently assigned to, regardless of either side's
    /// `enabled` flag. Used to wake every affected poller when the instance
    /// itself is disabled, re-enabled, or reconfigured (§4.8).
    pub async fn list_chat_ids_for_bot_instance(&self, bot_instance_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar!(
            "SELECT chat_id FROM chat_bot_assignments WHERE bot_instance_id = $1",
            bot_instance_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn update_assignment(
        &self,
        chat_id: Uuid,
        bot_instance_id: Uuid,
        priority: Option<i32>,
        enabled: Option<bool>,
    ) -> Result<ChatBotAssignment, StoreError> {
        let current = sqlx::query_as!(
            ChatBotAssignment,
            r#"
            SELECT id, chat_id, bot_instance_id, priority, enabled, created_at, updated_at
            FROM chat_bot_assignments WHERE chat_id = $1 AND bot_instance_id = $2
            "#,
            chat_id,
            bot_instance_id
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("assignment {chat_id}/{bot_instance_id}")))?;

        let new_priority = priority.unwrap_or(current.priority);
        let new_enabled = enabled.unwrap_or(current.enabled);

        let assignment = sqlx::query_as!(
            ChatBotAssignment,
            r#"
            UPDATE chat_bot_assignments
            SET priority = $3, enabled = $4, updated_at = now()
            WHERE chat_id = $1 AND bot_instance_id = $2
            RETURNING id, chat_id, bot_instance_id, priority, enabled, created_at, updated_at
            "#,
            chat_id,
            bot_instance_id,
            new_priority,
            new_enabled,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(assignment)
    }

    pub async fn delete_assignment(
        &self,
        chat_id: Uuid,
        bot_instance_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query!(
            "DELETE FROM chat_bot_assignments WHERE chat_id = $1 AND bot_instance_id = $2",
            chat_id,
            bot_instance_id
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "assignment {chat_id}/{bot_instance_id}"
            )));
        }
        Ok(())
    }

    // ----------------------------------------------------- processed messages

    /// The at-most-once serialization point: `ON CONFLICT DO NOTHING` on
    /// (bot_instance_id, external_message_id), then a follow-up read tells
    /// the caller whether this call won the race.
    pub async fn ensure_processed(
        &self,
        bot_instance_id: Uuid,
        chat_id: Uuid,
        external_message_id: &str,
        status: ProcessedStatus,
    ) -> Result<(Inserted, ProcessedMessage), StoreError> {
        let inserted = sqlx::query_as!(
            ProcessedMessage,
            r#"
            INSERT INTO processed_messages (bot_instance_id, chat_id, external_message_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (bot_instance_id, external_message_id) DO NOTHING
            RETURNING id, bot_instance_id, chat_id, external_message_id,
                      status as "status: ProcessedStatus", response_excerpt, error_kind,
                      processed_at, created_at, updated_at
            "#,
            bot_instance_id,
            chat_id,
            external_message_id,
            status as ProcessedStatus,
        )
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((Inserted::New, row));
        }

        let existing = sqlx::query_as!(
            ProcessedMessage,
            r#"
            SELECT id, bot_instance_id, chat_id, external_message_id,
                   status as "status: ProcessedStatus", response_excerpt, error_kind,
                   processed_at, created_at, updated_at
            FROM processed_messages
            WHERE bot_instance_id = $1 AND external_message_id = $2
            "#,
            bot_instance_id,
            external_message_id,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((Inserted::Existed, existing))
    }

    pub async fn mark_processed(
        &self,
        id: Uuid,
        status: ProcessedStatus,
        response_excerpt: Option<&str>,
        error_kind: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE processed_messages
            SET status = $2, response_excerpt = $3, error_kind = $4,
                processed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
            id,
            status as ProcessedStatus,
            response_excerpt,
            error_kind,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Which of these external ids already has a terminal/pending row for
    /// every currently-enabled bot on this chat — the cheap pre-check in
    /// step 4 of the poll tick.
    pub async fn fully_processed_message_ids(
        &self,
        chat_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let enabled_bot_count = sqlx::query_scalar!(
            r#"
            SELECT COUNT(*) as "count!"
            FROM chat_bot_assignments a
            JOIN bot_instances b ON b.id = a.bot_instance_id
            WHERE a.chat_id = $1 AND a.enabled = true AND b.enabled = true
            "#,
            chat_id
        )
        .fetch_one(&self.pool)
        .await?;

        if enabled_bot_count == 0 {
            // no bots enabled: nothing can be "fully processed" by definition,
            // so every message survives the filter and is consumed untouched.
            return Ok(Vec::new());
        }

        let rows = sqlx::query!(
            r#"
            SELECT external_message_id, COUNT(*) as "count!"
            FROM processed_messages
            WHERE chat_id = $1 AND external_message_id = ANY($2)
            GROUP BY external_message_id
            HAVING COUNT(*) >= $3
            "#,
            chat_id,
            external_ids,
            enabled_bot_count,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.external_message_id).collect())
    }

    pub async fn list_processed_for_chat(
        &self,
        chat_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ProcessedMessage>, StoreError> {
        let rows = sqlx::query_as!(
            ProcessedMessage,
            r#"
            SELECT id, bot_instance_id, chat_id, external_message_id,
                   status as "status: ProcessedStatus", response_excerpt, error_kind,
                   processed_at, created_at, updated_at
            FROM processed_messages
            WHERE chat_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            chat_id,
            limit
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Startup reconciliation (C10 step 3): anything left `pending` across a
    /// restart was interrupted mid-dispatch and must never be re-invoked.
    pub async fn reconcile_interrupted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query!(
            r#"
            UPDATE processed_messages
            SET status = 'failed', error_kind = 'InterruptedAtShutdown',
                processed_at = now(), updated_at = now()
            WHERE status = 'pending'
            "#
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------ schedules

    pub async fn create_schedule(
        &self,
        kind: ScheduleKind,
        fire_at: Option<DateTime<Utc>>,
        expression: Option<&str>,
        timezone: &str,
        target_jid: &str,
        content: &str,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule, StoreError> {
        let schedule = sqlx::query_as!(
            Schedule,
            r#"
            INSERT INTO schedules (kind, fire_at, expression, timezone, target_jid, content, next_fire_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, kind as "kind: ScheduleKind", fire_at, expression, timezone,
                      target_jid, content, enabled, next_fire_at, last_fire_at,
                      last_result as "last_result: ScheduleResult", created_at, updated_at
            "#,
            kind as ScheduleKind,
            fire_at,
            expression,
            timezone,
            target_jid,
            content,
            next_fire_at,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Schedule, StoreError> {
        sqlx::query_as!(
            Schedule,
            r#"
            SELECT id, kind as "kind: ScheduleKind", fire_at, expression, timezone,
                   target_jid, content, enabled, next_fire_at, last_fire_at,
                   last_result as "last_result: ScheduleResult", created_at, updated_at
            FROM schedules WHERE id = $1
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query_as!(
            Schedule,
            r#"
            SELECT id, kind as "kind: ScheduleKind", fire_at, expression, timezone,
                   target_jid, content, enabled, next_fire_at, last_fire_at,
                   last_result as "last_result: ScheduleResult", created_at, updated_at
            FROM schedules ORDER BY created_at
            "#
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_schedule(
        &self,
        id: Uuid,
        expression: Option<&str>,
        timezone: Option<&str>,
        target_jid: Option<&str>,
        content: Option<&str>,
        enabled: Option<bool>,
        next_fire_at: Option<Option<DateTime<Utc>>>,
    ) -> Result<Schedule, StoreError> {
        let current = self.get_schedule(id).await?;
        let expression = expression.map(str::to_string).or(current.expression);
        let timezone = timezone.unwrap_or(&current.timezone).to_string();
        let target_jid = target_jid.unwrap_or(&current.target_jid).to_string();
        let content = content.unwrap_or(&current.content).to_string();
        let enabled = enabled.unwrap_or(current.enabled);
        let next_fire_at = next_fire_at.unwrap_or(current.next_fire_at);

        let schedule = sqlx::query_as!(
            Schedule,
            r#"
            UPDATE schedules
            SET expression = $2, timezone = $3, target_jid = $4, content = $5,
                enabled = $6, next_fire_at = $7, updated_at = now()
            WHERE id = $1
            RETURNING id, kind as "kind: ScheduleKind", fire_at, expression, timezone,
                      target_jid, content, enabled, next_fire_at, last_fire_at,
                      last_result as "last_result: ScheduleResult", created_at, updated_at
            "#,
            id,
            expression,
            timezone,
            target_jid,
            content,
            enabled,
            next_fire_at,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query!("DELETE FROM schedules WHERE id = $1", id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Due, enabled schedules oldest-first, row-locked so two scheduler
    /// ticks (there is only ever one in this process, but the query is
    /// written to the same standard as the rest of the store) can't double
    /// fire the same row.
    pub async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query_as!(
            Schedule,
            r#"
            SELECT id, kind as "kind: ScheduleKind", fire_at, expression, timezone,
                   target_jid, content, enabled, next_fire_at, last_fire_at,
                   last_result as "last_result: ScheduleResult", created_at, updated_at
            FROM schedules
            WHERE enabled = true AND next_fire_at <= $1
            ORDER BY next_fire_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            "#,
            now
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_schedule_fire(
        &self,
        id: Uuid,
        fired_at: DateTime<Utc>,
        result: ScheduleResult,
        next_fire_at: Option<DateTime<Utc>>,
        disable: bool,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE schedules
            SET last_fire_at = $2, last_result = $3, next_fire_at = $4,
                enabled = CASE WHEN $5 THEN false ELSE enabled END,
                updated_at = now()
            WHERE id = $1
            "#,
            id,
            fired_at,
            result as ScheduleResult,
            next_fire_at,
            disable,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----------------------------------------------------------------- users

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as!(
            User,
            r#"
            SELECT id, username, password_hash, created_at, updated_at
            FROM users WHERE username = $1
            "#,
            username
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let existing = self.get_user_by_username(username).await?;
        if existing.is_some() {
            return Err(StoreError::Duplicate(format!("user {username}")));
        }
        let user = sqlx::query_as!(
            User,
            r#"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            RETURNING id, username, password_hash, created_at, updated_at
            "#,
            username,
            password_hash,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn count_users(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar!("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge::testing::*;

    async fn setup() -> (IsolatedTestDb, Store) {
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("store").await.unwrap();
        db.run_sql(&forge::get_internal_sql()).await.unwrap();
        db.run_sql(include_str!("../../migrations/0001_init.sql")).await.unwrap();
        let pool = db.pool().clone();
        (db, Store::new(pool))
    }

    async fn make_chat(store: &Store, jid: &str) -> Chat {
        store.create_chat(jid, "Test Chat", ChatKind::Private).await.unwrap()
    }

    async fn make_bot(store: &Store, type_key: &str) -> BotInstance {
        store
            .create_bot_instance(type_key, "Test Bot", None, serde_json::json!({}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ensure_processed_is_at_most_once() {
        let (_db, store) = setup().await;
        let chat = make_chat(&store, "111@g.us").await;
        let bot = make_bot(&store, "translation").await;

        let (first, row) = store
            .ensure_processed(bot.id, chat.id, "msg-1", ProcessedStatus::Pending)
            .await
            .unwrap();
        assert_eq!(first, Inserted::New);
        assert_eq!(row.status, ProcessedStatus::Pending);

        let (second, row2) = store
            .ensure_processed(bot.id, chat.id, "msg-1", ProcessedStatus::Pending)
            .await
            .unwrap();
        assert_eq!(second, Inserted::Existed);
        assert_eq!(row2.id, row.id);

        let count: i64 = sqlx::query_scalar!("SELECT COUNT(*) as \"count!\" FROM processed_messages")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn advance_chat_watermark_is_monotonic() {
        let (_db, store) = setup().await;
        let chat = make_chat(&store, "222@g.us").await;

        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);

        store.advance_chat_watermark(chat.id, "msg-later", later).await.unwrap();
        store.advance_chat_watermark(chat.id, "msg-earlier", earlier).await.unwrap();

        let refreshed = store.get_chat(chat.id).await.unwrap();
        assert_eq!(refreshed.last_processed_message_id.as_deref(), Some("msg-later"));
        assert_eq!(refreshed.last_message_at, Some(later));
    }

    #[tokio::test]
    async fn fully_processed_message_ids_requires_every_enabled_bot() {
        let (_db, store) = setup().await;
        let chat = make_chat(&store, "333@g.us").await;
        let bot_a = make_bot(&store, "translation").await;
        let bot_b = make_bot(&store, "joke").await;
        store.create_assignment(chat.id, bot_a.id, 0).await.unwrap();
        store.create_assignment(chat.id, bot_b.id, 0).await.unwrap();

        store
            .ensure_processed(bot_a.id, chat.id, "msg-1", ProcessedStatus::Ok)
            .await
            .unwrap();

        let ids = vec!["msg-1".to_string()];
        let fully = store.fully_processed_message_ids(chat.id, &ids).await.unwrap();
        assert!(fully.is_empty(), "only one of two enabled bots has processed msg-1");

        store
            .ensure_processed(bot_b.id, chat.id, "msg-1", ProcessedStatus::Skipped)
            .await
            .unwrap();

        let fully = store.fully_processed_message_ids(chat.id, &ids).await.unwrap();
        assert_eq!(fully, vec!["msg-1".to_string()]);
    }

    #[tokio::test]
    async fn list_due_schedules_respects_enabled_and_next_fire_at() {
        let (_db, store) = setup().await;
        let now = Utc::now();

        let due = store
            .create_schedule(
                ScheduleKind::Once,
                Some(now),
                None,
                "UTC",
                "123@s.whatsapp.net",
                "ping",
                Some(now - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        let not_yet = store
            .create_schedule(
                ScheduleKind::Once,
                Some(now),
                None,
                "UTC",
                "456@s.whatsapp.net",
                "ping",
                Some(now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let disabled = store
            .create_schedule(
                ScheduleKind::Once,
                Some(now),
                None,
                "UTC",
                "789@s.whatsapp.net",
                "ping",
                Some(now - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        store
            .update_schedule(disabled.id, None, None, None, None, Some(false), None)
            .await
            .unwrap();

        let rows = store.list_due_schedules(now).await.unwrap();
        let due_ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        assert!(due_ids.contains(&due.id));
        assert!(!due_ids.contains(&not_yet.id));
        assert!(!due_ids.contains(&disabled.id));
    }

    #[tokio::test]
    async fn create_user_rejects_duplicate_username() {
        let (_db, store) = setup().await;
        assert_eq!(store.count_users().await.unwrap(), 0);

        store.create_user("admin", "hash-1").await.unwrap();
        assert_eq!(store.count_users().await.unwrap(), 1);

        let err = store.create_user("admin", "hash-2").await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }
}
