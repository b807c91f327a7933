//! C6 Processor: the polling + dispatch loop per chat (§4.6). The hardest
//! component in the system — at-most-once delivery per (bot, message),
//! cold-start catch-up, self-reply suppression, and crash-safe replies are
//! all enforced here, on top of the Store's atomic primitives.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bots::{
    BotContext, BotRegistry, BotType, IncomingMessage, MediaLoad, MediaPayload,
    capability_for_media_type, media_kind_for_capability,
};
use crate::gateway::{GatewayError, GatewayMessage, WhatsAppGateway};
use crate::llm::Llm;
use crate::media::MediaPipeline;
use crate::signals::Signals;
use crate::store::{BotInstance, Inserted, ProcessedStatus, Store};

const FETCH_RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ProcessorDeps {
    pub store: Store,
    pub gateway: Arc<dyn WhatsAppGateway>,
    pub registry: Arc<BotRegistry>,
    pub llm: Arc<dyn Llm>,
    pub media_pipeline: Arc<MediaPipeline>,
    pub signals: Signals,
    pub media_semaphore: Arc<Semaphore>,
    pub text_model: Arc<str>,
    pub vision_model: Arc<str>,
    pub audio_model: Arc<str>,
    pub poll_interval: Duration,
    pub message_limit: u32,
}

pub struct Processor {
    deps: ProcessorDeps,
}

impl Processor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }

    /// Spawns one long-lived task per enabled chat (§5 "cooperative
    /// task-per-chat"). Returns the join handles so the caller can bound
    /// shutdown drain.
    pub fn spawn_all(
        &self,
        chats: Vec<(Uuid, String)>,
        shutdown: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        chats
            .into_iter()
            .map(|(chat_id, jid)| self.spawn_one(chat_id, jid, shutdown))
            .collect()
    }

    /// Spawns a poller for a single chat — used both at startup and right
    /// after a REST `POST /chats` registers a new one, without requiring a
    /// process restart.
    pub fn spawn_one(
        &self,
        chat_id: Uuid,
        chat_jid: String,
        shutdown: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let deps = self.deps.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_chat_poller(deps, chat_id, chat_jid, shutdown).await })
    }
}

/// Waits for all poller tasks to finish, forcing past the deadline per the
/// 30s hard shutdown timeout in §4.6.
pub async fn await_drain(handles: Vec<tokio::task::JoinHandle<()>>) {
    let joined = futures_join_all_with_timeout(handles, SHUTDOWN_DRAIN_TIMEOUT).await;
    if !joined {
        tracing::warn!("processor shutdown drain exceeded 30s, forcing past remaining pollers");
    }
}

async fn futures_join_all_with_timeout(
    handles: Vec<tokio::task::JoinHandle<()>>,
    timeout: Duration,
) -> bool {
    let all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    tokio::time::timeout(timeout, all).await.is_ok()
}

async fn run_chat_poller(
    deps: ProcessorDeps,
    chat_id: Uuid,
    chat_jid: String,
    shutdown: CancellationToken,
) {
    let notify = deps.signals.chat_notify(chat_id).await;

    loop {
        if let Err(e) = poll_tick(&deps, chat_id, &chat_jid).await {
            tracing::error!(chat_id = %chat_id, jid = %chat_jid, error = %e, "poll tick failed");
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(chat_id = %chat_id, "chat poller shutting down");
                break;
            }
            _ = tokio::time::sleep(deps.poll_interval) => {}
            _ = notify.notified() => {}
        }

        if shutdown.is_cancelled() {
            break;
        }
    }
}

/// One iteration of §4.6's poll tick, steps 1-6.
async fn poll_tick(deps: &ProcessorDeps, chat_id: Uuid, chat_jid: &str) -> Result<()> {
    let chat = deps.store.get_chat(chat_id).await?;
    let since = chat.last_processed_message_id.clone();
    let cold_start = since.is_none();

    let messages = match fetch_messages_with_retry(deps, chat_jid, since.as_deref()).await {
        Some(messages) => messages,
        None => return Ok(()), // non-retriable, or retries exhausted: skip this tick
    };

    if messages.is_empty() {
        return Ok(());
    }

    if cold_start {
        return catch_up(deps, chat_id, &messages).await;
    }

    let external_ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
    let fully_processed: HashSet<String> = deps
        .store
        .fully_processed_message_ids(chat_id, &external_ids)
        .await?
        .into_iter()
        .collect();

    for message in &messages {
        let pure_presence = message.content.is_empty() && message.media_type.is_none();

        if !fully_processed.contains(&message.id) && !pure_presence {
            dispatch_message(deps, chat_id, chat_jid, message).await?;
        }

        // every message was "considered" this tick even if not dispatched,
        // so the watermark advances regardless (§3 watermark definition).
        deps.store
            .advance_chat_watermark(chat_id, &message.id, message.timestamp)
            .await?;
    }

    Ok(())
}

/// Step 2: fetch with retry. `None` means the caller should skip the tick.
async fn fetch_messages_with_retry(
    deps: &ProcessorDeps,
    chat_jid: &str,
    since: Option<&str>,
) -> Option<Vec<GatewayMessage>> {
    let mut last_err: Option<GatewayError> = None;

    for attempt in 0..=FETCH_RETRY_DELAYS_MS.len() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(FETCH_RETRY_DELAYS_MS[attempt - 1])).await;
        }

        match deps
            .gateway
            .fetch_messages(chat_jid, since, deps.message_limit)
            .await
        {
            Ok(messages) => return Some(messages),
            Err(e) if e.is_retriable() && attempt < FETCH_RETRY_DELAYS_MS.len() => {
                tracing::warn!(jid = chat_jid, attempt, error = %e, "fetch_messages failed, retrying");
                last_err = Some(e);
            }
            Err(e) => {
                tracing::warn!(jid = chat_jid, error = %e, "fetch_messages failed, skipping tick");
                last_err = Some(e);
                break;
            }
        }
    }

    if let Some(e) = last_err {
        tracing::error!(jid = chat_jid, error = %e, "fetch_messages exhausted retries");
    }
    None
}

/// First-poll cold start (§4.6): consume the whole backlog without
/// dispatch, one `skipped` row per currently-enabled assignment.
async fn catch_up(deps: &ProcessorDeps, chat_id: Uuid, messages: &[GatewayMessage]) -> Result<()> {
    let assignments = deps.store.list_enabled_assignments_for_chat(chat_id).await?;

    for message in messages {
        for assignment in &assignments {
            deps.store
                .ensure_processed(assignment.bot_instance_id, chat_id, &message.id, ProcessedStatus::Skipped)
                .await?;
        }
    }

    if let Some(last) = messages.last() {
        deps.store
            .advance_chat_watermark(chat_id, &last.id, last.timestamp)
            .await?;
    }

    tracing::info!(
        chat_id = %chat_id,
        message_count = messages.len(),
        "cold start: consumed backlog without dispatch"
    );
    Ok(())
}

/// Self-reply suppression (§4.6): a message this process itself sent,
/// carrying a bot's own prefix, never gets dispatched back to that bot.
fn self_reply_suppressed(message: &GatewayMessage, bot_instance: &BotInstance) -> bool {
    if !message.is_from_me {
        return false;
    }
    match bot_instance.config.get("prefix").and_then(|v| v.as_str()) {
        Some(prefix) if !prefix.is_empty() => message.content.starts_with(prefix),
        _ => false,
    }
}

/// Step 5a/5b: snapshot enabled assignments (read-through, not cached) and
/// dispatch in priority order, one bot fully completing before the next.
async fn dispatch_message(
    deps: &ProcessorDeps,
    chat_id: Uuid,
    chat_jid: &str,
    message: &GatewayMessage,
) -> Result<()> {
    let assignments = deps.store.list_enabled_assignments_for_chat(chat_id).await?;

    for assignment in assignments {
        let bot_instance = deps.store.get_bot_instance(assignment.bot_instance_id).await?;

        let Some(bot_type) = deps.registry.get(&bot_instance.type_key) else {
            tracing::warn!(
                bot_instance_id = %bot_instance.id,
                type_key = %bot_instance.type_key,
                "unknown bot type at dispatch time, skipping"
            );
            continue;
        };

        if self_reply_suppressed(message, &bot_instance) {
            deps.store
                .ensure_processed(bot_instance.id, chat_id, &message.id, ProcessedStatus::Skipped)
                .await?;
            continue;
        }

        let (inserted, row) = deps
            .store
            .ensure_processed(bot_instance.id, chat_id, &message.id, ProcessedStatus::Pending)
            .await?;
        if inserted == Inserted::Existed {
            continue; // at-most-once: this (bot, message) pair was already claimed
        }

        dispatch_one(deps, chat_jid, message, &bot_instance, &bot_type, row.id).await?;
    }

    Ok(())
}

async fn dispatch_one(
    deps: &ProcessorDeps,
    chat_jid: &str,
    message: &GatewayMessage,
    bot_instance: &BotInstance,
    bot_type: &Arc<dyn BotType>,
    processed_row_id: Uuid,
) -> Result<()> {
    let incoming = build_incoming_message(deps, message, bot_type).await;

    let context = BotContext {
        llm: deps.llm.clone(),
        media_pipeline: deps.media_pipeline.clone(),
        config: bot_instance.config.clone(),
        text_model: deps.text_model.clone(),
        vision_model: deps.vision_model.clone(),
        audio_model: deps.audio_model.clone(),
    };

    match bot_type.process(&incoming, &context).await {
        Ok(Some(reply_text)) => {
            if let Err(e) = deps.gateway.send_text(chat_jid, &reply_text).await {
                tracing::error!(
                    bot_instance_id = %bot_instance.id,
                    external_message_id = %message.id,
                    error = %e,
                    "failed to send bot reply"
                );
                deps.store
                    .mark_processed(
                        processed_row_id,
                        ProcessedStatus::Failed,
                        None,
                        Some(&format!("send_failed: {e}")),
                    )
                    .await?;
                return Ok(());
            }
            let excerpt: String = reply_text.chars().take(200).collect();
            deps.store
                .mark_processed(processed_row_id, ProcessedStatus::Ok, Some(&excerpt), None)
                .await?;
        }
        Ok(None) => {
            deps.store
                .mark_processed(processed_row_id, ProcessedStatus::Skipped, None, None)
                .await?;
        }
        Err(e) => {
            tracing::error!(
                bot_instance_id = %bot_instance.id,
                external_message_id = %message.id,
                error = %e,
                "bot dispatch failed"
            );
            deps.store
                .mark_processed(processed_row_id, ProcessedStatus::Failed, None, Some(&e.to_string()))
                .await?;
        }
    }

    Ok(())
}

/// Pre-downloads media iff the bot type declared the matching capability
/// (§4.5 "duck-typed bot class → capability-typed interface"). A download
/// failure is handed to the bot as `MediaLoad::DownloadFailed` rather than
/// aborting dispatch, so the bot can phrase its own user-facing error.
async fn build_incoming_message(
    deps: &ProcessorDeps,
    message: &GatewayMessage,
    bot_type: &Arc<dyn BotType>,
) -> IncomingMessage {
    let wanted_capability = message
        .media_type
        .as_deref()
        .and_then(capability_for_media_type)
        .filter(|capability| bot_type.capabilities().contains(capability));

    let media = match wanted_capability {
        Some(capability) => {
            let _permit = deps
                .media_semaphore
                .acquire()
                .await
                .expect("media semaphore is never closed");
            Some(match deps.gateway.download_media(&message.id).await {
                Ok((bytes, content_type)) => MediaLoad::Loaded(MediaPayload {
                    kind: media_kind_for_capability(capability),
                    bytes,
                    content_type,
                }),
                Err(e) => MediaLoad::DownloadFailed {
                    kind: media_kind_for_capability(capability),
                    error: e.to_string(),
                },
            })
        }
        None => None,
    };

    IncomingMessage {
        external_id: message.id.clone(),
        sender_jid: message.sender_jid.clone(),
        is_from_me: message.is_from_me,
        timestamp: message.timestamp,
        content: message.content.clone(),
        media,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotRegistry;
    use crate::gateway::GatewayChat;
    use crate::llm::LlmError;
    use crate::store::ChatKind;
    use forge::testing::*;
    use std::sync::Mutex as StdMutex;

    /// Records every LLM call and gateway send into one shared, ordered log
    /// so a test can assert sequencing across both fakes, not just counts.
    type EventLog = Arc<StdMutex<Vec<String>>>;

    struct FakeLlm {
        log: EventLog,
        reply: String,
    }

    #[async_trait::async_trait]
    impl Llm for FakeLlm {
        async fn complete(&self, _model: &str, _system: &str, _user_text: &str) -> Result<String, LlmError> {
            self.log.lock().unwrap().push("llm:start".to_string());
            // a real HTTP round-trip is never instantaneous; yielding here
            // means a regression to concurrent dispatch would interleave
            // events instead of producing the fully-sequential log below.
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().unwrap().push("llm:done".to_string());
            Ok(self.reply.clone())
        }

        async fn complete_vision(
            &self,
            _model: &str,
            _system: &str,
            _user_text: &str,
            _image_bytes: &[u8],
        ) -> Result<String, LlmError> {
            Err(LlmError::Unsupported("not used by this test".to_string()))
        }

        async fn transcribe(
            &self,
            _model: &str,
            _audio_bytes: &[u8],
            _hint_language: Option<&str>,
        ) -> Result<String, LlmError> {
            Err(LlmError::Unsupported("not used by this test".to_string()))
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        log: EventLog,
    }

    #[async_trait::async_trait]
    impl WhatsAppGateway for FakeGateway {
        async fn list_chats(&self) -> Result<Vec<GatewayChat>, GatewayError> {
            Ok(Vec::new())
        }
        async fn fetch_messages(
            &self,
            _chat_jid: &str,
            _since_id: Option<&str>,
            _limit: u32,
        ) -> Result<Vec<GatewayMessage>, GatewayError> {
            Ok(Vec::new())
        }
        async fn send_text(&self, _chat_jid: &str, text: &str) -> Result<String, GatewayError> {
            self.log.lock().unwrap().push(format!("gateway:send:{text}"));
            Ok(uuid::Uuid::new_v4().to_string())
        }
        async fn download_media(&self, _message_id: &str) -> Result<(Vec<u8>, String), GatewayError> {
            Err(GatewayError::NotFound("no media in this test gateway".to_string()))
        }
    }

    async fn setup() -> (forge::testing::IsolatedTestDb, Store) {
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("processor").await.unwrap();
        db.run_sql(&forge::get_internal_sql()).await.unwrap();
        db.run_sql(include_str!("../../migrations/0001_init.sql")).await.unwrap();
        let pool = db.pool().clone();
        (db, Store::new(pool))
    }

    fn test_deps(store: Store, gateway: Arc<dyn WhatsAppGateway>, llm: Arc<dyn Llm>) -> ProcessorDeps {
        ProcessorDeps {
            store,
            gateway,
            registry: Arc::new(BotRegistry::with_builtins()),
            llm,
            media_pipeline: Arc::new(MediaPipeline::new()),
            signals: Signals::new(),
            media_semaphore: Arc::new(Semaphore::new(8)),
            text_model: Arc::from("test-model"),
            vision_model: Arc::from("test-vision-model"),
            audio_model: Arc::from("test-audio-model"),
            poll_interval: Duration::from_secs(5),
            message_limit: 20,
        }
    }

    fn text_message(id: &str, content: &str) -> GatewayMessage {
        GatewayMessage {
            id: id.to_string(),
            sender_jid: "123@s.whatsapp.net".to_string(),
            is_from_me: false,
            timestamp: chrono::Utc::now(),
            content: content.to_string(),
            media_type: None,
            mime_type: None,
        }
    }

    /// Scenario 6 (§8): two bots assigned at different priorities to the
    /// same chat each reply once, in priority order, and the first reply's
    /// send completes before the second bot's dispatch even starts.
    #[tokio::test]
    async fn dispatch_message_respects_priority_and_is_sequential() {
        let (_db, store) = setup().await;
        let chat = store.create_chat("111@g.us", "Test Chat", ChatKind::Private).await.unwrap();
        let low = store
            .create_bot_instance("joke", "Low priority", None, serde_json::json!({"prefix": "[low]"}))
            .await
            .unwrap();
        let high = store
            .create_bot_instance("joke", "High priority", None, serde_json::json!({"prefix": "[high]"}))
            .await
            .unwrap();
        store.create_assignment(chat.id, low.id, 10).await.unwrap();
        store.create_assignment(chat.id, high.id, 0).await.unwrap();

        let log: EventLog = Arc::new(StdMutex::new(Vec::new()));
        let gateway = Arc::new(FakeGateway { log: log.clone() });
        let llm = Arc::new(FakeLlm { log: log.clone(), reply: "why did the chicken cross the road".to_string() });
        let deps = test_deps(store, gateway, llm);

        let message = text_message("m1", "tell me something");
        dispatch_message(&deps, chat.id, &chat.jid, &message).await.unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "llm:start".to_string(),
                "llm:done".to_string(),
                "gateway:send:[high] why did the chicken cross the road".to_string(),
                "llm:start".to_string(),
                "llm:done".to_string(),
                "gateway:send:[low] why did the chicken cross the road".to_string(),
            ],
            "the higher-priority bot's full round trip, including its send, must finish before the lower-priority bot's dispatch starts"
        );
    }

    /// §3/§4.6: a (bot, message) pair is dispatched at most once even if the
    /// poll loop observes the same message again (e.g. after a retry window).
    #[tokio::test]
    async fn dispatch_message_is_at_most_once_per_bot() {
        let (_db, store) = setup().await;
        let chat = store.create_chat("222@g.us", "Test Chat", ChatKind::Private).await.unwrap();
        let bot = store
            .create_bot_instance("joke", "Bot", None, serde_json::json!({}))
            .await
            .unwrap();
        store.create_assignment(chat.id, bot.id, 0).await.unwrap();

        let log: EventLog = Arc::new(StdMutex::new(Vec::new()));
        let gateway = Arc::new(FakeGateway { log: log.clone() });
        let llm = Arc::new(FakeLlm { log: log.clone(), reply: "knock knock".to_string() });
        let deps = test_deps(store, gateway, llm);

        let message = text_message("m1", "tell me something");
        dispatch_message(&deps, chat.id, &chat.jid, &message).await.unwrap();
        dispatch_message(&deps, chat.id, &chat.jid, &message).await.unwrap();

        let sends = log.lock().unwrap().iter().filter(|e| e.starts_with("gateway:send")).count();
        assert_eq!(sends, 1, "the same (bot, message) pair must never be dispatched twice");
    }

    /// §4.6 cold start: the first poll for a chat consumes its whole backlog
    /// as `Skipped` without dispatching anything to any bot.
    #[tokio::test]
    async fn catch_up_marks_backlog_skipped_without_dispatch() {
        let (_db, store) = setup().await;
        let chat = store.create_chat("333@g.us", "Test Chat", ChatKind::Private).await.unwrap();
        let bot = store
            .create_bot_instance("joke", "Bot", None, serde_json::json!({}))
            .await
            .unwrap();
        store.create_assignment(chat.id, bot.id, 0).await.unwrap();

        let messages = vec![text_message("m1", "first"), text_message("m2", "second")];
        catch_up(&test_deps_for_store(&store), chat.id, &messages).await.unwrap();

        let processed = store.list_processed_for_chat(chat.id, 10).await.unwrap();
        assert_eq!(processed.len(), 2);
        assert!(processed.iter().all(|p| p.status == ProcessedStatus::Skipped));

        let refreshed = store.get_chat(chat.id).await.unwrap();
        assert_eq!(refreshed.last_processed_message_id.as_deref(), Some("m2"));
    }

    fn test_deps_for_store(store: &Store) -> ProcessorDeps {
        let log: EventLog = Arc::new(StdMutex::new(Vec::new()));
        test_deps(
            store.clone(),
            Arc::new(FakeGateway { log: log.clone() }),
            Arc::new(FakeLlm { log, reply: String::new() }),
        )
    }

    #[test]
    fn pure_presence_messages_are_recognized() {
        let msg = GatewayMessage {
            id: "m1".to_string(),
            sender_jid: "123@s.whatsapp.net".to_string(),
            is_from_me: false,
            timestamp: chrono::Utc::now(),
            content: String::new(),
            media_type: None,
            mime_type: None,
        };
        assert!(msg.content.is_empty() && msg.media_type.is_none());
    }

    #[test]
    fn self_reply_suppression_requires_own_prefix_and_from_me() {
        let bot = BotInstance {
            id: Uuid::new_v4(),
            type_key: "translation".to_string(),
            name: "t".to_string(),
            description: None,
            config: serde_json::json!({"prefix": "[ai]"}),
            enabled: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let from_me_with_prefix = GatewayMessage {
            id: "m1".to_string(),
            sender_jid: "me".to_string(),
            is_from_me: true,
            timestamp: chrono::Utc::now(),
            content: "[ai] translated text".to_string(),
            media_type: None,
            mime_type: None,
        };
        assert!(self_reply_suppressed(&from_me_with_prefix, &bot));

        let from_me_without_prefix = GatewayMessage {
            content: "unrelated note to self".to_string(),
            ..from_me_with_prefix.clone()
        };
        assert!(!self_reply_suppressed(&from_me_without_prefix, &bot));

        let from_other_with_prefix = GatewayMessage {
            is_from_me: false,
            ..from_me_with_prefix
        };
        assert!(!self_reply_suppressed(&from_other_with_prefix, &bot));
    }
}
