use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::Response;
use axum::{Json, extract::State as AxumState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::gateway::GatewayChatKind;
use crate::scheduler;
use crate::store::{Chat, ChatBotAssignment, ChatKind, ProcessedMessage, Schedule, ScheduleKind};

pub async fn require_bearer_token(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    state.auth.verify_token(token).map_err(|_| ApiError::Unauthorized)?;

    Ok(next.run(req).await)
}

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    token: String,
}

pub async fn login(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .store
        .get_user_by_username(&req.username)
        .await?
        .ok_or(ApiError::BadCredentials)?;

    if !state.auth.verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::BadCredentials);
    }

    let token = state.auth.issue_token(user.id)?;
    Ok(Json(LoginResponse { token }))
}

// ------------------------------------------------------------------ chats

fn gateway_kind_to_store(kind: GatewayChatKind) -> ChatKind {
    match kind {
        GatewayChatKind::Private => ChatKind::Private,
        GatewayChatKind::Group => ChatKind::Group,
        GatewayChatKind::Channel => ChatKind::Channel,
    }
}

pub async fn list_chats(AxumState(state): AxumState<Arc<AppState>>) -> Result<Json<Vec<Chat>>, ApiError> {
    Ok(Json(state.store.list_chats().await?))
}

#[derive(Deserialize)]
pub struct CreateChatRequest {
    jid: String,
}

pub async fn create_chat(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    if req.jid.trim().is_empty() {
        return Err(ApiError::BadInput("jid must not be empty".to_string()));
    }

    let gateway_chats = state.gateway.list_chats().await?;
    let found = gateway_chats
        .into_iter()
        .find(|c| c.jid == req.jid)
        .ok_or_else(|| ApiError::NotFound(format!("gateway has no chat with jid {}", req.jid)))?;

    let chat = state
        .store
        .create_chat(&found.jid, &found.name, gateway_kind_to_store(found.kind))
        .await?;
    if let Some(last_activity) = found.last_activity {
        state.store.touch_last_message_at(chat.id, last_activity).await?;
    }

    let _ = state.processor.spawn_one(chat.id, chat.jid.clone(), &state.shutdown);
    Ok(Json(chat))
}

#[derive(Serialize)]
pub struct SyncResponse {
    synced: usize,
    new_chats: usize,
}

pub async fn sync_chats(AxumState(state): AxumState<Arc<AppState>>) -> Result<Json<SyncResponse>, ApiError> {
    let gateway_chats = state.gateway.list_chats().await?;
    let mut new_chats = 0;

    for gc in &gateway_chats {
        let existed = state.store.get_chat_by_jid(&gc.jid).await?.is_some();
        let chat = state
            .store
            .upsert_chat_from_sync(&gc.jid, &gc.name, gateway_kind_to_store(gc.kind))
            .await?;
        if let Some(last_activity) = gc.last_activity {
            state.store.touch_last_message_at(chat.id, last_activity).await?;
        }
        if !existed {
            new_chats += 1;
            let _ = state.processor.spawn_one(chat.id, chat.jid.clone(), &state.shutdown);
        }
    }

    Ok(Json(SyncResponse {
        synced: gateway_chats.len(),
        new_chats,
    }))
}

pub async fn delete_chat(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(), ApiError> {
    state.store.delete_chat(id).await?;
    Ok(())
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    limit: Option<i64>,
}

pub async fn chat_messages(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<ProcessedMessage>>, ApiError> {
    state.store.get_chat(id).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.list_processed_for_chat(id, limit).await?))
}

// ------------------------------------------------------------------- bots

pub async fn list_bot_types(AxumState(state): AxumState<Arc<AppState>>) -> Json<Vec<crate::bots::BotTypeInfo>> {
    Json(state.registry.list())
}

#[derive(Deserialize)]
pub struct CreateBotRequest {
    type_key: String,
    name: String,
    description: Option<String>,
    #[serde(default = "default_config")]
    config: serde_json::Value,
}

fn default_config() -> serde_json::Value {
    serde_json::json!({})
}

pub async fn create_bot(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<CreateBotRequest>,
) -> Result<Json<crate::store::BotInstance>, ApiError> {
    let bot = state
        .bot_manager
        .create_bot_instance(&req.type_key, &req.name, req.description.as_deref(), req.config)
        .await?;
    Ok(Json(bot))
}

#[derive(Deserialize)]
pub struct UpdateBotRequest {
    name: Option<String>,
    /// Provided means replace; omitted means leave unchanged. Clearing an
    /// existing description to null is not supported through this field.
    description: Option<String>,
    config: Option<serde_json::Value>,
    enabled: Option<bool>,
}

pub async fn update_bot(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBotRequest>,
) -> Result<Json<crate::store::BotInstance>, ApiError> {
    let bot = state
        .bot_manager
        .update_bot_instance(
            id,
            req.name.as_deref(),
            req.description.as_deref().map(Some),
            req.config,
            req.enabled,
        )
        .await?;
    Ok(Json(bot))
}

pub async fn delete_bot(AxumState(state): AxumState<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<(), ApiError> {
    state.bot_manager.delete_bot_instance(id).await?;
    Ok(())
}

// ------------------------------------------------------------- assignments

pub async fn list_assignments(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<Vec<ChatBotAssignment>>, ApiError> {
    Ok(Json(state.bot_manager.list_assignments_for_chat(chat_id).await?))
}

#[derive(Deserialize)]
pub struct CreateAssignmentRequest {
    bot_instance_id: Uuid,
    #[serde(default)]
    priority: i32,
}

pub async fn create_assignment(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<CreateAssignmentRequest>,
) -> Result<Json<ChatBotAssignment>, ApiError> {
    let assignment = state
        .bot_manager
        .assign(chat_id, req.bot_instance_id, req.priority)
        .await?;
    Ok(Json(assignment))
}

#[derive(Deserialize)]
pub struct UpdateAssignmentRequest {
    priority: Option<i32>,
    enabled: Option<bool>,
}

pub async fn update_assignment(
    AxumState(state): AxumState<Arc<AppState>>,
    Path((chat_id, bot_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateAssignmentRequest>,
) -> Result<Json<ChatBotAssignment>, ApiError> {
    let assignment = state
        .bot_manager
        .update_assignment(chat_id, bot_id, req.priority, req.enabled)
        .await?;
    Ok(Json(assignment))
}

pub async fn delete_assignment(
    AxumState(state): AxumState<Arc<AppState>>,
    Path((chat_id, bot_id)): Path<(Uuid, Uuid)>,
) -> Result<(), ApiError> {
    state.bot_manager.unassign(chat_id, bot_id).await?;
    Ok(())
}

// --------------------------------------------------------------- schedules

pub async fn list_schedules(AxumState(state): AxumState<Arc<AppState>>) -> Result<Json<Vec<Schedule>>, ApiError> {
    Ok(Json(state.store.list_schedules().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ScheduleKindRequest {
    Once,
    Cron,
}

#[derive(Deserialize)]
pub struct CreateScheduleRequest {
    kind: ScheduleKindRequest,
    fire_at: Option<DateTime<Utc>>,
    expression: Option<String>,
    #[serde(default = "default_timezone")]
    timezone: String,
    target_jid: String,
    content: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub async fn create_schedule(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    if req.target_jid.trim().is_empty() || req.content.trim().is_empty() {
        return Err(ApiError::BadInput("target_jid and content are required".to_string()));
    }

    let to_store_kind = |k: &ScheduleKindRequest| match k {
        ScheduleKindRequest::Once => ScheduleKind::Once,
        ScheduleKindRequest::Cron => ScheduleKind::Cron,
    };

    let next_fire_at = scheduler::initial_next_fire_at(
        to_store_kind(&req.kind),
        req.fire_at,
        req.expression.as_deref(),
        &req.timezone,
    )
    .map_err(|e| ApiError::BadCron(e.to_string()))?;

    let schedule = state
        .store
        .create_schedule(
            to_store_kind(&req.kind),
            req.fire_at,
            req.expression.as_deref(),
            &req.timezone,
            &req.target_jid,
            &req.content,
            next_fire_at,
        )
        .await?;

    Ok(Json(schedule))
}

#[derive(Deserialize)]
pub struct UpdateScheduleRequest {
    expression: Option<String>,
    timezone: Option<String>,
    target_jid: Option<String>,
    content: Option<String>,
    enabled: Option<bool>,
}

pub async fn update_schedule(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    let current = state.store.get_schedule(id).await?;

    let next_fire_at = if req.expression.is_some() || req.timezone.is_some() {
        let expression = req
            .expression
            .as_deref()
            .or(current.expression.as_deref())
            .ok_or_else(|| ApiError::BadCron("schedule has no cron expression to recompute".to_string()))?;
        let timezone = req.timezone.as_deref().unwrap_or(&current.timezone);
        let next = scheduler::compute_next_fire_at(expression, timezone, Utc::now())
            .map_err(|e| ApiError::BadCron(e.to_string()))?;
        Some(Some(next))
    } else {
        None
    };

    let schedule = state
        .store
        .update_schedule(
            id,
            req.expression.as_deref(),
            req.timezone.as_deref(),
            req.target_jid.as_deref(),
            req.content.as_deref(),
            req.enabled,
            next_fire_at,
        )
        .await?;

    Ok(Json(schedule))
}

pub async fn delete_schedule(AxumState(state): AxumState<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<(), ApiError> {
    state.store.delete_schedule(id).await?;
    Ok(())
}

pub async fn fire_schedule(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(), ApiError> {
    let schedule = state.store.get_schedule(id).await?;
    if !schedule.enabled {
        return Err(ApiError::BadInput(format!("schedule {id} is disabled, enable it before firing")));
    }

    state
        .store
        .update_schedule(
            id,
            None,
            None,
            None,
            None,
            Some(schedule.enabled),
            Some(Some(Utc::now())),
        )
        .await?;
    state.signals.wake_scheduler();
    Ok(())
}
