//! C9 REST Surface: the HTTP API operators and the chat-UI frontend use to
//! manage chats, bot instances, assignments, and schedules (§4.9, §6).
//!
//! Forge's `#[forge::query]`/`#[forge::mutation]` handlers are dispatched by
//! function name, not by HTTP method + path template, so they can't express
//! `/chats/{id}/bots/{bot_id}`-style routes. This surface is plain `axum`
//! instead.

mod error;
mod handlers;

pub use error::ApiError;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, patch, post};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::bot_manager::BotManager;
use crate::bots::BotRegistry;
use crate::gateway::WhatsAppGateway;
use crate::processor::{Processor, ProcessorDeps};
use crate::scheduler::SchedulerDeps;
use crate::signals::Signals;
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub gateway: Arc<dyn WhatsAppGateway>,
    pub registry: Arc<BotRegistry>,
    pub bot_manager: BotManager,
    pub auth: AuthService,
    pub signals: Signals,
    pub processor: Processor,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Store,
        gateway: Arc<dyn WhatsAppGateway>,
        registry: Arc<BotRegistry>,
        processor_deps: ProcessorDeps,
        scheduler_deps: SchedulerDeps,
        auth: AuthService,
        shutdown: CancellationToken,
    ) -> Self {
        let signals = scheduler_deps.signals.clone();
        let bot_manager = BotManager::new(store.clone(), registry.clone(), signals.clone());
        let processor = Processor::new(processor_deps);

        Self {
            store,
            gateway,
            registry,
            bot_manager,
            auth,
            signals,
            processor,
            shutdown,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/login", post(handlers::login));

    let protected = Router::new()
        .route("/chats", get(handlers::list_chats).post(handlers::create_chat))
        .route("/chats/sync", post(handlers::sync_chats))
        .route("/chats/{id}", delete(handlers::delete_chat))
        .route("/chats/{id}/messages", get(handlers::chat_messages))
        .route("/bot-types", get(handlers::list_bot_types))
        .route("/bots", post(handlers::create_bot))
        .route("/bots/{id}", patch(handlers::update_bot).delete(handlers::delete_bot))
        .route(
            "/chats/{id}/bots",
            get(handlers::list_assignments).post(handlers::create_assignment),
        )
        .route(
            "/chats/{id}/bots/{bot_id}",
            patch(handlers::update_assignment).delete(handlers::delete_assignment),
        )
        .route("/schedules", get(handlers::list_schedules).post(handlers::create_schedule))
        .route(
            "/schedules/{id}",
            patch(handlers::update_schedule).delete(handlers::delete_schedule),
        )
        .route("/schedules/{id}/fire", post(handlers::fire_schedule))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::require_bearer_token,
        ));

    public.merge(protected).with_state(state)
}
