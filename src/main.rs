mod auth;
mod bot_manager;
mod bots;
mod config;
mod gateway;
mod llm;
mod media;
mod processor;
mod rest;
mod scheduler;
mod signals;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use bots::BotRegistry;
use config::Config;
use gateway::{GatewayClient, GatewayClientConfig, WhatsAppGateway};
use llm::{Llm, LlmClient};
use media::MediaPipeline;
use processor::{Processor, ProcessorDeps};
use rest::AppState;
use scheduler::{Scheduler, SchedulerDeps};
use signals::Signals;
use store::Store;

/// Startup order follows §7 "Process Lifecycle": config, then DB, then the
/// gateway/LLM clients each component borrows, then recovery, then the
/// long-running tasks, then the HTTP listener last so nothing can answer a
/// request before its dependencies exist.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        .unwrap_or_else(tracing_subscriber::EnvFilter::from_default_env);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = Store::new(pool);
    store.migrate().await.context("failed to run migrations")?;

    let reconciled = store
        .reconcile_interrupted()
        .await
        .context("failed to reconcile interrupted processed-message rows")?;
    if reconciled > 0 {
        tracing::warn!(count = reconciled, "reconciled processed rows left pending by a prior crash");
    }

    let registry = Arc::new(BotRegistry::with_builtins());
    disable_bots_with_invalid_config(&store, &registry).await?;

    let gateway: Arc<dyn WhatsAppGateway> = Arc::new(GatewayClient::new(GatewayClientConfig {
        base_url: config.whatsapp_base_url.clone(),
        auth: config.whatsapp_auth.clone(),
    }));
    let llm: Arc<dyn Llm> = Arc::new(LlmClient::new(config.llm_base_url.clone(), config.llm_api_key.clone()));
    let media_pipeline = Arc::new(MediaPipeline::new());
    let signals = Signals::new();
    let auth = auth::AuthService::new(config.jwt_secret.clone(), config.access_token_expire_days);

    bootstrap_admin_user(&store, &config, &auth).await?;

    let shutdown = CancellationToken::new();

    let processor_deps = ProcessorDeps {
        store: store.clone(),
        gateway: gateway.clone(),
        registry: registry.clone(),
        llm: llm.clone(),
        media_pipeline: media_pipeline.clone(),
        signals: signals.clone(),
        media_semaphore: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_media_jobs)),
        text_model: Arc::from(config.llm_model.as_str()),
        vision_model: Arc::from(config.llm_vision_model.as_str()),
        audio_model: Arc::from(config.llm_audio_model.as_str()),
        poll_interval: std::time::Duration::from_secs(config.poll_interval_seconds),
        message_limit: config.message_limit_per_poll,
    };
    let scheduler_deps = SchedulerDeps {
        store: store.clone(),
        gateway: gateway.clone(),
        signals: signals.clone(),
    };

    let processor = Processor::new(processor_deps.clone());
    let enabled_chats = store
        .list_enabled_chats()
        .await
        .context("failed to list enabled chats")?
        .into_iter()
        .map(|c| (c.id, c.jid))
        .collect();
    let mut handles = processor.spawn_all(enabled_chats, &shutdown);

    let scheduler = Scheduler::new(scheduler_deps.clone());
    handles.push(scheduler.spawn(&shutdown));

    let state = Arc::new(AppState::new(
        store,
        gateway,
        registry,
        processor_deps,
        scheduler_deps,
        auth,
        shutdown.clone(),
    ));
    let app = rest::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    // Shutdown runs in the reverse of the startup order (§4.10): the REST
    // server stops taking new requests and drains in-flight ones first,
    // and only once that's done do the processor/scheduler loops get
    // cancelled — `shutdown` is not touched until `server.await` returns.
    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal());

    server.await.context("server error")?;

    shutdown.cancel();
    processor::await_drain(handles).await;

    Ok(())
}

/// A freshly provisioned database has no users and therefore no way to
/// obtain the bearer token every non-health endpoint requires. If the
/// operator configured `BOOTSTRAP_ADMIN_USERNAME`/`BOOTSTRAP_ADMIN_PASSWORD`
/// and the `users` table is still empty, create that one user. A no-op on
/// every later start, since by then a user exists.
async fn bootstrap_admin_user(store: &Store, config: &Config, auth: &auth::AuthService) -> Result<()> {
    let (Some(username), Some(password)) =
        (&config.bootstrap_admin_username, &config.bootstrap_admin_password)
    else {
        return Ok(());
    };

    if store.count_users().await.context("failed to count users")? > 0 {
        return Ok(());
    }

    let password_hash = auth
        .hash_password(password)
        .map_err(|e| anyhow::anyhow!("failed to hash bootstrap admin password: {e}"))?;
    store
        .create_user(username, &password_hash)
        .await
        .context("failed to create bootstrap admin user")?;
    tracing::info!(username, "created bootstrap admin user");
    Ok(())
}

async fn disable_bots_with_invalid_config(store: &Store, registry: &Arc<BotRegistry>) -> Result<()> {
    for bot in store.list_bot_instances().await? {
        if !bot.enabled {
            continue;
        }
        let Some(bot_type) = registry.get(&bot.type_key) else {
            tracing::error!(bot_id = %bot.id, type_key = %bot.type_key, "disabling bot instance with unknown type");
            store.update_bot_instance(bot.id, None, None, None, Some(false)).await?;
            continue;
        };
        if let Err(e) = bot_type.config_schema().validate(&bot.config) {
            tracing::error!(bot_id = %bot.id, type_key = %bot.type_key, error = %e, "disabling bot instance with invalid config");
            store.update_bot_instance(bot.id, None, None, None, Some(false)).await?;
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, draining REST server");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, draining REST server");
        }
    }
}
