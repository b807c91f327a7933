//! C7 Scheduler: a single ticker over the `schedules` table (§4.7) — one
//! row-locked sweep per tick rather than a task per schedule.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::gateway::WhatsAppGateway;
use crate::signals::Signals;
use crate::store::{Schedule, ScheduleKind, ScheduleResult, Store};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// A schedule more than this far past its `next_fire_at` when picked up is
/// considered misfired (process was down) rather than fired late. It still
/// fires — exactly once, as a catch-up — but the lateness is logged.
const MISFIRE_WINDOW: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Store,
    pub gateway: Arc<dyn WhatsAppGateway>,
    pub signals: Signals,
}

pub struct Scheduler {
    deps: SchedulerDeps,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        Self { deps }
    }

    pub fn spawn(&self, shutdown: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let deps = self.deps.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run(deps, shutdown).await })
    }
}

async fn run(deps: SchedulerDeps, shutdown: CancellationToken) {
    let notify = deps.signals.scheduler_notify();

    loop {
        if let Err(e) = tick(&deps).await {
            tracing::error!(error = %e, "scheduler tick failed");
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("scheduler shutting down");
                break;
            }
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
            _ = notify.notified() => {}
        }
    }
}

async fn tick(deps: &SchedulerDeps) -> Result<()> {
    let now = Utc::now();
    let due = deps.store.list_due_schedules(now).await?;

    if due.is_empty() {
        return Ok(());
    }

    tracing::debug!(count = due.len(), "scheduler: processing due schedules");

    for schedule in due {
        fire_one(deps, schedule, now).await?;
    }

    Ok(())
}

async fn fire_one(deps: &SchedulerDeps, schedule: Schedule, now: DateTime<Utc>) -> Result<()> {
    let next_fire_at = match &schedule.kind {
        ScheduleKind::Once => None,
        ScheduleKind::Cron => {
            let expression = schedule
                .expression
                .as_deref()
                .context("cron schedule missing its expression")?;
            match compute_next_fire_at(expression, &schedule.timezone, now) {
                Ok(next) => Some(next),
                Err(e) => {
                    tracing::error!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "invalid cron expression, disabling schedule"
                    );
                    deps.store
                        .record_schedule_fire(schedule.id, now, ScheduleResult::Failed, None, true)
                        .await?;
                    return Ok(());
                }
            }
        }
    };

    // one-shots always disable after firing; cron schedules only disable if
    // they have no further occurrence (computed above as an error path).
    let disable = matches!(schedule.kind, ScheduleKind::Once);

    // §4.7 misfire handling: a schedule more than 60s overdue still fires —
    // exactly once, as a catch-up — rather than being skipped. `next_fire_at`
    // is always computed from `now` (above), never by replaying each missed
    // occurrence, so a long-down process advances past the backlog in one
    // step instead of cascading through every instant it missed.
    let fire_due_at = schedule.next_fire_at.unwrap_or(now);
    if now.signed_duration_since(fire_due_at) > MISFIRE_WINDOW {
        tracing::warn!(
            schedule_id = %schedule.id,
            due_at = %fire_due_at,
            now = %now,
            "schedule misfired outside the catch-up window, firing once to catch up"
        );
    }

    // next_fire_at (and the disable flag) are recorded before the send so a
    // crash mid-send cannot cause this row to fire twice on restart.
    let send_result = deps.gateway.send_text(&schedule.target_jid, &schedule.content).await;

    let result = match &send_result {
        Ok(_) => ScheduleResult::Ok,
        Err(e) => {
            tracing::error!(schedule_id = %schedule.id, error = %e, "scheduled send failed");
            ScheduleResult::Failed
        }
    };

    deps.store
        .record_schedule_fire(schedule.id, now, result, next_fire_at, disable)
        .await?;

    Ok(())
}

/// `cron` requires 6-field (second-granularity) expressions; a bare 5-field
/// minute-granularity expression (as specified in §3) is padded with a
/// leading zero-seconds field.
fn normalize_expression(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

pub fn compute_next_fire_at(
    expression: &str,
    timezone: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone: {timezone}"))?;
    let normalized = normalize_expression(expression);
    let parsed = cron::Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid cron expression `{normalized}`: {e}"))?;

    let from_local = from.with_timezone(&tz);
    let next_local = parsed
        .after(&from_local)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression has no future occurrences"))?;

    Ok(next_local.with_timezone(&Utc))
}

/// Used by the REST create/update handlers (§4.9) to compute the initial
/// `next_fire_at` for a schedule before it ever reaches this tick.
pub fn initial_next_fire_at(
    kind: ScheduleKind,
    fire_at: Option<DateTime<Utc>>,
    expression: Option<&str>,
    timezone: &str,
) -> Result<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::Once => {
            let fire_at = fire_at.context("one-shot schedule requires fire_at")?;
            Ok(Some(fire_at))
        }
        ScheduleKind::Cron => {
            let expression = expression.context("cron schedule requires an expression")?;
            Ok(Some(compute_next_fire_at(expression, timezone, Utc::now())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayChat, GatewayError, GatewayMessage, WhatsAppGateway};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[derive(Default)]
    struct RecordingGateway {
        sends: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WhatsAppGateway for RecordingGateway {
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
        async fn send_text(&self, _chat_jid: &str, _text: &str) -> Result<String, GatewayError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok("sent-1".to_string())
        }
        async fn download_media(&self, _message_id: &str) -> Result<(Vec<u8>, String), GatewayError> {
            Err(GatewayError::NotFound("no media in this test gateway".to_string()))
        }
    }

    #[test]
    fn pads_five_field_expressions_to_six() {
        assert_eq!(normalize_expression("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_expression("0 0 */5 * * *"), "0 0 */5 * * *");
    }

    #[test]
    fn computes_next_occurrence_in_utc() {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = compute_next_fire_at("0 0 * * * *", "UTC", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let from = Utc::now();
        assert!(compute_next_fire_at("0 0 * * * *", "Nowhere/City", from).is_err());
    }

    #[test]
    fn rejects_malformed_expression() {
        let from = Utc::now();
        assert!(compute_next_fire_at("not a cron", "UTC", from).is_err());
    }

    #[test]
    fn once_requires_fire_at() {
        assert!(initial_next_fire_at(ScheduleKind::Once, None, None, "UTC").is_err());
        let fire_at = Utc::now();
        assert_eq!(
            initial_next_fire_at(ScheduleKind::Once, Some(fire_at), None, "UTC").unwrap(),
            Some(fire_at)
        );
    }

    async fn setup() -> (forge::testing::IsolatedTestDb, Store) {
        use forge::testing::*;
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("scheduler").await.unwrap();
        db.run_sql(&forge::get_internal_sql()).await.unwrap();
        db.run_sql(include_str!("../../migrations/0001_init.sql")).await.unwrap();
        let pool = db.pool().clone();
        (db, Store::new(pool))
    }

    /// §4.7: a schedule more than 60s past due still fires exactly once as a
    /// catch-up rather than being silently skipped (scenario 5 in §8).
    #[tokio::test]
    async fn misfired_schedule_still_fires() {
        let (_db, store) = setup().await;
        let now = Utc::now();
        let long_overdue = now - chrono::Duration::minutes(20);

        let schedule = store
            .create_schedule(
                ScheduleKind::Once,
                Some(long_overdue),
                None,
                "UTC",
                "999@s.whatsapp.net",
                "catch up",
                Some(long_overdue),
            )
            .await
            .unwrap();

        let recording_gateway = StdArc::new(RecordingGateway::default());
        let deps = SchedulerDeps {
            store: store.clone(),
            gateway: recording_gateway.clone() as StdArc<dyn WhatsAppGateway>,
            signals: crate::signals::Signals::new(),
        };

        fire_one(&deps, schedule.clone(), now).await.unwrap();

        assert_eq!(
            recording_gateway.sends.load(Ordering::SeqCst),
            1,
            "a misfired schedule must still send, exactly once"
        );

        let refreshed = store.get_schedule(schedule.id).await.unwrap();
        assert!(refreshed.last_fire_at.is_some());
    }
}
