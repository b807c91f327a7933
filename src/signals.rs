//! Cross-component wake notifications (§4.8, §4.7 "manual trigger").
//!
//! The Bot Manager and the REST surface need to nudge long-running tasks
//! they don't own: "a chat's assignments changed, don't wait for the next
//! natural poll tick" and "fire this schedule now, interrupt its sleep".
//! Both are modeled the same way — a per-key `tokio::sync::Notify` so a
//! waiting task wakes immediately and a notification with no current
//! waiter is not lost before the next `notified().await`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Clone)]
pub struct Signals {
    chat_wakes: Arc<Mutex<HashMap<Uuid, Arc<Notify>>>>,
    /// The Scheduler runs one global ticker over every schedule row (§4.7),
    /// so there is only ever one waiter to wake — no per-schedule map
    /// needed here.
    scheduler_wake: Arc<Notify>,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            chat_wakes: Arc::new(Mutex::new(HashMap::new())),
            scheduler_wake: Arc::new(Notify::new()),
        }
    }
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify_for(map: &Mutex<HashMap<Uuid, Arc<Notify>>>, id: Uuid) -> Arc<Notify> {
        let mut guard = map.lock().await;
        guard.entry(id).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    /// Registered once by the chat poller at startup; cheap to call
    /// repeatedly since entries are created lazily and reused.
    pub async fn chat_notify(&self, chat_id: Uuid) -> Arc<Notify> {
        Self::notify_for(&self.chat_wakes, chat_id).await
    }

    pub async fn wake_chat(&self, chat_id: Uuid) {
        Self::notify_for(&self.chat_wakes, chat_id).await.notify_one();
    }

    /// Interrupts the scheduler's sleep so a row the caller just marked due
    /// (REST "fire now") is picked up well before the next 1s tick.
    pub fn scheduler_notify(&self) -> Arc<Notify> {
        self.scheduler_wake.clone()
    }

    pub fn wake_scheduler(&self) {
        self.scheduler_wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_before_wait_is_not_lost() {
        let signals = Signals::new();
        let chat_id = Uuid::new_v4();

        signals.wake_chat(chat_id).await;

        let notify = signals.chat_notify(chat_id).await;
        tokio::time::timeout(std::time::Duration::from_millis(50), notify.notified())
            .await
            .expect("notification should already be pending");
    }
}
