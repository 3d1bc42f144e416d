//! Fire-and-forget status notification sink (spec §4.8).
//!
//! The core never blocks on or retries notifier failures; callers spawn the
//! notify call and drop its result. Delivery ordering is not guaranteed.
//! This mirrors the object-safe-trait-plus-no-op-impl shape the teacher uses
//! for its harness/isolation seams, even though the teacher has no notifier
//! counterpart of its own -- the HTTP/WebSocket broadcast layer this feeds
//! is out of scope (spec §1).

use async_trait::async_trait;
use taskforge_db::models::TaskStatus;
use uuid::Uuid;

/// Terminal outcome reported to a [`Notifier`].
#[derive(Debug, Clone)]
pub enum NotifyPayload {
    Output(serde_json::Value),
    Error(String),
}

/// Sink for terminal task/subtask status changes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, task_id: Uuid, status: TaskStatus, payload: NotifyPayload);
}

const _: () = {
    fn _assert_object_safe(_: &dyn Notifier) {}
};

/// No-op notifier used in tests and when no broadcast layer is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _task_id: Uuid, _status: TaskStatus, _payload: NotifyPayload) {}
}

/// Spawn a fire-and-forget notify call. The notifier is expected to be
/// cheap to clone into an `Arc` by callers; this takes an `Arc<dyn Notifier>`
/// so the spawned task can own its reference independent of the caller's
/// lifetime.
pub fn notify_fire_and_forget(
    notifier: std::sync::Arc<dyn Notifier>,
    task_id: Uuid,
    status: TaskStatus,
    payload: NotifyPayload,
) {
    tokio::spawn(async move {
        notifier.notify(task_id, status, payload).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_is_object_safe() {
        let notifier: Box<dyn Notifier> = Box::new(NullNotifier);
        let _ = notifier;
    }

    #[tokio::test]
    async fn null_notifier_does_nothing() {
        let notifier = NullNotifier;
        notifier
            .notify(Uuid::nil(), TaskStatus::Done, NotifyPayload::Output(serde_json::json!({})))
            .await;
    }

    #[tokio::test]
    async fn fire_and_forget_spawns_without_blocking() {
        let notifier: std::sync::Arc<dyn Notifier> = std::sync::Arc::new(NullNotifier);
        notify_fire_and_forget(notifier, Uuid::nil(), TaskStatus::Error, NotifyPayload::Error("boom".into()));
        // Give the spawned task a chance to run; nothing to assert beyond
        // "this does not panic or block".
        tokio::task::yield_now().await;
    }
}
