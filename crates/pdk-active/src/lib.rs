//! pdk-active
//!
//! Process-local registry of live plan executions. One entry per
//! (plan, branch) per host; activation is an atomic insert-if-absent so
//! concurrent activations on the same host collapse to a single winner.
//!
//! Entries fan progress events out to subscribers over bounded channels.
//! The core never blocks on a slow consumer: a full subscriber buffer drops
//! the event for that subscriber only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pdk_kv::ConcurrentKv;
use pdk_schemas::PlanKey;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Buffered events per subscriber before sends start dropping.
const SUBSCRIBER_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Events & outcomes
// ---------------------------------------------------------------------------

/// Progress events fanned out to subscribers of a plan execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    /// A chunk of streamed model output.
    Token { content: String },
    /// A build step touched a file.
    BuildProgress { file_path: String, done: bool },
    /// Coarse execution state change ("planning" | "building" | "stopped").
    StateChange { state: String },
}

/// Terminal value delivered exactly once on the entry's done sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed { kind: String, message: String },
    Cancelled,
}

// ---------------------------------------------------------------------------
// ActivePlanEntry
// ---------------------------------------------------------------------------

/// Immutable activation parameters.
#[derive(Clone, Debug)]
pub struct NewActivePlan {
    pub org_id: String,
    pub user_id: String,
    pub prompt: String,
    pub build_only: bool,
    pub auto_context: bool,
    pub session_id: String,
}

/// Live execution state for one (plan, branch) on this host.
///
/// The cancel token is the root of the execution's cancellation tree:
/// queued operations and provider requests run under child tokens.
pub struct ActivePlanEntry {
    key: PlanKey,
    pub org_id: String,
    pub user_id: String,
    pub prompt: String,
    pub build_only: bool,
    pub auto_context: bool,
    pub session_id: String,
    /// Set once the stream directory claim succeeds.
    model_stream_id: Mutex<Option<Uuid>>,
    cancel: CancellationToken,
    done: Mutex<Option<oneshot::Sender<StreamOutcome>>>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<PlanEvent>>>,
}

impl ActivePlanEntry {
    fn new(key: PlanKey, params: NewActivePlan) -> (Arc<Self>, oneshot::Receiver<StreamOutcome>) {
        let (done_tx, done_rx) = oneshot::channel();
        let entry = Arc::new(Self {
            key,
            org_id: params.org_id,
            user_id: params.user_id,
            prompt: params.prompt,
            build_only: params.build_only,
            auto_context: params.auto_context,
            session_id: params.session_id,
            model_stream_id: Mutex::new(None),
            cancel: CancellationToken::new(),
            done: Mutex::new(Some(done_tx)),
            subscribers: Mutex::new(HashMap::new()),
        });
        (entry, done_rx)
    }

    pub fn key(&self) -> &PlanKey {
        &self.key
    }

    /// Child token for work running under this execution.
    pub fn child_ctx(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_model_stream_id(&self, id: Uuid) {
        *self.model_stream_id.lock().expect("entry lock poisoned") = Some(id);
    }

    pub fn model_stream_id(&self) -> Option<Uuid> {
        *self.model_stream_id.lock().expect("entry lock poisoned")
    }

    /// Deliver the terminal outcome. Single delivery: later calls are no-ops.
    pub fn finish(&self, outcome: StreamOutcome) {
        if let Some(tx) = self.done.lock().expect("entry lock poisoned").take() {
            let _ = tx.send(outcome);
        }
    }

    /// Fan an event out to all subscribers, dropping per-subscriber when a
    /// buffer is full. Sends happen under the subscriber-map lock so no
    /// event can be delivered after `unsubscribe` or registry delete.
    pub fn publish(&self, event: PlanEvent) {
        let subs = self.subscribers.lock().expect("entry lock poisoned");
        for (sub_id, tx) in subs.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                debug!(sub_id = %sub_id, "subscriber buffer full, dropping event");
            }
        }
    }

    fn add_subscriber(&self) -> (String, mpsc::Receiver<PlanEvent>) {
        let sub_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("entry lock poisoned")
            .insert(sub_id.clone(), tx);
        (sub_id, rx)
    }

    fn remove_subscriber(&self, sub_id: &str) {
        self.subscribers
            .lock()
            .expect("entry lock poisoned")
            .remove(sub_id);
    }

    /// Cancel the execution and drop every subscriber sender (closing the
    /// channels). Draining under the lock makes the close exactly-once and
    /// excludes concurrent publishes.
    fn close(&self) {
        self.cancel.cancel();
        self.subscribers
            .lock()
            .expect("entry lock poisoned")
            .drain()
            .for_each(drop);
    }
}

impl std::fmt::Debug for ActivePlanEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivePlanEntry")
            .field("key", &self.key.to_string())
            .field("org_id", &self.org_id)
            .field("session_id", &self.session_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActivePlanRegistry
// ---------------------------------------------------------------------------

/// Host-local registry keyed by the flattened plan key.
#[derive(Debug, Default)]
pub struct ActivePlanRegistry {
    entries: ConcurrentKv<Arc<ActivePlanEntry>>,
}

impl ActivePlanRegistry {
    pub fn new() -> Self {
        Self {
            entries: ConcurrentKv::new(),
        }
    }

    /// Atomically install a new entry. Returns `None` when an entry already
    /// exists for the key — at most one caller per host wins.
    pub fn activate(
        &self,
        key: &PlanKey,
        params: NewActivePlan,
    ) -> Option<(Arc<ActivePlanEntry>, oneshot::Receiver<StreamOutcome>)> {
        let (entry, done_rx) = ActivePlanEntry::new(key.clone(), params);
        let (_, loaded) = self.entries.set_if_absent(key.to_string(), Arc::clone(&entry));
        if loaded {
            return None;
        }
        debug!(key = %key, "plan activated");
        Some((entry, done_rx))
    }

    pub fn get(&self, key: &PlanKey) -> Option<Arc<ActivePlanEntry>> {
        self.entries.get(&key.to_string())
    }

    /// Apply `f` to the entry while holding the store's write lock.
    /// No-op when absent; returns whether `f` ran.
    pub fn update<F>(&self, key: &PlanKey, f: F) -> bool
    where
        F: FnOnce(&ActivePlanEntry),
    {
        self.entries.update(&key.to_string(), |entry| f(entry.as_ref()))
    }

    /// Register a progress subscriber. Returns `None` when the key has no
    /// active entry. The subscription is dropped automatically when `ctx`
    /// is cancelled.
    pub fn subscribe(
        &self,
        ctx: &CancellationToken,
        key: &PlanKey,
    ) -> Option<(String, mpsc::Receiver<PlanEvent>)> {
        let entry = self.get(key)?;
        let (sub_id, rx) = entry.add_subscriber();

        let ctx = ctx.clone();
        let unsubscribe_entry = Arc::clone(&entry);
        let unsubscribe_id = sub_id.clone();
        tokio::spawn(async move {
            ctx.cancelled().await;
            unsubscribe_entry.remove_subscriber(&unsubscribe_id);
        });

        Some((sub_id, rx))
    }

    /// Drop a subscription. Idempotent; unknown ids and keys are no-ops.
    pub fn unsubscribe(&self, key: &PlanKey, sub_id: &str) {
        if let Some(entry) = self.get(key) {
            entry.remove_subscriber(sub_id);
        }
    }

    /// Remove an entry: cancels its context, closes all subscriber channels
    /// exactly once, and deletes the record. Idempotent.
    pub fn delete(&self, key: &PlanKey) {
        if let Some(entry) = self.entries.delete(&key.to_string()) {
            entry.close();
            debug!(key = %key, "plan deactivated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all live entries (diagnostics surface).
    pub fn active_keys(&self) -> Vec<String> {
        self.entries.keys()
    }

    /// Swap in a clean registry state between tests.
    #[cfg(any(test, feature = "testkit"))]
    pub fn reset_for_test(&self) {
        for key in self.entries.keys() {
            if let Some(entry) = self.entries.delete(&key) {
                entry.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NewActivePlan {
        NewActivePlan {
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            prompt: "add error handling".into(),
            build_only: false,
            auto_context: true,
            session_id: "sess-1".into(),
        }
    }

    fn key() -> PlanKey {
        PlanKey::new("plan-1", "main").unwrap()
    }

    #[tokio::test]
    async fn second_activation_loses() {
        let reg = ActivePlanRegistry::new();
        let first = reg.activate(&key(), params());
        assert!(first.is_some());
        assert!(reg.activate(&key(), params()).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn delete_cancels_and_closes_subscribers() {
        let reg = ActivePlanRegistry::new();
        let (entry, _done) = reg.activate(&key(), params()).unwrap();

        let ctx = CancellationToken::new();
        let (_sub_id, mut rx) = reg.subscribe(&ctx, &key()).unwrap();

        entry.publish(PlanEvent::StateChange {
            state: "planning".into(),
        });
        assert!(matches!(
            rx.recv().await,
            Some(PlanEvent::StateChange { .. })
        ));

        reg.delete(&key());
        assert!(entry.is_cancelled());
        // Channel closed: no further events, recv drains to None.
        assert!(rx.recv().await.is_none());
        assert!(reg.get(&key()).is_none());
    }

    #[tokio::test]
    async fn no_events_after_unsubscribe() {
        let reg = ActivePlanRegistry::new();
        let (entry, _done) = reg.activate(&key(), params()).unwrap();

        let ctx = CancellationToken::new();
        let (sub_id, mut rx) = reg.subscribe(&ctx, &key()).unwrap();
        reg.unsubscribe(&key(), &sub_id);

        entry.publish(PlanEvent::Token {
            content: "hi".into(),
        });
        assert!(rx.recv().await.is_none());

        // Idempotent.
        reg.unsubscribe(&key(), &sub_id);
    }

    #[tokio::test]
    async fn subscribe_to_absent_key_returns_none() {
        let reg = ActivePlanRegistry::new();
        let ctx = CancellationToken::new();
        assert!(reg.subscribe(&ctx, &key()).is_none());
    }

    #[tokio::test]
    async fn done_sink_delivers_exactly_once() {
        let reg = ActivePlanRegistry::new();
        let (entry, done) = reg.activate(&key(), params()).unwrap();

        entry.finish(StreamOutcome::Completed);
        // Second finish is a silent no-op.
        entry.finish(StreamOutcome::Cancelled);

        assert_eq!(done.await.unwrap(), StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn ctx_cancellation_unsubscribes() {
        let reg = ActivePlanRegistry::new();
        let (entry, _done) = reg.activate(&key(), params()).unwrap();

        let ctx = CancellationToken::new();
        let (_sub_id, mut rx) = reg.subscribe(&ctx, &key()).unwrap();
        ctx.cancel();
        // Let the unsubscribe task run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        entry.publish(PlanEvent::Token {
            content: "late".into(),
        });
        assert!(rx.recv().await.is_none());
    }
}
