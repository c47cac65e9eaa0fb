//! Mutation pipeline.
//!
//! Runs one mutation through its lifecycle:
//!
//! ```text
//! Idle -> Executing -> Succeeded -> Reconciling -> Notified -> Idle
//!                   \-> Failed -----------------/
//! ```
//!
//! Every run ends in `Notified` before returning to `Idle`, so the sink sees
//! exactly one notification per mutation. Continuations such as navigation
//! run only after the notification has been sent.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use folio_core::{
    CacheConfig, DataService, IdentityProvider, MutationOutcome, MutationRequest, Notification,
    NotificationSink,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::{rejected_locally, MutationExecutor};
use crate::notify::NotificationEmitter;
use crate::read_cache::ReadCache;
use crate::reconciler::{CacheReconciler, ReconcileReport};

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPhase {
    Idle,
    Executing,
    Succeeded,
    Failed,
    Reconciling,
    Notified,
}

impl MutationPhase {
    pub fn can_transition_to(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Idle, Executing)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Succeeded, Reconciling)
                | (Reconciling, Notified)
                | (Failed, Notified)
                | (Notified, Idle)
        )
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Reconciling => "reconciling",
            Self::Notified => "notified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid mutation phase transition: {from} -> {to}")]
    InvalidTransition {
        from: MutationPhase,
        to: MutationPhase,
    },
}

/// Observable phase of one mutation slot.
///
/// A slot runs one mutation at a time. UI code subscribes to follow the
/// phase, e.g. to disable a button while `Executing`.
#[derive(Debug)]
pub struct MutationLifecycle {
    phase: watch::Sender<MutationPhase>,
    history: Mutex<Vec<MutationPhase>>,
}

impl MutationLifecycle {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(MutationPhase::Idle);
        Self {
            phase,
            history: Mutex::new(vec![MutationPhase::Idle]),
        }
    }

    pub fn phase(&self) -> MutationPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationPhase> {
        self.phase.subscribe()
    }

    /// Every phase entered so far, starting with `Idle`.
    pub fn history(&self) -> Vec<MutationPhase> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] if the current phase
    /// cannot move to `next`; the phase is left unchanged.
    pub fn advance(&self, next: MutationPhase) -> Result<(), LifecycleError> {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = Ok(());
        self.phase.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                result = Err(LifecycleError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        if result.is_ok() {
            history.push(next);
        }
        result
    }

    fn step(&self, next: MutationPhase) {
        if let Err(err) = self.advance(next) {
            warn!(error = %err, "Mutation lifecycle out of order");
        }
    }
}

impl Default for MutationLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one mutation run produced.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub request_id: Uuid,
    pub outcome: MutationOutcome,
    pub reconcile: ReconcileReport,
    pub notification: Notification,
    /// Phases entered during the run, from `Idle` back to `Idle`.
    pub phases: Vec<MutationPhase>,
}

impl MutationReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn fresh_state(&self) -> Option<&Value> {
        self.outcome.fresh_state()
    }
}

/// Executes, reconciles and notifies, in that order.
#[derive(Clone)]
pub struct MutationPipeline {
    executor: MutationExecutor,
    reconciler: CacheReconciler,
    emitter: NotificationEmitter,
}

impl MutationPipeline {
    pub fn new(
        service: Arc<dyn DataService>,
        sink: Arc<dyn NotificationSink>,
        cache: ReadCache,
    ) -> Self {
        Self {
            executor: MutationExecutor::new(service),
            reconciler: CacheReconciler::new(cache),
            emitter: NotificationEmitter::new(sink),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.executor = self.executor.with_identity(identity);
        self
    }

    pub fn cache(&self) -> &ReadCache {
        self.reconciler.cache()
    }

    pub fn config(&self) -> &CacheConfig {
        self.cache().config()
    }

    pub fn emitter(&self) -> &NotificationEmitter {
        &self.emitter
    }

    /// Run one mutation on a fresh lifecycle.
    pub async fn mutate(&self, request: MutationRequest) -> MutationReport {
        let lifecycle = MutationLifecycle::new();
        lifecycle.step(MutationPhase::Executing);
        self.run(request, &lifecycle).await
    }

    /// Run one mutation on a caller-owned lifecycle.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] without contacting the
    /// service if `lifecycle` is already running a mutation.
    pub async fn mutate_with(
        &self,
        request: MutationRequest,
        lifecycle: &MutationLifecycle,
    ) -> Result<MutationReport, LifecycleError> {
        lifecycle.advance(MutationPhase::Executing)?;
        Ok(self.run(request, lifecycle).await)
    }

    /// Run one mutation, then `on_success` once the cache is reconciled and
    /// the notification sent.
    ///
    /// The continuation waits `navigate_delay` first so the notification is
    /// visible before the view changes. It is skipped on failure.
    pub async fn mutate_then<F, Fut, T>(
        &self,
        request: MutationRequest,
        on_success: F,
    ) -> (MutationReport, Option<T>)
    where
        F: FnOnce(&MutationReport) -> Fut,
        Fut: Future<Output = T>,
    {
        let report = self.mutate(request).await;
        if !report.is_success() {
            return (report, None);
        }
        tokio::time::sleep(self.config().navigate_delay).await;
        let value = on_success(&report).await;
        (report, Some(value))
    }

    /// Tell the user they are signed out, then drop every cached entry.
    ///
    /// The cache is cleared after `sign_out_delay` so the notice renders
    /// against the current view.
    pub async fn sign_out(&self, notice: Notification) {
        info!("Signing out");
        self.emitter.emit(notice);
        tokio::time::sleep(self.config().sign_out_delay).await;
        self.cache().clear();
        info!("Signed out, cache cleared");
    }

    async fn run(&self, request: MutationRequest, lifecycle: &MutationLifecycle) -> MutationReport {
        info!(
            request_id = %request.request_id,
            entity = %request.entity,
            kind = %request.kind,
            "Mutation started"
        );

        let outcome = self.executor.execute(&request).await;

        let reconcile = if outcome.is_success() {
            lifecycle.step(MutationPhase::Succeeded);
            lifecycle.step(MutationPhase::Reconciling);
            self.reconciler.reconcile(request.entity, &outcome, &request)
        } else {
            lifecycle.step(MutationPhase::Failed);
            ReconcileReport::default()
        };

        let notification = self.emitter.notify(&request, &outcome);
        lifecycle.step(MutationPhase::Notified);
        lifecycle.step(MutationPhase::Idle);

        info!(
            request_id = %request.request_id,
            success = outcome.is_success(),
            rejected_locally = outcome.error().is_some_and(rejected_locally),
            invalidated = reconcile.invalidated.len(),
            "Mutation settled"
        );

        MutationReport {
            request_id: request.request_id,
            outcome,
            reconcile,
            notification,
            phases: lifecycle.history(),
        }
    }
}

impl fmt::Debug for MutationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationPipeline")
            .field("executor", &self.executor)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{EntityTag, FolioError};
    use folio_test_utils::{MockDataService, RecordingSink};
    use serde_json::json;
    use std::time::Duration;
    use MutationPhase::*;

    fn pipeline() -> (MutationPipeline, Arc<MockDataService>, Arc<RecordingSink>) {
        let service = Arc::new(MockDataService::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = ReadCache::create(
            CacheConfig::default()
                .with_navigate_delay(Duration::from_millis(200))
                .with_sign_out_delay(Duration::from_millis(500)),
        );
        let pipeline = MutationPipeline::new(service.clone(), sink.clone(), cache);
        (pipeline, service, sink)
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Idle.can_transition_to(Executing));
        assert!(Failed.can_transition_to(Notified));
        assert!(!Failed.can_transition_to(Reconciling));
        assert!(!Succeeded.can_transition_to(Notified));
        assert!(!Executing.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn test_lifecycle_rejects_invalid_transition() {
        let lifecycle = MutationLifecycle::new();
        assert_eq!(
            lifecycle.advance(Notified),
            Err(LifecycleError::InvalidTransition {
                from: Idle,
                to: Notified
            })
        );
        assert_eq!(lifecycle.phase(), Idle);
        assert_eq!(lifecycle.history(), vec![Idle]);
    }

    #[tokio::test]
    async fn test_success_runs_every_phase() {
        let (pipeline, service, sink) = pipeline();
        service.respond_mutate(Ok(json!({"id": "r1", "status": "PENDING"})));

        let report = pipeline
            .mutate(MutationRequest::create(
                EntityTag::BorrowRecord,
                json!({"bookId": "b1"}),
            ))
            .await;

        assert!(report.is_success());
        assert_eq!(
            report.phases,
            vec![Idle, Executing, Succeeded, Reconciling, Notified, Idle]
        );
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_skips_reconcile_but_notifies() {
        let (pipeline, service, sink) = pipeline();
        service.respond_mutate(Err(FolioError::network("offline")));

        let report = pipeline
            .mutate(MutationRequest::delete(EntityTag::Book, "b1"))
            .await;

        assert_eq!(report.phases, vec![Idle, Executing, Failed, Notified, Idle]);
        assert!(report.reconcile.is_empty());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_busy_lifecycle_rejects_second_mutation() {
        let (pipeline, service, _sink) = pipeline();
        let lifecycle = MutationLifecycle::new();
        lifecycle.advance(Executing).unwrap();

        let result = pipeline
            .mutate_with(MutationRequest::delete(EntityTag::Book, "b1"), &lifecycle)
            .await;

        assert!(result.is_err());
        assert_eq!(service.mutate_calls(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_is_observable() {
        let (pipeline, service, _sink) = pipeline();
        service.respond_mutate(Ok(json!({"id": "rv1"})));
        let lifecycle = MutationLifecycle::new();
        let mut phases = lifecycle.subscribe();

        pipeline
            .mutate_with(
                MutationRequest::create(EntityTag::Review, json!({"rating": 5})),
                &lifecycle,
            )
            .await
            .unwrap();

        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), Idle);
        assert_eq!(lifecycle.history().last(), Some(&Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_runs_after_notification_and_delay() {
        let (pipeline, service, sink) = pipeline();
        service.respond_mutate(Ok(json!({"id": "rv9", "rating": 4})));
        let started = tokio::time::Instant::now();

        let (report, navigated) = pipeline
            .mutate_then(
                MutationRequest::create(EntityTag::Review, json!({"rating": 4})),
                |report| {
                    let notified = sink.len();
                    let id = report
                        .fresh_state()
                        .and_then(|v| v["id"].as_str())
                        .map(str::to_string);
                    async move { (notified, id) }
                },
            )
            .await;

        assert!(report.is_success());
        assert_eq!(navigated, Some((1, Some("rv9".to_string()))));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_skipped_on_failure() {
        let (pipeline, service, sink) = pipeline();
        service.respond_mutate(Err(FolioError::service("Book is no longer available")));

        let (report, navigated) = pipeline
            .mutate_then(
                MutationRequest::create(EntityTag::BorrowRecord, json!({"bookId": "b1"})),
                |_| async { "navigated" },
            )
            .await;

        assert!(!report.is_success());
        assert_eq!(navigated, None);
        assert_eq!(sink.notifications()[0].title, "Book unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_notifies_then_clears() {
        let (pipeline, _service, sink) = pipeline();
        let cache = pipeline.cache().clone();
        cache.set(folio_core::Fingerprint::of(EntityTag::Books), json!([]));

        let handle = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .sign_out(Notification::info("Signed out", "See you soon"))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.len(), 1);
        assert_eq!(cache.len(), 1);

        handle.await.unwrap();
        assert!(cache.is_empty());
    }
}
