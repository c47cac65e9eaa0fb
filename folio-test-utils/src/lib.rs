//! Folio Test Utilities
//!
//! Shared test infrastructure for the Folio workspace:
//! - Scripted mock data service, notification sink and identity provider
//! - Proptest generators for keys, records and mutations
//! - JSON fixtures for library records
//! - Assertions over Folio errors

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

// Re-export core types for convenience
pub use folio_core::{
    EntityTag, Fingerprint, FolioError, FolioResult, IdentityProvider, KeyPart, MutationKind,
    MutationOutcome, MutationRequest, Notification, NotificationSink, ServiceErrorCode, Severity,
    ValidationError,
};
use folio_core::DataService;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

#[derive(Default)]
struct MockScript {
    fetch: HashMap<Fingerprint, FolioResult<Value>>,
    fetch_once: HashMap<Fingerprint, VecDeque<FolioResult<Value>>>,
    mutate: VecDeque<FolioResult<Value>>,
    mutations: Vec<MutationRequest>,
    fetch_log: Vec<Fingerprint>,
}

/// Scripted data service.
///
/// Fetch responses are set per fingerprint; one-shot responses queued with
/// [`respond_fetch_once`](Self::respond_fetch_once) are used first. Mutate
/// responses are consumed in order. An unscripted call fails.
#[derive(Default)]
pub struct MockDataService {
    script: Mutex<MockScript>,
    fetch_calls: AtomicU64,
    mutate_calls: AtomicU64,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    latency: Mutex<Option<Duration>>,
}

impl MockDataService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every fetch of `fingerprint` with `result`.
    pub fn respond_fetch(&self, fingerprint: Fingerprint, result: FolioResult<Value>) {
        lock(&self.script).fetch.insert(fingerprint, result);
    }

    /// Answer the next fetch of `fingerprint` with `result`.
    pub fn respond_fetch_once(&self, fingerprint: Fingerprint, result: FolioResult<Value>) {
        lock(&self.script)
            .fetch_once
            .entry(fingerprint)
            .or_default()
            .push_back(result);
    }

    /// Queue the response for the next mutate call.
    pub fn respond_mutate(&self, result: FolioResult<Value>) {
        lock(&self.script).mutate.push_back(result);
    }

    /// Hold every fetch until `gate` is notified once per fetch.
    pub fn gate_fetches(&self, gate: Arc<Notify>) {
        *lock(&self.fetch_gate) = Some(gate);
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls_for(&self, fingerprint: &Fingerprint) -> usize {
        lock(&self.script)
            .fetch_log
            .iter()
            .filter(|logged| *logged == fingerprint)
            .count()
    }

    pub fn mutate_calls(&self) -> u64 {
        self.mutate_calls.load(Ordering::SeqCst)
    }

    /// Every request the service received, in order.
    pub fn mutations(&self) -> Vec<MutationRequest> {
        lock(&self.script).mutations.clone()
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DataService for MockDataService {
    async fn fetch(&self, fingerprint: &Fingerprint) -> FolioResult<Value> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.fetch_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.delay().await;

        let mut script = lock(&self.script);
        script.fetch_log.push(fingerprint.clone());
        if let Some(result) = script
            .fetch_once
            .get_mut(fingerprint)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        script
            .fetch
            .get(fingerprint)
            .cloned()
            .unwrap_or_else(|| Err(FolioError::service(format!("{} not found", fingerprint))))
    }

    async fn mutate(&self, request: &MutationRequest) -> FolioResult<Value> {
        self.mutate_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut script = lock(&self.script);
        script.mutations.push(request.clone());
        script
            .mutate
            .pop_front()
            .unwrap_or_else(|| Err(FolioError::network("no scripted mutate response")))
    }
}

/// Notification sink that records what it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.received).clone()
    }

    pub fn last(&self) -> Option<Notification> {
        lock(&self.received).last().cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        lock(&self.received).push(notification);
    }
}

/// Identity provider with a fixed actor.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    actor: Option<String>,
}

impl StaticIdentity {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self { actor: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_actor(&self) -> Option<String> {
        self.actor.clone()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Folio keys, records and mutations.

    use super::*;
    use proptest::prelude::*;

    /// Any entity tag.
    pub fn arb_entity_tag() -> impl Strategy<Value = EntityTag> {
        proptest::sample::select(EntityTag::ALL.to_vec())
    }

    /// A tag that mutations can target.
    pub fn arb_detail_tag() -> impl Strategy<Value = EntityTag> {
        proptest::sample::select(
            EntityTag::ALL
                .iter()
                .copied()
                .filter(EntityTag::is_detail)
                .collect::<Vec<_>>(),
        )
    }

    pub fn arb_mutation_kind() -> impl Strategy<Value = MutationKind> {
        prop_oneof![
            Just(MutationKind::Create),
            Just(MutationKind::Update),
            Just(MutationKind::Delete),
        ]
    }

    pub fn arb_key_part() -> impl Strategy<Value = KeyPart> {
        prop_oneof![
            Just(KeyPart::Null),
            any::<bool>().prop_map(KeyPart::Bool),
            any::<i64>().prop_map(KeyPart::Int),
            "[a-z0-9-]{0,12}".prop_map(KeyPart::Str),
        ]
    }

    pub fn arb_fingerprint() -> impl Strategy<Value = Fingerprint> {
        (arb_entity_tag(), prop::collection::vec(arb_key_part(), 0..4))
            .prop_map(|(tag, params)| Fingerprint::new(tag, params))
    }

    /// A short record id such as `r3`.
    pub fn arb_record_id() -> impl Strategy<Value = String> {
        (0u8..8).prop_map(|n| format!("r{}", n))
    }

    /// A flat JSON record with the given id.
    pub fn arb_record(id: String) -> impl Strategy<Value = Value> {
        (
            prop_oneof![Just("PENDING"), Just("BORROWED"), Just("RETURNED")],
            0i64..100,
        )
            .prop_map(move |(status, count)| {
                serde_json::json!({"id": id.clone(), "status": status, "count": count})
            })
    }

    /// A list of records with distinct ids.
    pub fn arb_record_list() -> impl Strategy<Value = Value> {
        prop::collection::btree_set(0u8..8, 0..6).prop_map(|ids| {
            Value::Array(
                ids.into_iter()
                    .map(|n| serde_json::json!({"id": format!("r{}", n), "status": "PENDING"}))
                    .collect(),
            )
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Library records as the data service returns them.

    use super::*;
    use serde_json::json;

    pub fn book(id: &str, title: &str, available: i64) -> Value {
        json!({
            "id": id,
            "title": title,
            "author": "Frank Herbert",
            "availableCopies": available,
            "totalCopies": 3,
        })
    }

    pub fn borrow_record(id: &str, book_id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "bookId": book_id,
            "userId": "u1",
            "status": status,
        })
    }

    pub fn user(id: &str, name: &str, role: &str) -> Value {
        json!({"id": id, "name": name, "role": role})
    }

    pub fn review(id: &str, book_id: &str, rating: i64) -> Value {
        json!({"id": id, "bookId": book_id, "rating": rating})
    }

    pub fn fine(id: &str, user_id: &str, paid: bool) -> Value {
        json!({"id": id, "userId": user_id, "amount": 250, "paid": paid})
    }

    pub fn admin_stats() -> Value {
        json!({"books": 120, "borrows": 34, "users": 58, "overdue": 3})
    }

    /// `{ "items": [...], "total": n }` page wrapper.
    pub fn page(items: Vec<Value>) -> Value {
        let total = items.len();
        json!({"items": items, "total": total})
    }

    /// Book list filter key: search text, category, page.
    pub fn books_key(search: &str, page: i64) -> Fingerprint {
        Fingerprint::of(EntityTag::Books)
            .with(search)
            .with(KeyPart::Null)
            .with(page)
    }

    /// Borrow list filtered by status.
    pub fn borrows_key(status: &str) -> Fingerprint {
        Fingerprint::of(EntityTag::Borrows).with(status)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over Folio results.

    use super::*;

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &FolioResult<T>) {
        assert!(
            matches!(result, Err(FolioError::Validation(_))),
            "expected validation error, got {:?}",
            result
        );
    }

    pub fn assert_service_code<T: std::fmt::Debug>(
        result: &FolioResult<T>,
        code: ServiceErrorCode,
    ) {
        match result {
            Err(err) => assert_eq!(err.code(), Some(code), "unexpected error {:?}", err),
            Ok(value) => panic!("expected service error {:?}, got Ok({:?})", code, value),
        }
    }

    pub fn assert_single_error_notification(notifications: &[Notification]) {
        assert_eq!(notifications.len(), 1, "{:?}", notifications);
        assert_eq!(notifications[0].severity, Severity::Error);
    }
}
