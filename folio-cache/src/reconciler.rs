//! Cache reconciler.
//!
//! Applies the outcome of a successful mutation to the read cache:
//!
//! 1. write the fresh state to the entity's detail entry (update) or remove
//!    it (delete);
//! 2. patch every cached list that embeds the record (update);
//! 3. mark stale every other entry the rule names, skipping anything written
//!    in steps 1 and 2. Lists of the entity that do not embed the record are
//!    stale too: a filter may now include or exclude it.
//!
//! A failed outcome leaves the cache untouched. Reconciling the same outcome
//! twice leaves the cache as after the first run, apart from watermarks.

use std::collections::HashSet;

use folio_core::{
    EntityTag, Fingerprint, KeyPart, MutationKind, MutationOutcome, MutationRequest,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::read_cache::ReadCache;
use crate::rules::InvalidationRules;

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Detail entries overwritten with fresh state.
    pub written: Vec<Fingerprint>,
    /// List entries patched in place.
    pub patched: Vec<Fingerprint>,
    /// List entries that already held the fresh record.
    pub current: Vec<Fingerprint>,
    /// Detail entries dropped after a delete.
    pub removed: Vec<Fingerprint>,
    /// Entries marked stale.
    pub invalidated: Vec<Fingerprint>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
            && self.patched.is_empty()
            && self.current.is_empty()
            && self.removed.is_empty()
            && self.invalidated.is_empty()
    }

    /// Every fingerprint whose entry holds known-good data after the pass.
    pub fn refreshed(&self) -> HashSet<Fingerprint> {
        self.written
            .iter()
            .chain(&self.patched)
            .chain(&self.current)
            .cloned()
            .collect()
    }
}

/// Applies mutation outcomes to a [`ReadCache`].
#[derive(Debug, Clone)]
pub struct CacheReconciler {
    cache: ReadCache,
    rules: &'static InvalidationRules,
}

impl CacheReconciler {
    pub fn new(cache: ReadCache) -> Self {
        Self {
            cache,
            rules: InvalidationRules::library(),
        }
    }

    pub fn with_rules(mut self, rules: &'static InvalidationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Reconcile the cache with one mutation outcome.
    pub fn reconcile(
        &self,
        entity: EntityTag,
        outcome: &MutationOutcome,
        request: &MutationRequest,
    ) -> ReconcileReport {
        let Some(fresh) = outcome.fresh_state() else {
            trace!(request_id = %request.request_id, "Failed mutation, cache untouched");
            return ReconcileReport::default();
        };
        let Some(rule) = self.rules.rule(entity, request.kind) else {
            debug!(
                entity = %entity,
                kind = %request.kind,
                "No invalidation rule, cache untouched"
            );
            return ReconcileReport::default();
        };

        let mut report = ReconcileReport::default();
        let id = record_id(fresh, request);

        match (request.kind, id) {
            (MutationKind::Update, Some(id)) => {
                let detail = Fingerprint::detail(entity, id.clone());
                self.cache.set(detail.clone(), fresh.clone());
                report.written.push(detail);

                for list_tag in entity.list_tags() {
                    for fingerprint in self.cache.fingerprints(*list_tag) {
                        let mut embeds = false;
                        let patched = self.cache.patch(&fingerprint, |list| {
                            embeds = find_record(list, &id).is_some();
                            patch_list(list, &id, fresh)
                        });
                        if patched {
                            report.patched.push(fingerprint);
                        } else if embeds {
                            report.current.push(fingerprint);
                        }
                    }
                }
            }
            (MutationKind::Delete, Some(id)) => {
                let detail = Fingerprint::detail(entity, id);
                if self.cache.remove(&detail).is_some() {
                    report.removed.push(detail);
                }
            }
            (MutationKind::Update | MutationKind::Delete, None) => {
                debug!(
                    request_id = %request.request_id,
                    "Mutation result carries no record id, nothing written"
                );
            }
            (MutationKind::Create, _) => {}
        }

        let keep = report.refreshed();
        for tag in &rule.invalidates {
            report
                .invalidated
                .extend(self.cache.mark_stale_except(*tag, &keep));
        }

        debug!(
            request_id = %request.request_id,
            entity = %entity,
            kind = %request.kind,
            written = report.written.len(),
            patched = report.patched.len(),
            current = report.current.len(),
            removed = report.removed.len(),
            invalidated = report.invalidated.len(),
            "Cache reconciled"
        );
        report
    }
}

/// Id of the mutated record: the fresh state's `id`, else the request target.
fn record_id(fresh: &Value, request: &MutationRequest) -> Option<KeyPart> {
    match fresh.get("id") {
        Some(id) if !id.is_null() => Some(KeyPart::from_json(id)),
        _ => request.target_id().cloned(),
    }
}

/// Replace the element with `id` in a list value with `fresh` merged over it.
///
/// Lists are either a bare array or an object with an `items` array. Returns
/// `None` when the list does not contain the record or nothing changed.
pub fn patch_list(list: &Value, id: &KeyPart, fresh: &Value) -> Option<Value> {
    match list {
        Value::Array(items) => patch_items(items, id, fresh).map(Value::Array),
        Value::Object(page) => {
            let Some(Value::Array(items)) = page.get("items") else {
                return None;
            };
            let items = patch_items(items, id, fresh)?;
            let mut page = page.clone();
            page.insert("items".to_string(), Value::Array(items));
            Some(Value::Object(page))
        }
        _ => None,
    }
}

/// Position of the record with `id` in a list value, if it is there.
fn find_record(list: &Value, id: &KeyPart) -> Option<usize> {
    let items = match list {
        Value::Array(items) => items,
        Value::Object(page) => match page.get("items") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    position_of(items, id)
}

fn position_of(items: &[Value], id: &KeyPart) -> Option<usize> {
    items
        .iter()
        .position(|item| item.get("id").is_some_and(|item_id| id.matches_json(item_id)))
}

fn patch_items(items: &[Value], id: &KeyPart, fresh: &Value) -> Option<Vec<Value>> {
    let position = position_of(items, id)?;
    let merged = merge_shallow(&items[position], fresh);
    if merged == items[position] {
        return None;
    }
    let mut items = items.to_vec();
    items[position] = merged;
    Some(items)
}

/// Top-level fields of `fresh` over `base`. Non-objects are replaced whole.
fn merge_shallow(base: &Value, fresh: &Value) -> Value {
    match (base, fresh) {
        (Value::Object(base), Value::Object(fresh)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in fresh {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => fresh.clone(),
    }
}
