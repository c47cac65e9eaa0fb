//! Reference-stable views over cached values.
//!
//! UI code re-renders when the `Arc` it holds changes identity. [`Memo`]
//! keeps the previous `Arc` when a new value compares equal, and
//! [`Selector`] recomputes a derived view only when its source `Arc` changes.

use std::sync::Arc;

use serde_json::Value;

/// Holds the latest value, reusing its `Arc` across equal updates.
#[derive(Debug, Clone)]
pub struct Memo<T> {
    current: Option<Arc<T>>,
}

impl<T: PartialEq> Memo<T> {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Store `next`, or keep the current `Arc` if it is equal.
    pub fn update(&mut self, next: T) -> Arc<T> {
        match &self.current {
            Some(current) if **current == next => Arc::clone(current),
            _ => {
                let next = Arc::new(next);
                self.current = Some(Arc::clone(&next));
                next
            }
        }
    }

    pub fn current(&self) -> Option<&Arc<T>> {
        self.current.as_ref()
    }
}

impl<T: PartialEq> Default for Memo<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived view over a cached JSON value.
pub struct Selector<T, F> {
    select: F,
    source: Option<Arc<Value>>,
    memo: Memo<T>,
    computations: u64,
}

impl<T, F> Selector<T, F>
where
    T: PartialEq,
    F: Fn(&Value) -> T,
{
    pub fn new(select: F) -> Self {
        Self {
            select,
            source: None,
            memo: Memo::new(),
            computations: 0,
        }
    }

    /// View of `source`, recomputed only if `source` is a different `Arc`.
    pub fn select(&mut self, source: &Arc<Value>) -> Arc<T> {
        if let (Some(previous), Some(view)) = (&self.source, self.memo.current()) {
            if Arc::ptr_eq(previous, source) {
                return Arc::clone(view);
            }
        }
        self.computations += 1;
        let view = self.memo.update((self.select)(source));
        self.source = Some(Arc::clone(source));
        view
    }

    /// Number of times the select function has run.
    pub fn computations(&self) -> u64 {
        self.computations
    }
}

impl<T: std::fmt::Debug, F> std::fmt::Debug for Selector<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("current", &self.memo.current)
            .field("computations", &self.computations)
            .finish_non_exhaustive()
    }
}
