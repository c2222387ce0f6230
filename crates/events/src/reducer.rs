//! Reducer composition (mechanics only, no business rules).
//!
//! A reducer is a pure function from `(slice state, action)` to a
//! [`Reduction`]: an info record plus the declarative updates for its slice.
//! [`combine_reducers`] folds many of them into one [`RootReducer`] keyed by
//! slice name.
//!
//! Pass-in reducers cover the case where one business event must move two
//! otherwise independent slices in the same log record. Rather than closing
//! over the other slice, a pass-in reducer receives a [`PassIn`] handle: an
//! explicit registry lookup of the target slice's reducer together with the
//! target slice's current state. Whatever the handle returns is merged under
//! the target slice by the combinator.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use stockflow_core::{CHANGE_COUNT, CONTROL_SLICE, SliceState, StateChanges, StateUpdate, StoreState};

use crate::Action;
use crate::info::{ReducerInfo, SliceInfos};

/// Result of one reducer invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    pub info: ReducerInfo,
    pub updates: Vec<StateUpdate>,
}

impl Reduction {
    /// Nothing to do for this action.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn updates(updates: Vec<StateUpdate>) -> Self {
        Self {
            info: ReducerInfo::ok(),
            updates,
        }
    }

    pub fn update(update: StateUpdate) -> Self {
        Self::updates(vec![update])
    }

    /// A business-rule failure that is still recorded through `updates`.
    pub fn failed(message: impl Into<String>, updates: Vec<StateUpdate>) -> Self {
        Self {
            info: ReducerInfo::failed(message),
            updates,
        }
    }

    pub fn with_info(mut self, info: ReducerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn is_noop(&self) -> bool {
        self.updates.is_empty() && self.info == ReducerInfo::default()
    }
}

/// Pure reducer for a single slice.
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: &SliceState, action: &Action) -> Reduction;
}

impl<F> Reducer for F
where
    F: Fn(&SliceState, &Action) -> Reduction + Send + Sync,
{
    fn reduce(&self, state: &SliceState, action: &Action) -> Reduction {
        self(state, action)
    }
}

/// Handle to another slice's reducer, given to a [`PassInReducer`].
pub struct PassIn<'a> {
    slice: &'a str,
    reducer: &'a dyn Reducer,
    state: &'a SliceState,
}

impl<'a> PassIn<'a> {
    /// Target slice name.
    pub fn slice(&self) -> &str {
        self.slice
    }

    /// Target slice's current state.
    pub fn state(&self) -> &SliceState {
        self.state
    }

    /// Run the target slice's reducer synchronously.
    pub fn reduce(&self, action: &Action) -> Reduction {
        self.reducer.reduce(self.state, action)
    }
}

/// Output of a pass-in reducer: its own slice plus, optionally, the target's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassInReduction {
    pub own: Reduction,
    pub passed: Option<Reduction>,
}

impl PassInReduction {
    pub fn own(own: Reduction) -> Self {
        Self { own, passed: None }
    }

    pub fn both(own: Reduction, passed: Reduction) -> Self {
        Self {
            own,
            passed: Some(passed),
        }
    }
}

/// Reducer that may also drive another slice's reducer.
pub trait PassInReducer: Send + Sync {
    fn reduce(&self, state: &SliceState, action: &Action, target: &PassIn<'_>) -> PassInReduction;
}

impl<F> PassInReducer for F
where
    F: Fn(&SliceState, &Action, &PassIn<'_>) -> PassInReduction + Send + Sync,
{
    fn reduce(&self, state: &SliceState, action: &Action, target: &PassIn<'_>) -> PassInReduction {
        self(state, action, target)
    }
}

/// A pass-in reducer bound to its own slice and its target slice.
#[derive(Clone)]
pub struct PassInBinding {
    slice: String,
    target: String,
    reducer: Arc<dyn PassInReducer>,
}

impl PassInBinding {
    pub fn new(
        slice: impl Into<String>,
        target: impl Into<String>,
        reducer: impl PassInReducer + 'static,
    ) -> Self {
        Self {
            slice: slice.into(),
            target: target.into(),
            reducer: Arc::new(reducer),
        }
    }
}

impl core::fmt::Debug for PassInBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PassInBinding")
            .field("slice", &self.slice)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReducerError {
    #[error("slice '{0}' is reserved")]
    ReservedSlice(String),

    #[error("slice '{0}' has more than one reducer")]
    DuplicateSlice(String),

    #[error("pass-in reducer '{slice}' targets unregistered slice '{target}'")]
    UnknownTarget { slice: String, target: String },
}

/// Result of running the root reducer for one action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedReduction {
    pub infos: SliceInfos,
    pub changes: StateChanges,
}

impl CombinedReduction {
    fn absorb(&mut self, slice: &str, reduction: Reduction) {
        if reduction.is_noop() {
            return;
        }
        match self.infos.get_mut(slice) {
            Some(existing) => existing.merge(reduction.info),
            None => {
                self.infos.insert(slice.to_string(), reduction.info);
            }
        }
        self.changes.extend(slice, reduction.updates);
    }

    /// True when only the control slice changed.
    pub fn is_control_only(&self) -> bool {
        self.changes.slices().all(|s| s == CONTROL_SLICE)
    }
}

/// One reducer composed from many slices.
#[derive(Clone)]
pub struct RootReducer {
    reducers: Vec<(String, Arc<dyn Reducer>)>,
    pass_in: Vec<PassInBinding>,
}

impl core::fmt::Debug for RootReducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RootReducer")
            .field("slices", &self.reducers.iter().map(|(s, _)| s).collect::<Vec<_>>())
            .field("pass_in", &self.pass_in)
            .finish()
    }
}

/// Build a root reducer.
///
/// The control reducer (INC `_control.change_count`) always runs first, so
/// every dispatch changes at least the control slice.
pub fn combine_reducers(
    reducers: Vec<(String, Arc<dyn Reducer>)>,
    pass_in: Vec<PassInBinding>,
) -> Result<RootReducer, ReducerError> {
    let mut registry: BTreeSet<&str> = BTreeSet::new();
    for (slice, _) in &reducers {
        if slice == CONTROL_SLICE {
            return Err(ReducerError::ReservedSlice(slice.clone()));
        }
        if !registry.insert(slice.as_str()) {
            return Err(ReducerError::DuplicateSlice(slice.clone()));
        }
    }

    for binding in &pass_in {
        if binding.slice == CONTROL_SLICE {
            return Err(ReducerError::ReservedSlice(binding.slice.clone()));
        }
        if !registry.contains(binding.target.as_str()) {
            return Err(ReducerError::UnknownTarget {
                slice: binding.slice.clone(),
                target: binding.target.clone(),
            });
        }
    }

    Ok(RootReducer { reducers, pass_in })
}

impl RootReducer {
    /// Slices that have a reducer (ordinary or pass-in).
    pub fn slices(&self) -> impl Iterator<Item = &str> {
        self.reducers
            .iter()
            .map(|(s, _)| s.as_str())
            .chain(self.pass_in.iter().map(|b| b.slice.as_str()))
    }

    fn lookup(&self, slice: &str) -> Option<&dyn Reducer> {
        self.reducers
            .iter()
            .find(|(s, _)| s == slice)
            .map(|(_, r)| r.as_ref())
    }

    /// Run every reducer against `state` for `action`.
    pub fn reduce(&self, state: &StoreState, action: &Action) -> CombinedReduction {
        let empty = SliceState::default();
        let slice_state = |name: &str| state.slice(name).unwrap_or(&empty);

        let mut combined = CombinedReduction::default();
        combined.changes.extend(CONTROL_SLICE, [StateUpdate::inc(CHANGE_COUNT)]);

        for (slice, reducer) in &self.reducers {
            let reduction = reducer.reduce(slice_state(slice), action);
            combined.absorb(slice, reduction);
        }

        for binding in &self.pass_in {
            // Targets were checked in `combine_reducers`.
            let Some(target_reducer) = self.lookup(&binding.target) else {
                continue;
            };
            let handle = PassIn {
                slice: &binding.target,
                reducer: target_reducer,
                state: slice_state(&binding.target),
            };
            let out = binding
                .reducer
                .reduce(slice_state(&binding.slice), action, &handle);
            combined.absorb(&binding.slice, out.own);
            if let Some(passed) = out.passed {
                combined.absorb(&binding.target, passed);
            }
        }

        combined
    }
}
