//! Scope - the accumulating context threaded through one pipeline invocation

use crate::core::error::StepError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Plain key/value data contributed by steps
pub type Values = Map<String, Value>;

/// Identity of a scope and its place in the invocation tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lineage {
    pub scope_id: u64,
    pub scope_depth: usize,
    pub scope_parent_id: Option<u64>,
}

/// Shared, non-serializable objects carried alongside scope values
///
/// Keyed by type, so a scope holds at most one handle per type.
#[derive(Clone, Default)]
pub struct Handles {
    by_type: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Handles {
    pub fn insert<T: Any + Send + Sync>(&mut self, handle: Arc<T>) {
        self.by_type.insert(TypeId::of::<T>(), handle);
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|handle| handle.clone().downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    fn extend(&mut self, other: &Handles) {
        for (type_id, handle) in &other.by_type {
            self.by_type.insert(*type_id, handle.clone());
        }
    }
}

impl fmt::Debug for Handles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handles").field("count", &self.by_type.len()).finish()
    }
}

/// One contribution to a scope: values plus typed handles
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    values: Values,
    handles: Handles,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style value insertion
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Builder-style handle insertion
    pub fn with_handle<T: Any + Send + Sync>(mut self, handle: Arc<T>) -> Self {
        self.handles.insert(handle);
        self
    }

    /// Build a fragment from any value serializing to a JSON object
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, StepError> {
        match serde_json::to_value(value)? {
            Value::Object(values) => Ok(Self::from(values)),
            other => Err(StepError::fault(format!(
                "expected an object to merge into scope, got {}",
                other
            ))),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn handle<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handles.get::<T>()
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn handles(&self) -> &Handles {
        &self.handles
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.handles.is_empty()
    }

    /// Shallow merge: keys of `other` override keys of `self`
    pub fn merge(&mut self, other: &Fragment) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
        self.handles.extend(&other.handles);
    }

    /// Merge a sequence of fragments in order, later ones winning
    pub fn merged<'a>(fragments: impl IntoIterator<Item = &'a Fragment>) -> Fragment {
        let mut merged = Fragment::new();
        for fragment in fragments {
            merged.merge(fragment);
        }
        merged
    }
}

impl From<Values> for Fragment {
    fn from(values: Values) -> Self {
        Self {
            values,
            handles: Handles::default(),
        }
    }
}

/// Accumulated state of one pipeline invocation
#[derive(Debug, Clone)]
pub struct Scope {
    lineage: Lineage,
    error: Option<StepError>,
    state: Fragment,
    bound: Fragment,
}

impl Scope {
    /// Build the next scope from the previous one and the latest contributions
    ///
    /// `bound` is applied after `given` so its keys cannot be overridden by steps.
    pub(crate) fn advance(
        previous: Option<&Scope>,
        given: &Fragment,
        bound: Fragment,
        lineage: Lineage,
        error: Option<StepError>,
    ) -> Scope {
        let mut state = previous.map(|s| s.state.clone()).unwrap_or_default();
        state.merge(given);
        state.merge(&bound);
        Scope {
            lineage,
            error,
            state,
            bound,
        }
    }

    pub fn lineage(&self) -> Lineage {
        self.lineage
    }

    pub fn id(&self) -> u64 {
        self.lineage.scope_id
    }

    pub fn depth(&self) -> usize {
        self.lineage.scope_depth
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.lineage.scope_parent_id
    }

    pub fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    pub(crate) fn error_mut(&mut self) -> Option<&mut StepError> {
        self.error.as_mut()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn handle<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.state.handle::<T>()
    }

    pub fn values(&self) -> &Values {
        self.state.values()
    }

    /// The bound fragment re-applied on every transition
    pub fn bound(&self) -> &Fragment {
        &self.bound
    }

    /// Values and handles of this scope, for handing to another pipeline
    pub fn fragment(&self) -> Fragment {
        self.state.clone()
    }

    /// Resolve a dotted path such as `user.address.city` or `items.0`
    ///
    /// `scopeId`, `scopeDepth` and `scopeParentId` resolve from the lineage.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        match path {
            "scopeId" => return Some(Value::from(self.lineage.scope_id)),
            "scopeDepth" => return Some(Value::from(self.lineage.scope_depth)),
            "scopeParentId" => return self.lineage.scope_parent_id.map(Value::from),
            _ => {}
        }

        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.state.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}
