//! Step domain model

use crate::core::{error::StepError, scope::{Fragment, Scope}};
use crate::execution::Next;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Whether a step runs on the happy path or only while an error is live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Step,
    Catch,
}

/// The function run for a step
///
/// Receives the current scope, the continuation that advances the pipeline,
/// and the fragments the continuation was called with. Returning `Err`
/// behaves exactly like calling `next` with that error.
pub trait StepFn: Send + Sync {
    fn call(&self, scope: Scope, next: Next, fragments: &[Fragment]) -> Result<(), StepError>;
}

impl<F> StepFn for F
where
    F: Fn(Scope, Next, &[Fragment]) -> Result<(), StepError> + Send + Sync,
{
    fn call(&self, scope: Scope, next: Next, fragments: &[Fragment]) -> Result<(), StepError> {
        self(scope, next, fragments)
    }
}

/// Description with `${dotted.path}` placeholders rendered against a scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionTemplate {
    raw: String,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(.+?)\}").expect("placeholder pattern is valid"))
}

impl DescriptionTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Render placeholders; unresolved ones are left as written
    pub fn render(&self, scope: &Scope) -> String {
        placeholder_pattern()
            .replace_all(&self.raw, |caps: &Captures| match scope.lookup(&caps[1]) {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

/// A single step of a pipeline: immutable once defined
#[derive(Clone)]
pub struct StepDescriptor {
    pub kind: StepKind,
    pub description: DescriptionTemplate,
    pub func: Arc<dyn StepFn>,
}

impl StepDescriptor {
    pub fn new(kind: StepKind, description: impl Into<String>, func: Arc<dyn StepFn>) -> Self {
        Self {
            kind,
            description: DescriptionTemplate::new(description),
            func,
        }
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("kind", &self.kind)
            .field("description", &self.description.raw)
            .finish_non_exhaustive()
    }
}
