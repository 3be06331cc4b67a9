//! Pipeline domain model and its definition-time builder

use crate::core::{
    error::StepError,
    scope::{Fragment, Scope},
    step::{StepDescriptor, StepFn, StepKind},
};
use crate::execution::{ChainRuntime, Entry, Next};
use std::future::Future;
use std::sync::Arc;

/// An immutable, ordered list of steps and catches
#[derive(Debug)]
pub struct Pipeline {
    steps: Vec<StepDescriptor>,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&StepDescriptor> {
        self.steps.get(index)
    }

    pub fn kind(&self, index: usize) -> Option<StepKind> {
        self.steps.get(index).map(|s| s.kind)
    }

    /// First index at or after `from` whose kind is `kind`
    pub fn position_from(&self, from: usize, kind: StepKind) -> Option<usize> {
        self.steps
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, step)| step.kind == kind)
            .map(|(index, _)| index)
    }

    /// Render the description of a step against a scope
    pub fn describe(&self, index: usize, scope: &Scope) -> String {
        self.steps
            .get(index)
            .map(|step| step.description.render(scope))
            .unwrap_or_default()
    }
}

/// A pipeline under construction
///
/// Created by [`ChainRuntime::start`]; steps and catches are appended in
/// order, and [`Chain::build`] returns the entry continuation.
pub struct Chain {
    runtime: Arc<ChainRuntime>,
    steps: Vec<StepDescriptor>,
}

impl Chain {
    pub(crate) fn new(runtime: Arc<ChainRuntime>, description: String, func: Arc<dyn StepFn>) -> Self {
        Self {
            runtime,
            steps: vec![StepDescriptor::new(StepKind::Step, description, func)],
        }
    }

    /// Append a step run when no error is pending
    pub fn step<F>(mut self, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Scope, Next, &[Fragment]) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.steps
            .push(StepDescriptor::new(StepKind::Step, description, Arc::new(func)));
        self
    }

    /// Append a catch run only while an error is pending
    pub fn catch<F>(mut self, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Scope, Next, &[Fragment]) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.steps
            .push(StepDescriptor::new(StepKind::Catch, description, Arc::new(func)));
        self
    }

    /// Append a step whose future's output is passed to the continuation
    pub fn step_async<F, Fut>(self, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fragment, StepError>> + Send + 'static,
    {
        self.step(description, move |scope, next, _| {
            next.spawn(func(scope));
            Ok(())
        })
    }

    /// Append a catch whose future's output is passed to the continuation
    ///
    /// Resolving with `Ok` clears the error; resolving with `Err` re-raises.
    pub fn catch_async<F, Fut>(self, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fragment, StepError>> + Send + 'static,
    {
        self.catch(description, move |scope, next, _| {
            next.spawn(func(scope));
            Ok(())
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Close the definition phase and return the entry continuation
    pub fn build(self) -> Entry {
        let pipeline = Arc::new(Pipeline { steps: self.steps });
        Entry::new(pipeline, self.runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExecutionMode;

    fn noop(_: Scope, next: Next, _: &[Fragment]) -> Result<(), StepError> {
        next.call(Fragment::new());
        Ok(())
    }

    #[test]
    fn test_builder_appends_in_order() {
        let runtime = ChainRuntime::new(ExecutionMode::Production);
        let entry = runtime
            .start("a", noop)
            .step("b", noop)
            .catch("c", noop)
            .step("d", noop)
            .build();

        let pipeline = entry.pipeline();
        assert_eq!(pipeline.len(), 4);
        assert_eq!(pipeline.kind(2), Some(StepKind::Catch));
        assert_eq!(pipeline.position_from(1, StepKind::Step), Some(1));
        assert_eq!(pipeline.position_from(2, StepKind::Step), Some(3));
        assert_eq!(pipeline.position_from(0, StepKind::Catch), Some(2));
        assert_eq!(pipeline.position_from(3, StepKind::Catch), None);
    }
}
