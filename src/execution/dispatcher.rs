//! Index-based dispatcher - decides which step runs next

use crate::core::{
    pipeline::Pipeline,
    scope::{Fragment, Lineage, Scope},
    step::StepKind,
};
use crate::execution::{
    continuation::{Input, Outcome, Terminal},
    runtime::ScopeIds,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Position of a continuation inside its pipeline
#[derive(Clone, Default)]
pub(crate) struct Cursor {
    /// Index of the step that owns the continuation; `None` before the first step
    pub index: Option<usize>,
    pub scope: Option<Scope>,
    pub terminal: Option<Terminal>,
    /// Set once the invocation reached its terminal; shared by all its cursors
    pub finished: Arc<AtomicBool>,
}

/// Result of one continuation call
pub(crate) enum Transition {
    Run {
        index: usize,
        scope: Scope,
        fragments: Vec<Fragment>,
        /// Lineage the trace relation is computed from
        reference: Option<Lineage>,
        terminal: Option<Terminal>,
    },
    Finish {
        outcome: Outcome,
        terminal: Option<Terminal>,
    },
}

/// Compute the next scope and the step it runs in
pub(crate) fn transition(
    pipeline: &Pipeline,
    cursor: &Cursor,
    input: Input,
    ids: &ScopeIds,
) -> Transition {
    let Input {
        error,
        fragments,
        bound,
        caller,
        on_done,
    } = input;
    let given = Fragment::merged(&fragments);

    let (mut scope, terminal, reference) = match &cursor.scope {
        Some(previous) => {
            let scope = Scope::advance(
                Some(previous),
                &given,
                previous.bound().clone(),
                previous.lineage(),
                error,
            );
            let reference = caller.or(Some(previous.lineage()));
            (scope, cursor.terminal.clone(), reference)
        }
        None => {
            let lineage = ids.open(caller.as_ref());
            let scope = Scope::advance(None, &given, bound.unwrap_or_default(), lineage, error);
            (scope, on_done, caller)
        }
    };

    let from = cursor.index.map_or(0, |index| index + 1);
    let wanted = if scope.error().is_some() {
        StepKind::Catch
    } else {
        StepKind::Step
    };
    let target = pipeline.position_from(from, wanted);

    if let Some(left) = cursor.index {
        if scope.error().is_some() && pipeline.kind(left) == Some(StepKind::Step) {
            let description = pipeline.describe(left, &scope);
            if let Some(error) = scope.error_mut() {
                error.annotate(&description);
            }
        }
    }

    match target {
        Some(index) => Transition::Run {
            index,
            scope,
            fragments,
            reference,
            terminal,
        },
        None => Transition::Finish {
            outcome: Outcome {
                error: scope.error().cloned(),
                lineage: scope.lineage(),
                fragments,
                scope,
            },
            terminal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{config::ExecutionMode, error::StepError};
    use crate::execution::{ChainRuntime, Next};

    fn pass(_: Scope, next: Next, _: &[Fragment]) -> Result<(), StepError> {
        next.call(Fragment::new());
        Ok(())
    }

    fn pipeline() -> std::sync::Arc<Pipeline> {
        ChainRuntime::new(ExecutionMode::Production)
            .start("fetch ${userId}", pass)
            .step("render", pass)
            .catch("recover", pass)
            .step("respond", pass)
            .build()
            .pipeline()
            .clone()
    }

    fn run_index(t: &Transition) -> Option<usize> {
        match t {
            Transition::Run { index, .. } => Some(*index),
            Transition::Finish { .. } => None,
        }
    }

    #[test]
    fn test_first_call_opens_root_scope() {
        let pipeline = pipeline();
        let ids = ScopeIds::default();
        let t = transition(
            &pipeline,
            &Cursor::default(),
            Input::new().with(Fragment::new().with("userId", 42)),
            &ids,
        );

        match t {
            Transition::Run { index, scope, .. } => {
                assert_eq!(index, 0);
                assert_eq!(scope.depth(), 0);
                assert_eq!(scope.parent_id(), None);
                assert_eq!(scope.get("userId"), Some(&serde_json::json!(42)));
            }
            Transition::Finish { .. } => panic!("expected a step to run"),
        }
    }

    #[test]
    fn test_error_skips_to_catch_with_annotation() {
        let pipeline = pipeline();
        let ids = ScopeIds::default();
        let first = transition(
            &pipeline,
            &Cursor::default(),
            Input::new().with(Fragment::new().with("userId", 42)),
            &ids,
        );
        let Transition::Run { scope, .. } = first else {
            panic!("expected a step to run");
        };

        let cursor = Cursor {
            index: Some(0),
            scope: Some(scope),
            terminal: None,
            ..Cursor::default()
        };
        let t = transition(&pipeline, &cursor, StepError::fault("boom").into(), &ids);
        assert_eq!(run_index(&t), Some(2));
        if let Transition::Run { scope, .. } = t {
            assert_eq!(scope.error().map(|e| e.message()), Some("couldn't fetch 42 : boom"));
        }
    }

    #[test]
    fn test_error_after_last_catch_finishes() {
        let pipeline = pipeline();
        let ids = ScopeIds::default();
        let scope = Scope::advance(
            None,
            &Fragment::new(),
            Fragment::new(),
            ids.open(None),
            None,
        );
        let cursor = Cursor {
            index: Some(3),
            scope: Some(scope),
            terminal: None,
            ..Cursor::default()
        };

        let t = transition(&pipeline, &cursor, StepError::reject("late").into(), &ids);
        match t {
            Transition::Finish { outcome, .. } => {
                assert_eq!(outcome.error.map(|e| e.to_string()).as_deref(), Some("couldn't respond : late"));
            }
            Transition::Run { .. } => panic!("no catch remains"),
        }
    }

    #[test]
    fn test_catch_clearing_error_resumes_steps() {
        let pipeline = pipeline();
        let ids = ScopeIds::default();
        let scope = Scope::advance(
            None,
            &Fragment::new(),
            Fragment::new(),
            ids.open(None),
            Some(StepError::fault("boom")),
        );
        let cursor = Cursor {
            index: Some(2),
            scope: Some(scope),
            terminal: None,
            ..Cursor::default()
        };

        let t = transition(&pipeline, &cursor, Input::new(), &ids);
        assert_eq!(run_index(&t), Some(3));
    }
}
