//! Continuations - the handles steps call to advance their pipeline

use crate::core::{
    error::{ChainError, StepError},
    pipeline::Pipeline,
    scope::{Fragment, Lineage, Scope},
};
use crate::execution::{
    dispatcher::{transition, Cursor, Transition},
    ChainRuntime,
};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Callback receiving the outcome of a finished invocation
pub type Terminal = Arc<dyn Fn(Outcome) + Send + Sync>;

/// Arguments of one continuation call
#[derive(Clone, Default)]
pub struct Input {
    pub(crate) error: Option<StepError>,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) bound: Option<Fragment>,
    pub(crate) caller: Option<Lineage>,
    pub(crate) on_done: Option<Terminal>,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input carrying a scope to another pipeline, recording it as the caller
    pub fn from_scope(scope: &Scope) -> Self {
        Self {
            fragments: vec![scope.fragment()],
            caller: Some(scope.lineage()),
            ..Self::default()
        }
    }

    /// Add a fragment; later fragments win on key collisions
    pub fn with(mut self, fragment: Fragment) -> Self {
        self.fragments.push(fragment);
        self
    }

    pub fn error(mut self, error: StepError) -> Self {
        self.error = Some(error);
        self
    }

    /// Fragment re-applied on every transition of the invocation
    ///
    /// Only read on the first call of a pipeline.
    pub fn bind(mut self, bound: Fragment) -> Self {
        self.bound = Some(bound);
        self
    }

    /// Callback run when the invocation finishes
    ///
    /// Only read on the first call of a pipeline.
    pub fn on_done<F>(mut self, terminal: F) -> Self
    where
        F: Fn(Outcome) + Send + Sync + 'static,
    {
        self.on_done = Some(Arc::new(terminal));
        self
    }

    pub fn on_done_arc(mut self, terminal: Terminal) -> Self {
        self.on_done = Some(terminal);
        self
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("error", &self.error)
            .field("fragments", &self.fragments)
            .field("caller", &self.caller)
            .field("on_done", &self.on_done.is_some())
            .finish_non_exhaustive()
    }
}

impl From<Fragment> for Input {
    fn from(fragment: Fragment) -> Self {
        Input::new().with(fragment)
    }
}

impl From<StepError> for Input {
    fn from(error: StepError) -> Self {
        Input::new().error(error)
    }
}

impl From<Result<Fragment, StepError>> for Input {
    fn from(result: Result<Fragment, StepError>) -> Self {
        match result {
            Ok(fragment) => fragment.into(),
            Err(error) => error.into(),
        }
    }
}

impl From<Outcome> for Input {
    fn from(outcome: Outcome) -> Self {
        Self {
            error: outcome.error,
            fragments: outcome.fragments,
            caller: Some(outcome.lineage),
            ..Self::default()
        }
    }
}

/// What a finished invocation hands to its terminal callback
#[derive(Debug, Clone)]
pub struct Outcome {
    pub error: Option<StepError>,
    /// Fragments passed to the final continuation call
    pub fragments: Vec<Fragment>,
    pub lineage: Lineage,
    /// Scope as it stood when the invocation finished
    pub scope: Scope,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn merged(&self) -> Fragment {
        Fragment::merged(&self.fragments)
    }

    pub fn into_result(self) -> Result<Scope, StepError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.scope),
        }
    }
}

/// Continuation handed to a step
///
/// Calling it runs the next matching step (or the terminal callback) with
/// the merged scope. Cheap to clone; the first call across all clones
/// advances the pipeline and later calls are ignored.
#[derive(Clone)]
pub struct Next {
    pipeline: Arc<Pipeline>,
    runtime: Arc<ChainRuntime>,
    cursor: Cursor,
    /// `None` on an entry, which starts a fresh invocation on every call
    called: Option<Arc<AtomicBool>>,
}

impl Next {
    /// Advance the pipeline
    pub fn call(&self, input: impl Into<Input>) {
        if let Some(called) = &self.called {
            if called.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    step = ?self.cursor.index,
                    scope_id = ?self.cursor.scope.as_ref().map(|s| s.lineage().scope_id),
                    "Continuation called more than once, ignoring"
                );
                return;
            }
        }
        dispatch(&self.pipeline, &self.runtime, &self.cursor, input.into());
    }

    /// Whether this continuation already advanced its pipeline
    pub fn is_called(&self) -> bool {
        self.called
            .as_ref()
            .is_some_and(|called| called.load(Ordering::SeqCst))
    }

    /// Advance the pipeline when `future` resolves
    ///
    /// `Ok` fragments continue normally, `Err` continues with the error.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = Result<Fragment, StepError>> + Send + 'static,
    {
        let next = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = future.await;
                    next.call(result);
                });
            }
            Err(_) => next.call(StepError::fault("no async runtime to await the step on")),
        }
    }

    /// Run a child pipeline with the current scope as caller
    ///
    /// The child's completion resumes this pipeline with the child's outcome.
    pub fn delegate(&self, entry: &Entry, fragment: Fragment) {
        let input = match &self.cursor.scope {
            Some(scope) => Input::from_scope(scope),
            None => Input::new(),
        };
        entry.invoke(input.with(fragment).on_done_arc(self.as_terminal()));
    }

    /// This continuation as a terminal callback for another invocation
    pub fn as_terminal(&self) -> Terminal {
        let next = self.clone();
        Arc::new(move |outcome: Outcome| next.call(outcome))
    }

    /// Scope of the step owning this continuation
    pub fn scope(&self) -> Option<&Scope> {
        self.cursor.scope.as_ref()
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.cursor.index)
            .field("scope", &self.cursor.scope.as_ref().map(Scope::lineage))
            .finish_non_exhaustive()
    }
}

fn dispatch(pipeline: &Arc<Pipeline>, runtime: &Arc<ChainRuntime>, cursor: &Cursor, input: Input) {
    let finished = match cursor.scope {
        Some(_) => cursor.finished.clone(),
        None => Arc::new(AtomicBool::new(false)),
    };
    if finished.load(Ordering::SeqCst) {
        tracing::warn!(step = ?cursor.index, "Invocation already finished, ignoring continuation call");
        return;
    }

    match transition(pipeline, cursor, input, runtime.ids()) {
        Transition::Finish { outcome, terminal } => {
            if finished.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    scope_id = outcome.lineage.scope_id,
                    "Invocation already finished, dropping outcome"
                );
                return;
            }
            finish(outcome, terminal);
        }
        Transition::Run {
            index,
            scope,
            fragments,
            reference,
            terminal,
        } => {
            let Some(step) = pipeline.step(index) else {
                return;
            };
            runtime.trace(pipeline, index, &scope, reference);

            let next = Next {
                pipeline: pipeline.clone(),
                runtime: runtime.clone(),
                cursor: Cursor {
                    index: Some(index),
                    scope: Some(scope.clone()),
                    terminal,
                    finished,
                },
                called: Some(Arc::new(AtomicBool::new(false))),
            };

            let scope_id = scope.lineage().scope_id;
            let func = step.func.clone();
            let result = catch_unwind(AssertUnwindSafe(|| func.call(scope, next.clone(), &fragments)));
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(payload) => Some(StepError::from_panic(payload)),
            };

            match error {
                Some(error) if next.is_called() => {
                    tracing::warn!(
                        scope_id,
                        step = step.description.raw(),
                        "Step failed after advancing its pipeline: {}",
                        error
                    );
                }
                Some(error) => next.call(Input {
                    error: Some(error),
                    fragments,
                    ..Input::default()
                }),
                None => {}
            }
        }
    }
}

fn finish(outcome: Outcome, terminal: Option<Terminal>) {
    match terminal {
        Some(terminal) => terminal(outcome),
        None => {
            if let Some(error) = &outcome.error {
                tracing::error!(
                    scope_id = outcome.lineage.scope_id,
                    status = error.status_code(),
                    "Unhandled pipeline error: {}",
                    error
                );
            }
        }
    }
}

/// The entry continuation of a built pipeline
#[derive(Clone)]
pub struct Entry {
    next: Next,
}

impl Entry {
    pub(crate) fn new(pipeline: Arc<Pipeline>, runtime: Arc<ChainRuntime>) -> Self {
        Self {
            next: Next {
                pipeline,
                runtime,
                cursor: Cursor::default(),
                called: None,
            },
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.next.pipeline
    }

    /// Start a new invocation
    pub fn invoke(&self, input: impl Into<Input>) {
        self.next.call(input);
    }

    /// Start a new invocation and wait for its outcome
    ///
    /// Replaces any terminal callback set on `input`.
    pub async fn run(&self, input: impl Into<Input>) -> Result<Outcome, ChainError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let input: Input = input.into();
        let input = input.on_done(move |outcome| {
            let sender = tx.lock().ok().and_then(|mut tx| tx.take());
            if let Some(sender) = sender {
                let _ = sender.send(outcome);
            }
        });

        self.invoke(input);
        rx.await.map_err(|_| ChainError::Abandoned)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("steps", &self.next.pipeline.len())
            .finish()
    }
}
