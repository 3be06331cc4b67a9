//! Chain runtime - scope id allocation, tracing and pipeline construction

use crate::core::{
    config::{ExecutionMode, RuntimeConfig},
    error::StepError,
    pipeline::{Chain, Pipeline},
    scope::{Fragment, Lineage, Scope},
};
use crate::execution::{
    tracer::{color_class, Relation, StepTrace, Tracer},
    Next,
};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

/// Function whose output is appended to every trace line
pub type WatchFn = Arc<dyn Fn(&Scope) -> Result<String, StepError> + Send + Sync>;

#[derive(Debug, Default)]
struct IdState {
    last: u64,
    last_logged: Option<u64>,
}

/// Allocates scope ids and remembers the last traced one
#[derive(Debug, Default)]
pub struct ScopeIds {
    state: Mutex<IdState>,
}

impl ScopeIds {
    /// Lineage for a new invocation started by `caller`
    ///
    /// Ids whose color class matches the caller's or the last traced id are
    /// skipped so adjacent scopes stay distinguishable.
    pub fn open(&self, caller: Option<&Lineage>) -> Lineage {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut id = state.last + 1;
        let taken = |id: u64| {
            caller.is_some_and(|c| color_class(c.scope_id) == color_class(id))
                || state.last_logged.is_some_and(|l| color_class(l) == color_class(id))
        };
        while taken(id) {
            id += 1;
        }
        state.last = id;

        Lineage {
            scope_id: id,
            scope_depth: caller.map_or(0, |c| c.scope_depth + 1),
            scope_parent_id: caller.map(|c| c.scope_id),
        }
    }

    pub fn last_logged(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.last_logged)
    }

    fn log(&self, scope_id: u64) -> Option<u64> {
        match self.state.lock() {
            Ok(mut state) => state.last_logged.replace(scope_id),
            Err(_) => None,
        }
    }
}

/// Explicit owner of everything pipelines share at run time
pub struct ChainRuntime {
    mode: ExecutionMode,
    ids: ScopeIds,
    tracer: Option<Arc<dyn Tracer>>,
    watch: RwLock<Option<WatchFn>>,
}

impl ChainRuntime {
    pub fn new(mode: ExecutionMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            ids: ScopeIds::default(),
            tracer: None,
            watch: RwLock::new(None),
        })
    }

    pub fn with_tracer(mode: ExecutionMode, tracer: Arc<dyn Tracer>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            ids: ScopeIds::default(),
            tracer: Some(tracer),
            watch: RwLock::new(None),
        })
    }

    pub fn from_config(config: &RuntimeConfig, tracer: Option<Arc<dyn Tracer>>) -> Arc<Self> {
        Arc::new(Self {
            mode: config.mode,
            ids: ScopeIds::default(),
            tracer,
            watch: RwLock::new(None),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn ids(&self) -> &ScopeIds {
        &self.ids
    }

    /// Append the output of `watch` to every subsequent trace
    ///
    /// Errors from the watch function are ignored.
    pub fn watch_all<F>(&self, watch: F)
    where
        F: Fn(&Scope) -> Result<String, StepError> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.watch.write() {
            *slot = Some(Arc::new(watch));
        }
    }

    /// Start defining a pipeline with its first step
    pub fn start<F>(self: &Arc<Self>, description: impl Into<String>, func: F) -> Chain
    where
        F: Fn(Scope, Next, &[Fragment]) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Chain::new(self.clone(), description.into(), Arc::new(func))
    }

    /// Start defining a pipeline whose first step is a future
    pub fn start_async<F, Fut>(self: &Arc<Self>, description: impl Into<String>, func: F) -> Chain
    where
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fragment, StepError>> + Send + 'static,
    {
        self.start(description, move |scope, next, _| {
            next.spawn(func(scope));
            Ok(())
        })
    }

    /// Record and report the step about to run
    pub(crate) fn trace(
        &self,
        pipeline: &Pipeline,
        index: usize,
        scope: &Scope,
        reference: Option<Lineage>,
    ) {
        if self.mode.is_production() {
            return;
        }

        let previous = self.ids.log(scope.id());
        let Some(tracer) = &self.tracer else {
            return;
        };
        let Some(step) = pipeline.step(index) else {
            return;
        };

        let relation = match reference {
            None => Relation::Entered,
            Some(r) if r.scope_id == scope.id() => {
                if previous == Some(scope.id()) {
                    Relation::Sequential
                } else {
                    Relation::Interrupted
                }
            }
            Some(r) if r.scope_depth < scope.depth() => Relation::Descended,
            Some(r) if r.scope_depth > scope.depth() => Relation::Ascended,
            Some(_) => Relation::Interrupted,
        };

        let watch = self
            .watch
            .read()
            .ok()
            .and_then(|w| w.clone())
            .and_then(|w| w(scope).ok());

        tracer.on_step(&StepTrace {
            kind: step.kind,
            relation,
            scope_id: scope.id(),
            color: color_class(scope.id()),
            depth: scope.depth(),
            description: step.description.render(scope),
            watch,
        });
    }
}
