//! Handler registry and method composition
//!
//! Handlers and io middleware are registered by name at startup. A [`Method`]
//! names a logical handler and a stack of middleware; binding it resolves the
//! names and folds the stack around the handler, innermost last.

use crate::core::error::ChainError;
use crate::core::scope::Fragment;
use crate::execution::{Entry, Input, Outcome};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A pipeline entry together with the options it was bound with
#[derive(Clone)]
pub struct Bound {
    entry: Entry,
    options: Fragment,
}

impl Bound {
    pub fn new(entry: Entry, options: Fragment) -> Self {
        Self { entry, options }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn options(&self) -> &Fragment {
        &self.options
    }

    /// Invoke the entry with the options ahead of the input's own fragments
    pub fn invoke(&self, input: impl Into<Input>) {
        self.entry.invoke(self.prepare(input.into()));
    }

    pub async fn run(&self, input: impl Into<Input>) -> Result<Outcome, ChainError> {
        self.entry.run(self.prepare(input.into())).await
    }

    fn prepare(&self, mut input: Input) -> Input {
        input.fragments.insert(0, self.options.clone());
        input
    }
}

impl fmt::Debug for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("entry", &self.entry)
            .field("options", &self.options.values().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Io middleware: wraps the handler beneath it, replaces it, or leaves it
pub trait Middleware: Send + Sync {
    /// Return `None` to keep `inner` unchanged
    fn wrap(&self, options: &Fragment, inner: Option<Bound>) -> Option<Bound>;
}

impl<F> Middleware for F
where
    F: Fn(&Fragment, Option<Bound>) -> Option<Bound> + Send + Sync,
{
    fn wrap(&self, options: &Fragment, inner: Option<Bound>) -> Option<Bound> {
        self(options, inner)
    }
}

/// Name → handler and name → middleware tables
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Entry>,
    middleware: HashMap<String, Arc<dyn Middleware>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, name: impl Into<String>, entry: Entry) -> &mut Self {
        self.handlers.insert(name.into(), entry);
        self
    }

    pub fn register_middleware(
        &mut self,
        name: impl Into<String>,
        middleware: Arc<dyn Middleware>,
    ) -> &mut Self {
        self.middleware.insert(name.into(), middleware);
        self
    }

    pub fn handler(&self, name: &str) -> Result<Entry, ChainError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::UnknownHandler(name.to_string()))
    }

    pub fn middleware(&self, name: &str) -> Result<Arc<dyn Middleware>, ChainError> {
        self.middleware
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::UnknownMiddleware(name.to_string()))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        let mut middleware: Vec<_> = self.middleware.keys().collect();
        handlers.sort();
        middleware.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &handlers)
            .field("middleware", &middleware)
            .finish()
    }
}

/// A logical handler with io middleware stacked around it
#[derive(Debug, Clone, Default)]
pub struct Method {
    io: Vec<(String, Fragment)>,
    logic: Option<(String, Fragment)>,
}

impl Method {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_logical_handler(mut self, name: impl Into<String>, options: Fragment) -> Self {
        self.logic = Some((name.into(), options));
        self
    }

    /// Push middleware; the first stacked ends up outermost
    pub fn stack_io_middleware(mut self, name: impl Into<String>, options: Fragment) -> Self {
        self.io.push((name.into(), options));
        self
    }

    /// Resolve names against `registry` and fold the stack around the handler
    ///
    /// `scope` is merged under each set of options. Fails with
    /// [`ChainError::UndefinedMethod`] when no handler is left after folding.
    pub fn bind(&self, registry: &HandlerRegistry, scope: &Fragment) -> Result<Bound, ChainError> {
        let with_scope = |options: &Fragment| Fragment::merged([scope, options]);

        let mut bound = match &self.logic {
            Some((name, options)) => Some(Bound::new(registry.handler(name)?, with_scope(options))),
            None => None,
        };

        for (name, options) in self.io.iter().rev() {
            let middleware = registry.middleware(name)?;
            if let Some(wrapped) = middleware.wrap(&with_scope(options), bound.clone()) {
                bound = Some(wrapped);
            }
        }

        bound.ok_or(ChainError::UndefinedMethod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExecutionMode;
    use crate::execution::ChainRuntime;
    use std::sync::Mutex;

    fn echo(name: &'static str, order: Arc<Mutex<Vec<String>>>) -> Entry {
        ChainRuntime::new(ExecutionMode::Production)
            .start(format!("run {}", name), move |scope, next, _| {
                order.lock().unwrap().push(name.to_string());
                next.call(Fragment::new().with("handledBy", name).with(
                    "salutation",
                    scope.get("salutation").cloned().unwrap_or_default(),
                ));
                Ok(())
            })
            .build()
    }

    /// Middleware that runs its own entry, then the handler beneath it
    fn logging(order: Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(move |options: &Fragment, inner: Option<Bound>| {
            let inner = inner?;
            let tag = options
                .get("tag")
                .and_then(|v| v.as_str())
                .unwrap_or("io")
                .to_string();
            let order = order.clone();
            let entry = ChainRuntime::new(ExecutionMode::Production)
                .start("log request", move |scope, next, _| {
                    order.lock().unwrap().push(tag.clone());
                    next.delegate(inner.entry(), Fragment::merged([inner.options(), &scope.fragment()]));
                    Ok(())
                })
                .build();
            Some(Bound::new(entry, options.clone()))
        })
    }

    #[tokio::test]
    async fn test_bind_folds_middleware_outermost_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .register_handler("greet", echo("greet", order.clone()))
            .register_middleware("log", logging(order.clone()));

        let method = Method::new()
            .stack_io_middleware("log", Fragment::new().with("tag", "outer"))
            .stack_io_middleware("log", Fragment::new().with("tag", "inner"))
            .set_logical_handler("greet", Fragment::new().with("salutation", "Hello"));

        let bound = method.bind(&registry, &Fragment::new()).unwrap();
        let outcome = bound.run(Input::new()).await.unwrap();

        assert!(outcome.is_ok());
        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "greet"]);
        assert_eq!(
            outcome.merged().get("salutation").and_then(|v| v.as_str()),
            Some("Hello")
        );
    }

    #[tokio::test]
    async fn test_middleware_returning_none_keeps_handler() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        let passthrough: Arc<dyn Middleware> =
            Arc::new(|_: &Fragment, _: Option<Bound>| -> Option<Bound> { None });
        registry
            .register_handler("greet", echo("greet", order.clone()))
            .register_middleware("http", passthrough);

        let bound = Method::new()
            .stack_io_middleware("http", Fragment::new())
            .set_logical_handler("greet", Fragment::new())
            .bind(&registry, &Fragment::new())
            .unwrap();
        let outcome = bound.run(Input::new()).await.unwrap();

        assert_eq!(
            outcome.merged().get("handledBy").and_then(|v| v.as_str()),
            Some("greet")
        );
    }

    #[test]
    fn test_unknown_names() {
        let registry = HandlerRegistry::new();

        let err = Method::new()
            .set_logical_handler("missing", Fragment::new())
            .bind(&registry, &Fragment::new())
            .unwrap_err();
        assert!(matches!(err, ChainError::UnknownHandler(name) if name == "missing"));

        let err = registry.middleware("mq").err().unwrap();
        assert!(matches!(err, ChainError::UnknownMiddleware(name) if name == "mq"));
    }

    #[test]
    fn test_method_without_handler_is_undefined() {
        let registry = HandlerRegistry::new();
        let err = Method::new().bind(&registry, &Fragment::new()).unwrap_err();
        assert!(matches!(err, ChainError::UndefinedMethod));
        assert_eq!(err.to_string(), "no Method defined");
    }
}
