//! Pipeline execution engine
//!
//! Steps advance their pipeline by calling a [`Next`] continuation; the
//! dispatcher picks the following step or catch and the runtime traces it.

pub mod continuation;
pub mod dispatcher;
pub mod runtime;
pub mod tracer;

pub use continuation::{Entry, Input, Next, Outcome, Terminal};
pub use runtime::{ChainRuntime, ScopeIds, WatchFn};
pub use tracer::{ConsoleTracer, Relation, StepTrace, Tracer, TracingTracer};
