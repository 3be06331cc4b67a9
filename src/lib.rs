//! stepline - step/catch pipelines over single-flight connection ladders

pub mod broker;
pub mod cli;
pub mod core;
pub mod execution;
pub mod jobs;
pub mod persistence;
pub mod registry;
pub mod resource;

// Re-export commonly used types
pub use core::{ChainError, ExecutionMode, Fragment, RuntimeConfig, Scope, StepError};
pub use execution::{ChainRuntime, Entry, Input, Next, Outcome};
pub use resource::{ConnectionLadder, ResourceCache, ResourceError};
