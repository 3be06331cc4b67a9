//! Core domain models for stepline
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, scopes and their configuration.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod scope;
pub mod step;

pub use config::{ExecutionMode, RuntimeConfig};
pub use error::{ChainError, StepError};
pub use pipeline::*;
pub use scope::*;
pub use step::*;
