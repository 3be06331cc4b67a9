//! Shared external resources
//!
//! [`ResourceCache`] hands out lazily created values with single-flight
//! creation; [`ConnectionLadder`] climbs a tree of dependent levels through
//! it and retries the whole climb whenever a level fails or closes.

pub mod cache;
pub mod ladder;

pub use cache::{Acquired, Awaiter, Deleter, ResourceCache, Setter, SlotState};
pub use ladder::{
    action_fn, AsAny, ConnectionLadder, CreateAction, Declared, LadderConfig, Level, Lifecycle,
    LifecycleListener, ListenerGuard, Listeners, Resource, Rungs, SharedResource,
};

use std::fmt::Display;
use thiserror::Error;

/// Errors raised while acquiring a resource
///
/// `Clone` so a single creation outcome can reach every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("resource creation failed: {0}")]
    Failed(String),

    #[error("creation of {key} was abandoned before settling")]
    Abandoned { key: String },

    #[error("resource closed: {0}")]
    Closed(String),

    #[error("invalid ladder: {0}")]
    InvalidLadder(String),

    /// Configuration no retry can fix
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resource owner was dropped")]
    Dropped,
}

impl ResourceError {
    pub fn failed(reason: impl Display) -> Self {
        ResourceError::Failed(reason.to_string())
    }
}
