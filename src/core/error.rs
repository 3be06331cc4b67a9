//! Error types carried through pipelines

use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

use crate::resource::ResourceError;

/// Error carried by a scope from the step that raised it to the nearest catch
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Intentional, user-facing rejection (validation or business rule)
    #[error("{message}")]
    Rejected { message: String },

    /// Any other failure raised or propagated inside a step
    #[error("{message}")]
    Fault {
        message: String,
        #[source]
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },
}

impl StepError {
    /// Create a domain rejection
    pub fn reject(message: impl Into<String>) -> Self {
        StepError::Rejected {
            message: message.into(),
        }
    }

    /// Create a fault without an underlying cause
    pub fn fault(message: impl Into<String>) -> Self {
        StepError::Fault {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap any error as a fault, keeping it as the source
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StepError::Fault {
            message: error.to_string(),
            cause: Some(Arc::new(error)),
        }
    }

    /// Convert a panic payload caught around a step
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "step panicked".to_string()
        };
        StepError::fault(format!("panicked: {}", message))
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Rejected { message } | StepError::Fault { message, .. } => message,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, StepError::Rejected { .. })
    }

    /// Status a response layer would report for this error
    pub fn status_code(&self) -> u16 {
        if self.is_rejection() {
            400
        } else {
            500
        }
    }

    /// Prefix the message with the description of the step that failed
    pub fn annotate(&mut self, description: &str) {
        let message = match self {
            StepError::Rejected { message } | StepError::Fault { message, .. } => message,
        };
        *message = format!("couldn't {} : {}", description, message);
    }
}

impl From<ResourceError> for StepError {
    fn from(error: ResourceError) -> Self {
        StepError::from_error(error)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(error: serde_json::Error) -> Self {
        StepError::from_error(error)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(error: anyhow::Error) -> Self {
        let message = format!("{:#}", error);
        let boxed: Box<dyn std::error::Error + Send + Sync> = error.into();
        StepError::Fault {
            message,
            cause: Some(Arc::from(boxed)),
        }
    }
}

/// Errors raised by the chain machinery itself rather than by steps
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("pipeline stopped before reaching its terminal callback")]
    Abandoned,

    #[error("no handler registered as {0}")]
    UnknownHandler(String),

    #[error("no middleware registered as {0}")]
    UnknownMiddleware(String),

    #[error("no Method defined")]
    UndefinedMethod,
}

impl From<ChainError> for StepError {
    fn from(error: ChainError) -> Self {
        match error {
            ChainError::UndefinedMethod => StepError::reject(error.to_string()),
            other => StepError::from_error(other),
        }
    }
}
