use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::gateway::RemoteError, config::LoadError, domain::error::DomainError,
    infra::error::InfraError,
};

/// Error chain captured for logging, outermost message first.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to load configuration")]
    Config(#[from] LoadError),
    #[error("no credential is installed")]
    Unauthenticated,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// The remote failure behind this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            AppError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the caller should be sent back to sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            AppError::Unauthenticated | AppError::Remote(RemoteError::Unauthorized { .. })
        )
    }

    /// Text shown to the person who triggered the failing action.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Remote(RemoteError::Invalid { message }) => message.clone(),
            AppError::Remote(RemoteError::Unauthorized { .. }) | AppError::Unauthenticated => {
                "You are not signed in".to_string()
            }
            AppError::Remote(RemoteError::NotFound { .. }) => {
                "The item no longer exists".to_string()
            }
            AppError::Remote(RemoteError::Conflict { .. }) => {
                "The item was changed elsewhere; reload and try again".to_string()
            }
            AppError::Remote(RemoteError::Unavailable { .. }) => {
                "The server could not be reached; try again".to_string()
            }
            AppError::Domain(err) => err.to_string(),
            AppError::Validation(message) => message.clone(),
            AppError::Infra(InfraError::Configuration { .. }) | AppError::Config(_) => {
                "Daybook is misconfigured".to_string()
            }
            AppError::Infra(_) | AppError::Unexpected(_) => "Unexpected error occurred".to_string(),
        }
    }
}
