use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("{entity} {field} must not be empty")]
    Blank {
        entity: &'static str,
        field: &'static str,
    },
    #[error("{entity} update carries no changes")]
    NoChanges { entity: &'static str },
    #[error("task {task} has unknown category `{value}`")]
    UnknownCategory { task: Uuid, value: String },
}

impl DomainError {
    pub fn blank(entity: &'static str, field: &'static str) -> Self {
        Self::Blank { entity, field }
    }

    pub fn no_changes(entity: &'static str) -> Self {
        Self::NoChanges { entity }
    }
}
