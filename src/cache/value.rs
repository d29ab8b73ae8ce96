//! Values held by the entity store and the patches applied over them.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::domain::entities::{MemoRecord, ProfileRecord, TaskRecord};

/// Cached result for one query key. The variant follows the key kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CacheValue {
    Tasks(Vec<TaskRecord>),
    Task(TaskRecord),
    Memos(Vec<MemoRecord>),
    Profile(Option<ProfileRecord>),
}

impl CacheValue {
    pub fn as_tasks(&self) -> Option<&[TaskRecord]> {
        match self {
            Self::Tasks(tasks) => Some(tasks),
            _ => None,
        }
    }

    pub fn as_memos(&self) -> Option<&[MemoRecord]> {
        match self {
            Self::Memos(memos) => Some(memos),
            _ => None,
        }
    }

    pub fn contains_memo(&self, id: Uuid) -> bool {
        self.as_memos()
            .is_some_and(|memos| memos.iter().any(|memo| memo.id == id))
    }
}

/// Pure transformation of a cached value.
///
/// Patches must be idempotent: applying one twice equals applying it once.
/// Mutation layers are re-applied whenever the confirmed value underneath
/// them changes.
#[derive(Clone)]
pub struct Patch(Arc<dyn Fn(Option<&CacheValue>) -> Option<CacheValue> + Send + Sync>);

impl Patch {
    pub fn new(f: impl Fn(Option<&CacheValue>) -> Option<CacheValue> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Replace whatever is cached with `value`.
    pub fn replace(value: CacheValue) -> Self {
        Self::new(move |_| Some(value.clone()))
    }

    pub fn apply(&self, current: Option<&CacheValue>) -> Option<CacheValue> {
        (self.0)(current)
    }
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Patch(..)")
    }
}
