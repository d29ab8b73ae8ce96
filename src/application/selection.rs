//! Derived state for an open task detail view.
//!
//! Deleting a task does not push a "close" signal. The detail view checks
//! the list it was opened from after every update instead.

use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::domain::entities::TaskRecord;

/// True once the list is loaded and no longer contains `selected`.
///
/// An absent or not-yet-loaded list never closes the view.
pub fn should_close_detail(list: Option<&CacheEntry>, selected: Uuid) -> bool {
    list.and_then(|entry| entry.data.as_ref())
        .and_then(|value| value.as_tasks())
        .is_some_and(|tasks| !tasks.iter().any(|task| task.id == selected))
}

/// The selected task as currently shown by `list`.
pub fn selected_task(list: Option<&CacheEntry>, selected: Uuid) -> Option<TaskRecord> {
    list.and_then(|entry| entry.data.as_ref())
        .and_then(|value| value.as_tasks())
        .and_then(|tasks| tasks.iter().find(|task| task.id == selected).cloned())
}
