//! Write side: every mutation the application can dispatch.
//!
//! A mutation is validated into a [`PreparedMutation`] before anything is
//! touched. The prepared form knows which cached keys it affects, the
//! optimistic patch for each of them, the remote operations to run and how
//! to turn the server's answer into authoritative patches.

use std::collections::HashSet;

use chrono_tz::Tz;
use daybook_api_types::{MemoChanges, MemoRow, NewTaskRow, ProfileChanges, ProfileRow, TaskRow};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CacheValue, InvalidationEvent, KeyPattern, Patch, QueryKey};
use crate::domain::entities::{
    MemoRecord, NewTask, ProfileRecord, TaskPatch, TaskRecord, new_memo_row,
};
use crate::domain::types::TaskCategory;
use crate::util::timezone::localized_date;

use super::auth::Credential;
use super::error::AppError;
use super::gateway::{
    Collection, Filter, Operation, RemoteError, Row, decode_rows, decode_single,
};
use super::queries::task_record;

/// A user action that changes server state.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    CreateTask {
        title: String,
        category: Option<TaskCategory>,
    },
    UpdateTask {
        id: Uuid,
        patch: TaskPatch,
    },
    ToggleTask {
        id: Uuid,
        is_completed: bool,
    },
    RenameTask {
        id: Uuid,
        title: String,
    },
    DeleteTask {
        id: Uuid,
    },
    CreateMemo {
        content: String,
    },
    UpdateMemo {
        id: Uuid,
        content: String,
    },
    ToggleMemoPin {
        id: Uuid,
        pinned: bool,
    },
    DeleteMemo {
        id: Uuid,
    },
    DeleteMemos {
        ids: Vec<Uuid>,
    },
    UpdateProfile {
        changes: ProfileChanges,
    },
}

impl MutationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTask { .. } => "create_task",
            Self::UpdateTask { .. } => "update_task",
            Self::ToggleTask { .. } => "toggle_task",
            Self::RenameTask { .. } => "rename_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::CreateMemo { .. } => "create_memo",
            Self::UpdateMemo { .. } => "update_memo",
            Self::ToggleMemoPin { .. } => "toggle_memo_pin",
            Self::DeleteMemo { .. } => "delete_memo",
            Self::DeleteMemos { .. } => "delete_memos",
            Self::UpdateProfile { .. } => "update_profile",
        }
    }

    /// Validate the mutation for `credential` and compute its effects.
    pub(crate) fn prepare(
        self,
        credential: &Credential,
        now: OffsetDateTime,
        timezone: Tz,
    ) -> Result<PreparedMutation, AppError> {
        let name = self.name();
        let user_id = credential.user_id;

        let action = match self {
            Self::CreateTask { title, category } => {
                let draft = NewTask::new(&title, category)?;
                Action::CreateTask {
                    provisional: TaskRecord::provisional(user_id, &draft, now),
                    row: draft.to_row(user_id),
                    today: localized_date(now, timezone),
                }
            }
            Self::UpdateTask { id, patch } => Action::UpdateTask {
                id,
                patch: patch.validate()?,
                event: InvalidationEvent::TaskUpdated { id },
            },
            Self::ToggleTask { id, is_completed } => Action::UpdateTask {
                id,
                patch: TaskPatch::completion(is_completed),
                event: InvalidationEvent::TaskToggled { id },
            },
            Self::RenameTask { id, title } => Action::UpdateTask {
                id,
                patch: TaskPatch::title(title).validate()?,
                event: InvalidationEvent::TaskRenamed { id },
            },
            Self::DeleteTask { id } => Action::DeleteTask { id },
            Self::CreateMemo { content } => {
                let row = new_memo_row(user_id, &content)?;
                Action::CreateMemo {
                    provisional: MemoRecord::provisional(user_id, &content, now),
                    row: to_row(&row)?,
                }
            }
            Self::UpdateMemo { id, content } => {
                if content.trim().is_empty() {
                    return Err(AppError::validation("memo content must not be empty"));
                }
                Action::UpdateMemo {
                    id,
                    changes: MemoChanges {
                        content: Some(content),
                        is_pinned: None,
                    },
                    event: InvalidationEvent::MemoUpdated { id },
                }
            }
            Self::ToggleMemoPin { id, pinned } => Action::UpdateMemo {
                id,
                changes: MemoChanges {
                    content: None,
                    is_pinned: Some(pinned),
                },
                event: InvalidationEvent::MemoPinToggled { id },
            },
            Self::DeleteMemo { id } => Action::DeleteMemos { ids: vec![id] },
            Self::DeleteMemos { ids } => {
                let mut seen = HashSet::new();
                let ids: Vec<Uuid> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
                if ids.is_empty() {
                    return Err(AppError::validation("no memos selected"));
                }
                Action::DeleteMemos { ids }
            }
            Self::UpdateProfile { changes } => {
                if changes.is_empty() {
                    return Err(AppError::validation("profile update carries no changes"));
                }
                Action::UpdateProfile { user_id, changes }
            }
        };

        let operations = action.operations()?;
        Ok(PreparedMutation {
            name,
            action,
            operations,
            timezone,
        })
    }
}

/// What the caller gets back once a mutation commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MutationOutput {
    Task(TaskRecord),
    Memo(MemoRecord),
    Profile(Option<ProfileRecord>),
    Deleted(Vec<Uuid>),
}

#[derive(Debug, Clone)]
enum Action {
    CreateTask {
        provisional: TaskRecord,
        row: NewTaskRow,
        today: time::Date,
    },
    UpdateTask {
        id: Uuid,
        patch: TaskPatch,
        event: InvalidationEvent,
    },
    DeleteTask {
        id: Uuid,
    },
    CreateMemo {
        provisional: MemoRecord,
        row: Row,
    },
    UpdateMemo {
        id: Uuid,
        changes: MemoChanges,
        event: InvalidationEvent,
    },
    DeleteMemos {
        ids: Vec<Uuid>,
    },
    UpdateProfile {
        user_id: Uuid,
        changes: ProfileChanges,
    },
}

impl Action {
    fn operations(&self) -> Result<Vec<Operation>, AppError> {
        let operation = match self {
            Action::CreateTask { row, .. } => Operation::Insert {
                collection: Collection::Tasks,
                row: to_row(row)?,
            },
            Action::UpdateTask { id, patch, .. } => Operation::Update {
                collection: Collection::Tasks,
                filter: by_id(*id),
                patch: to_row(&patch.to_changes())?,
            },
            Action::DeleteTask { id } => Operation::Delete {
                collection: Collection::Tasks,
                filter: by_id(*id),
            },
            Action::CreateMemo { row, .. } => Operation::Insert {
                collection: Collection::Memos,
                row: row.clone(),
            },
            Action::UpdateMemo { id, changes, .. } => Operation::Update {
                collection: Collection::Memos,
                filter: by_id(*id),
                patch: to_row(changes)?,
            },
            Action::DeleteMemos { ids } => {
                return Ok(ids
                    .iter()
                    .map(|id| Operation::Delete {
                        collection: Collection::Memos,
                        filter: by_id(*id),
                    })
                    .collect());
            }
            Action::UpdateProfile { user_id, changes } => Operation::Update {
                collection: Collection::Profiles,
                filter: by_id(*user_id),
                patch: to_row(changes)?,
            },
        };
        Ok(vec![operation])
    }
}

/// A validated mutation ready for dispatch.
#[derive(Debug, Clone)]
pub(crate) struct PreparedMutation {
    pub name: &'static str,
    action: Action,
    pub operations: Vec<Operation>,
    timezone: Tz,
}

/// The server's answer to a committed mutation.
pub(crate) struct Settlement {
    pub output: MutationOutput,
    pub authoritative: Option<Authoritative>,
    pub event: InvalidationEvent,
}

impl PreparedMutation {
    /// Patterns selecting the cached keys this mutation overlays.
    pub fn patterns(&self) -> Vec<KeyPattern> {
        match &self.action {
            Action::CreateTask { today, .. } => vec![
                KeyPattern::TaskBucketsOf(*today),
                KeyPattern::Exact(QueryKey::UncompletedTasks),
            ],
            Action::UpdateTask { id, .. } => vec![
                KeyPattern::TaskCollections,
                KeyPattern::Exact(QueryKey::Task(*id)),
            ],
            Action::DeleteTask { .. } => vec![KeyPattern::TaskCollections],
            Action::CreateMemo { .. } | Action::UpdateMemo { .. } | Action::DeleteMemos { .. } => {
                vec![KeyPattern::Exact(QueryKey::Memos)]
            }
            Action::UpdateProfile { user_id, .. } => {
                vec![KeyPattern::Exact(QueryKey::Profile(*user_id))]
            }
        }
    }

    /// Optimistic patch for one target key.
    pub fn optimistic_patch(&self, key: &QueryKey) -> Option<Patch> {
        match &self.action {
            Action::CreateTask { provisional, .. } => {
                place_task(key, provisional.clone(), None, self.timezone)
            }
            Action::UpdateTask { id, patch, .. } => Some(map_task(*id, patch.clone())),
            Action::DeleteTask { id } => Some(remove_tasks(vec![*id])),
            Action::CreateMemo { provisional, .. } => place_memo(key, provisional.clone(), None),
            Action::UpdateMemo { id, changes, .. } => Some(map_memo(*id, changes.clone())),
            Action::DeleteMemos { ids } => Some(remove_memos(ids.clone())),
            Action::UpdateProfile { changes, .. } => Some(map_profile(changes.clone())),
        }
    }

    /// Interpret the responses of `operations`, in the same order.
    pub fn settle(&self, mut responses: Vec<Vec<Row>>) -> Result<Settlement, RemoteError> {
        let first = if responses.is_empty() {
            Vec::new()
        } else {
            responses.swap_remove(0)
        };

        match &self.action {
            Action::CreateTask { provisional, .. } => {
                let task = task_record(decode_single::<TaskRow>(first, Collection::Tasks)?)?;
                Ok(Settlement {
                    event: InvalidationEvent::TaskCreated {
                        day: localized_date(task.created_at, self.timezone),
                    },
                    output: MutationOutput::Task(task.clone()),
                    authoritative: Some(Authoritative::Task {
                        replaces: Some(provisional.id),
                        task,
                    }),
                })
            }
            Action::UpdateTask { event, .. } => {
                let task = task_record(decode_single::<TaskRow>(first, Collection::Tasks)?)?;
                Ok(Settlement {
                    event: event.clone(),
                    output: MutationOutput::Task(task.clone()),
                    authoritative: Some(Authoritative::Task {
                        replaces: None,
                        task,
                    }),
                })
            }
            Action::DeleteTask { id } => Ok(Settlement {
                event: InvalidationEvent::TaskDeleted { id: *id },
                output: MutationOutput::Deleted(vec![*id]),
                authoritative: None,
            }),
            Action::CreateMemo { provisional, .. } => {
                let memo = MemoRecord::from(decode_single::<MemoRow>(first, Collection::Memos)?);
                Ok(Settlement {
                    event: InvalidationEvent::MemoCreated,
                    output: MutationOutput::Memo(memo.clone()),
                    authoritative: Some(Authoritative::Memo {
                        replaces: Some(provisional.id),
                        memo,
                    }),
                })
            }
            Action::UpdateMemo { event, .. } => {
                let memo = MemoRecord::from(decode_single::<MemoRow>(first, Collection::Memos)?);
                Ok(Settlement {
                    event: event.clone(),
                    output: MutationOutput::Memo(memo.clone()),
                    authoritative: Some(Authoritative::Memo {
                        replaces: None,
                        memo,
                    }),
                })
            }
            Action::DeleteMemos { ids } => Ok(Settlement {
                event: InvalidationEvent::MemosDeleted { ids: ids.clone() },
                output: MutationOutput::Deleted(ids.clone()),
                authoritative: None,
            }),
            Action::UpdateProfile { user_id, .. } => {
                let profile = decode_rows::<ProfileRow>(first)?
                    .into_iter()
                    .next()
                    .map(ProfileRecord::from);
                Ok(Settlement {
                    event: InvalidationEvent::ProfileUpdated { user_id: *user_id },
                    output: MutationOutput::Profile(profile.clone()),
                    authoritative: profile.map(Authoritative::Profile),
                })
            }
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

/// Server-confirmed record that supersedes an optimistic layer.
#[derive(Debug, Clone)]
pub(crate) enum Authoritative {
    Task {
        replaces: Option<Uuid>,
        task: TaskRecord,
    },
    Memo {
        replaces: Option<Uuid>,
        memo: MemoRecord,
    },
    Profile(ProfileRecord),
}

impl Authoritative {
    pub fn patch_for(&self, key: &QueryKey, timezone: Tz) -> Option<Patch> {
        match self {
            Authoritative::Task { replaces, task } => {
                place_task(key, task.clone(), *replaces, timezone)
            }
            Authoritative::Memo { replaces, memo } => place_memo(key, memo.clone(), *replaces),
            Authoritative::Profile(profile) => match key {
                QueryKey::Profile(user_id) if *user_id == profile.id => {
                    Some(Patch::replace(CacheValue::Profile(Some(profile.clone()))))
                }
                _ => None,
            },
        }
    }
}

fn by_id(id: Uuid) -> Filter {
    Filter::new().eq("id", id.to_string())
}

fn to_row<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode row: {err}")))
}

/// Put `task` where it belongs in a cached task value, dropping `replaces`.
fn place_task(key: &QueryKey, task: TaskRecord, replaces: Option<Uuid>, timezone: Tz) -> Option<Patch> {
    let belongs = match key {
        QueryKey::Tasks(scope) => scope.contains(&task, timezone),
        QueryKey::UncompletedTasks => !task.is_completed,
        QueryKey::Task(id) if *id == task.id => {
            return Some(Patch::replace(CacheValue::Task(task)));
        }
        _ => return None,
    };

    Some(Patch::new(move |current| match current? {
        CacheValue::Tasks(tasks) => {
            let mut tasks: Vec<TaskRecord> = tasks
                .iter()
                .filter(|existing| existing.id != task.id && Some(existing.id) != replaces)
                .cloned()
                .collect();
            if belongs {
                let at = tasks
                    .iter()
                    .position(|existing| existing.created_at < task.created_at)
                    .unwrap_or(tasks.len());
                tasks.insert(at, task.clone());
            }
            Some(CacheValue::Tasks(tasks))
        }
        other => Some(other.clone()),
    }))
}

fn map_task(id: Uuid, patch: TaskPatch) -> Patch {
    Patch::new(move |current| match current? {
        CacheValue::Tasks(tasks) => Some(CacheValue::Tasks(
            tasks
                .iter()
                .cloned()
                .map(|mut task| {
                    if task.id == id {
                        task.apply(&patch);
                    }
                    task
                })
                .collect(),
        )),
        CacheValue::Task(task) if task.id == id => {
            let mut task = task.clone();
            task.apply(&patch);
            Some(CacheValue::Task(task))
        }
        other => Some(other.clone()),
    })
}

fn remove_tasks(ids: Vec<Uuid>) -> Patch {
    Patch::new(move |current| match current? {
        CacheValue::Tasks(tasks) => Some(CacheValue::Tasks(
            tasks
                .iter()
                .filter(|task| !ids.contains(&task.id))
                .cloned()
                .collect(),
        )),
        other => Some(other.clone()),
    })
}

fn place_memo(key: &QueryKey, memo: MemoRecord, replaces: Option<Uuid>) -> Option<Patch> {
    if *key != QueryKey::Memos {
        return None;
    }
    Some(Patch::new(move |current| match current? {
        CacheValue::Memos(memos) => {
            let mut memos: Vec<MemoRecord> = memos
                .iter()
                .filter(|existing| existing.id != memo.id && Some(existing.id) != replaces)
                .cloned()
                .collect();
            let at = memos
                .iter()
                .position(|existing| existing.created_at < memo.created_at)
                .unwrap_or(memos.len());
            memos.insert(at, memo.clone());
            Some(CacheValue::Memos(memos))
        }
        other => Some(other.clone()),
    }))
}

fn map_memo(id: Uuid, changes: MemoChanges) -> Patch {
    Patch::new(move |current| match current? {
        CacheValue::Memos(memos) => Some(CacheValue::Memos(
            memos
                .iter()
                .cloned()
                .map(|mut memo| {
                    if memo.id == id {
                        memo.apply(&changes);
                    }
                    memo
                })
                .collect(),
        )),
        other => Some(other.clone()),
    })
}

fn remove_memos(ids: Vec<Uuid>) -> Patch {
    Patch::new(move |current| match current? {
        CacheValue::Memos(memos) => Some(CacheValue::Memos(
            memos
                .iter()
                .filter(|memo| !ids.contains(&memo.id))
                .cloned()
                .collect(),
        )),
        other => Some(other.clone()),
    })
}

fn map_profile(changes: ProfileChanges) -> Patch {
    Patch::new(move |current| match current? {
        CacheValue::Profile(Some(profile)) => {
            let mut profile = profile.clone();
            profile.apply(&changes);
            Some(CacheValue::Profile(Some(profile)))
        }
        other => Some(other.clone()),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::{date, datetime};

    use super::*;

    fn credential() -> Credential {
        Credential::new(Uuid::from_u128(7), "token")
    }

    fn task(id: u128, created_at: OffsetDateTime) -> TaskRecord {
        TaskRecord {
            id: Uuid::from_u128(id),
            user_id: Uuid::from_u128(7),
            created_at,
            title: format!("task {id}"),
            is_completed: false,
            due_date: None,
            description: None,
            category: Some(TaskCategory::Personal),
        }
    }

    #[test]
    fn blank_titles_are_rejected_before_dispatch() {
        let result = MutationKind::CreateTask {
            title: "   ".to_string(),
            category: None,
        }
        .prepare(&credential(), datetime!(2026-10-19 09:00 UTC), Tz::UTC);
        assert!(matches!(result, Err(AppError::Domain(_))));

        let result = MutationKind::DeleteMemos { ids: Vec::new() }.prepare(
            &credential(),
            datetime!(2026-10-19 09:00 UTC),
            Tz::UTC,
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn create_task_targets_today_and_uncompleted() {
        let prepared = MutationKind::CreateTask {
            title: " Buy milk ".to_string(),
            category: None,
        }
        .prepare(&credential(), datetime!(2026-10-19 09:00 UTC), Tz::UTC)
        .expect("valid mutation");

        let patterns = prepared.patterns();
        assert!(patterns.iter().any(|p| p.matches(&QueryKey::tasks_on(date!(2026 - 10 - 19)))));
        assert!(patterns.iter().any(|p| p.matches(&QueryKey::UncompletedTasks)));
        assert!(!patterns.iter().any(|p| p.matches(&QueryKey::tasks_on(date!(2026 - 10 - 18)))));

        let Operation::Insert { row, .. } = &prepared.operations[0] else {
            panic!("expected insert");
        };
        assert_eq!(row["title"], json!("Buy milk"));
        assert_eq!(row["category"], json!("personal"));
    }

    #[test]
    fn placed_task_keeps_newest_first_and_replaces_provisional() {
        let older = task(1, datetime!(2026-10-19 08:00 UTC));
        let provisional = task(2, datetime!(2026-10-19 09:00 UTC));
        let confirmed = task(3, datetime!(2026-10-19 09:00:01 UTC));
        let key = QueryKey::tasks_on(date!(2026 - 10 - 19));

        let optimistic = place_task(&key, provisional.clone(), None, Tz::UTC).expect("patch");
        let value = optimistic
            .apply(Some(&CacheValue::Tasks(vec![older.clone()])))
            .expect("value");
        assert_eq!(value, CacheValue::Tasks(vec![provisional.clone(), older.clone()]));

        let settled = place_task(&key, confirmed.clone(), Some(provisional.id), Tz::UTC).expect("patch");
        let once = settled.apply(Some(&value));
        let twice = settled.apply(once.as_ref());
        assert_eq!(once, Some(CacheValue::Tasks(vec![confirmed, older])));
        assert_eq!(once, twice);
    }

    #[test]
    fn task_outside_bucket_is_removed_not_inserted() {
        let late = task(1, datetime!(2026-10-20 00:30 UTC));
        let key = QueryKey::tasks_on(date!(2026 - 10 - 19));
        let patch = place_task(&key, late.clone(), None, Tz::UTC).expect("patch");
        assert_eq!(
            patch.apply(Some(&CacheValue::Tasks(vec![late]))),
            Some(CacheValue::Tasks(Vec::new()))
        );
    }

    #[test]
    fn patches_leave_absent_values_absent() {
        let patch = map_task(Uuid::nil(), TaskPatch::completion(true));
        assert_eq!(patch.apply(None), None);
        assert_eq!(remove_memos(vec![Uuid::nil()]).apply(None), None);
    }

    #[test]
    fn batch_delete_issues_one_delete_per_distinct_id() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let prepared = MutationKind::DeleteMemos { ids: vec![a, b, a] }
            .prepare(&credential(), datetime!(2026-10-19 09:00 UTC), Tz::UTC)
            .expect("valid mutation");
        assert_eq!(prepared.operations.len(), 2);
        assert!(prepared.operations.iter().all(|op| op.verb() == "delete"));
    }

    #[test]
    fn empty_update_response_is_not_found() {
        let prepared = MutationKind::ToggleTask {
            id: Uuid::nil(),
            is_completed: true,
        }
        .prepare(&credential(), datetime!(2026-10-19 09:00 UTC), Tz::UTC)
        .expect("valid mutation");
        let result = prepared.settle(vec![Vec::new()]);
        assert!(matches!(result, Err(RemoteError::NotFound { .. })));
    }
}
