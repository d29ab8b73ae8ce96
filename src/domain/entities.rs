//! Domain entities mirrored from the remote row store.
//!
//! Rows arrive loosely typed (`daybook_api_types`); converting them into the
//! records below is the validating decode step at the gateway boundary.

use daybook_api_types::{
    MemoChanges, MemoRow, NewMemoRow, NewTaskRow, ProfileChanges, ProfileRow, TaskChanges, TaskRow,
    serde_time,
};
use serde::Serialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::error::DomainError;
use super::types::TaskCategory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "serde_time::rfc3339")]
    pub created_at: OffsetDateTime,
    pub title: String,
    pub is_completed: bool,
    #[serde(with = "serde_time::iso_date_option")]
    pub due_date: Option<Date>,
    pub description: Option<String>,
    pub category: Option<TaskCategory>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let category = row
            .category
            .as_deref()
            .map(|value| {
                value.parse::<TaskCategory>().map_err(|_| DomainError::UnknownCategory {
                    task: row.id,
                    value: value.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            created_at: row.created_at,
            title: row.title,
            is_completed: row.is_completed,
            due_date: row.due_date,
            description: row.description,
            category,
        })
    }
}

impl TaskRecord {
    /// Client-side stand-in for a task the server has not confirmed yet.
    pub fn provisional(user_id: Uuid, draft: &NewTask, created_at: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            created_at,
            title: draft.title.clone(),
            is_completed: false,
            due_date: None,
            description: None,
            category: Some(draft.category),
        }
    }

    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(title) = patch.title.as_ref() {
            self.title = title.clone();
        }
        if let Some(description) = patch.description.as_ref() {
            self.description = description.clone();
        }
        if let Some(category) = patch.category {
            self.category = Some(category);
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(is_completed) = patch.is_completed {
            self.is_completed = is_completed;
        }
    }
}

/// A validated request to create a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub category: TaskCategory,
}

impl NewTask {
    pub fn new(title: &str, category: Option<TaskCategory>) -> Result<Self, DomainError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(DomainError::blank("task", "title"));
        }
        Ok(Self {
            title: title.to_string(),
            category: category.unwrap_or_default(),
        })
    }

    pub fn to_row(&self, user_id: Uuid) -> NewTaskRow {
        NewTaskRow {
            user_id,
            title: self.title.clone(),
            category: self.category.as_str().to_string(),
        }
    }
}

/// Field-level change set for a task; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<TaskCategory>,
    pub due_date: Option<Option<Date>>,
    pub is_completed: Option<bool>,
}

impl TaskPatch {
    pub fn completion(is_completed: bool) -> Self {
        Self {
            is_completed: Some(is_completed),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn validate(self) -> Result<Self, DomainError> {
        if let Some(title) = self.title.as_ref() {
            let trimmed = title.trim();
            if trimmed.is_empty() {
                return Err(DomainError::blank("task", "title"));
            }
        }
        if self.to_changes().is_empty() {
            return Err(DomainError::no_changes("task"));
        }
        Ok(Self {
            title: self.title.map(|title| title.trim().to_string()),
            ..self
        })
    }

    pub fn to_changes(&self) -> TaskChanges {
        TaskChanges {
            title: self.title.clone(),
            description: self.description.clone(),
            category: self.category.map(|category| category.as_str().to_string()),
            due_date: self.due_date,
            is_completed: self.is_completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub is_pinned: bool,
    #[serde(with = "serde_time::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_time::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<MemoRow> for MemoRecord {
    fn from(row: MemoRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            content: row.content,
            is_pinned: row.is_pinned,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl MemoRecord {
    pub fn provisional(user_id: Uuid, content: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            content: content.to_string(),
            is_pinned: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, changes: &MemoChanges) {
        if let Some(content) = changes.content.as_ref() {
            self.content = content.clone();
        }
        if let Some(is_pinned) = changes.is_pinned {
            self.is_pinned = is_pinned;
        }
    }
}

pub fn new_memo_row(user_id: Uuid, content: &str) -> Result<NewMemoRow, DomainError> {
    if content.trim().is_empty() {
        return Err(DomainError::blank("memo", "content"));
    }
    Ok(NewMemoRow {
        user_id,
        content: content.to_string(),
        is_pinned: false,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileRecord {
    pub id: Uuid,
    #[serde(with = "serde_time::rfc3339_option")]
    pub updated_at: Option<OffsetDateTime>,
    pub display_name: Option<String>,
    pub profile_picture_url: Option<String>,
    pub theme_color: Option<String>,
    pub language: Option<String>,
}

impl From<ProfileRow> for ProfileRecord {
    fn from(row: ProfileRow) -> Self {
        Self {
            id: row.id,
            updated_at: row.updated_at,
            display_name: row.display_name,
            profile_picture_url: row.profile_picture_url,
            theme_color: row.theme_color,
            language: row.language,
        }
    }
}

impl ProfileRecord {
    pub fn apply(&mut self, changes: &ProfileChanges) {
        if let Some(display_name) = changes.display_name.as_ref() {
            self.display_name = display_name.clone();
        }
        if let Some(picture) = changes.profile_picture_url.as_ref() {
            self.profile_picture_url = picture.clone();
        }
        if let Some(theme_color) = changes.theme_color.as_ref() {
            self.theme_color = theme_color.clone();
        }
        if let Some(language) = changes.language.as_ref() {
            self.language = language.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn row(category: Option<&str>) -> TaskRow {
        TaskRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            created_at: datetime!(2026-10-19 09:00 UTC),
            title: "Write report".to_string(),
            is_completed: false,
            due_date: None,
            description: None,
            category: category.map(str::to_string),
        }
    }

    #[test]
    fn unknown_category_is_rejected() {
        let errands = row(Some("errands"));
        let id = errands.id;
        let err = TaskRecord::try_from(errands).unwrap_err();
        assert_eq!(
            err,
            DomainError::UnknownCategory {
                task: id,
                value: "errands".to_string(),
            }
        );

        let ok = TaskRecord::try_from(row(Some("work"))).unwrap();
        assert_eq!(ok.category, Some(TaskCategory::Work));

        let none = TaskRecord::try_from(row(None)).unwrap();
        assert_eq!(none.category, None);
    }

    #[test]
    fn new_task_trims_and_rejects_blank_titles() {
        let task = NewTask::new("  Buy milk  ", None).unwrap();
        assert_eq!(task.title, "Buy milk");
        assert_eq!(task.category, TaskCategory::Personal);

        assert!(NewTask::new("   ", None).is_err());
    }

    #[test]
    fn patch_only_touches_named_fields() {
        let mut task = TaskRecord::try_from(row(Some("personal"))).unwrap();
        task.description = Some("keep".to_string());

        task.apply(&TaskPatch::completion(true));
        assert!(task.is_completed);
        assert_eq!(task.title, "Write report");
        assert_eq!(task.description.as_deref(), Some("keep"));

        task.apply(&TaskPatch {
            description: Some(None),
            ..Default::default()
        });
        assert_eq!(task.description, None);
    }

    #[test]
    fn empty_patch_fails_validation() {
        assert!(TaskPatch::default().validate().is_err());
        assert!(TaskPatch::title("   ").validate().is_err());
        assert_eq!(
            TaskPatch::title(" Tidy ").validate().unwrap().title.as_deref(),
            Some("Tidy")
        );
    }

    #[test]
    fn memo_row_rejects_blank_content() {
        assert!(new_memo_row(Uuid::new_v4(), "  ").is_err());
        assert!(new_memo_row(Uuid::new_v4(), "idea").is_ok());
    }
}
