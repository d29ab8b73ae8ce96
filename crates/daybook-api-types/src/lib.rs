//! Row shapes exchanged with the daybook remote row store.
//!
//! These types mirror the `tasks`, `memos` and `profiles` tables one to one.
//! They are deliberately loose (strings where the client has enums) so the
//! client can validate them at its own boundary.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

pub mod serde_time;

pub const TASKS_TABLE: &str = "tasks";
pub const MEMOS_TABLE: &str = "memos";
pub const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "serde_time::rfc3339")]
    pub created_at: OffsetDateTime,
    pub title: String,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default, with = "serde_time::iso_date_option")]
    pub due_date: Option<Date>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewTaskRow {
    pub user_id: Uuid,
    pub title: String,
    pub category: String,
}

/// Partial update for a task row. Absent fields are left untouched; an inner
/// `None` clears the column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_time::iso_date_double_option"
    )]
    pub due_date: Option<Option<Date>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
}

impl TaskChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.due_date.is_none()
            && self.is_completed.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(with = "serde_time::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_time::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewMemoRow {
    pub user_id: Uuid,
    pub content: String,
    pub is_pinned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
}

impl MemoChanges {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.is_pinned.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileRow {
    pub id: Uuid,
    #[serde(default, with = "serde_time::rfc3339_option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
    #[serde(default)]
    pub theme_color: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_color: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Option<String>>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.profile_picture_url.is_none()
            && self.theme_color.is_none()
            && self.language.is_none()
    }
}
