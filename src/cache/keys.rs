//! Cache key definitions.
//!
//! `QueryKey` identifies one cached result set; `KeyPattern` selects a group of
//! keys for invalidation.

use std::fmt;

use chrono_tz::Tz;
use daybook_api_types::serde_time::format_iso_date;
use serde_json::{Value, json};
use time::{Date, Month};
use uuid::Uuid;

use crate::domain::entities::TaskRecord;
use crate::util::timezone::localized_date;

/// Day-bucket or month-bucket of the task list, keyed on `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskScope {
    Day(Date),
    Month { year: i32, month: Month },
}

impl TaskScope {
    pub fn month_of(date: Date) -> Self {
        Self::Month {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Whether `task` belongs in this bucket when days are read in `tz`.
    pub fn contains(&self, task: &TaskRecord, tz: Tz) -> bool {
        let day = localized_date(task.created_at, tz);
        match *self {
            Self::Day(date) => day == date,
            Self::Month { year, month } => day.year() == year && day.month() == month,
        }
    }

    fn canonical(&self) -> Value {
        match *self {
            Self::Day(date) => json!({ "date": format_iso_date(date) }),
            Self::Month { year, month } => {
                json!({ "month": format!("{year:04}-{:02}", u8::from(month)) })
            }
        }
    }
}

/// Identifies a cached read result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Tasks created within a day or month.
    Tasks(TaskScope),
    /// A single task detail.
    Task(Uuid),
    /// Every task not yet completed, across days.
    UncompletedTasks,
    /// All memos of the signed-in user.
    Memos,
    /// The profile row of a user.
    Profile(Uuid),
}

impl QueryKey {
    pub fn tasks_on(date: Date) -> Self {
        Self::Tasks(TaskScope::Day(date))
    }

    pub fn tasks_in_month(year: i32, month: Month) -> Self {
        Self::Tasks(TaskScope::Month { year, month })
    }

    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tasks(TaskScope::Day(_)) => "tasks_day",
            Self::Tasks(TaskScope::Month { .. }) => "tasks_month",
            Self::Task(_) => "task",
            Self::UncompletedTasks => "uncompleted_tasks",
            Self::Memos => "memos",
            Self::Profile(_) => "profile",
        }
    }

    /// Keys that hold a list of tasks.
    pub fn is_task_collection(&self) -> bool {
        matches!(self, Self::Tasks(_) | Self::UncompletedTasks)
    }

    /// Structural form used for equality across processes and for logs.
    pub fn canonical_value(&self) -> Value {
        match self {
            Self::Tasks(scope) => json!(["tasks", scope.canonical()]),
            Self::Task(id) => json!(["tasks", id.to_string()]),
            Self::UncompletedTasks => json!(["uncompletedTasks"]),
            Self::Memos => json!(["memos"]),
            Self::Profile(user_id) => json!(["profile", user_id.to_string()]),
        }
    }

    pub fn canonical(&self) -> String {
        self.canonical_value().to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Selects the keys affected by an invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    Exact(QueryKey),
    /// Every day, month and uncompleted task list.
    TaskCollections,
    /// Every task list whose bucket covers `date`.
    TaskBucketsOf(Date),
}

impl KeyPattern {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(expected) => expected == key,
            Self::TaskCollections => key.is_task_collection(),
            Self::TaskBucketsOf(date) => match key {
                QueryKey::Tasks(TaskScope::Day(day)) => day == date,
                QueryKey::Tasks(TaskScope::Month { year, month }) => {
                    *year == date.year() && *month == date.month()
                }
                _ => false,
            },
        }
    }
}

impl From<QueryKey> for KeyPattern {
    fn from(key: QueryKey) -> Self {
        Self::Exact(key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use time::macros::{date, datetime};

    use super::*;

    #[test]
    fn canonical_forms_mirror_tuple_keys() {
        assert_eq!(
            QueryKey::tasks_on(date!(2026 - 10 - 19)).canonical(),
            r#"["tasks",{"date":"2026-10-19"}]"#
        );
        assert_eq!(
            QueryKey::tasks_in_month(2026, Month::March).canonical(),
            r#"["tasks",{"month":"2026-03"}]"#
        );
        assert_eq!(QueryKey::Memos.canonical(), r#"["memos"]"#);
        assert_eq!(
            QueryKey::Profile(Uuid::nil()).canonical(),
            r#"["profile","00000000-0000-0000-0000-000000000000"]"#
        );
    }

    #[test]
    fn equality_agrees_with_canonical_form() {
        let keys = [
            QueryKey::tasks_on(date!(2026 - 10 - 19)),
            QueryKey::tasks_on(date!(2026 - 10 - 20)),
            QueryKey::tasks_in_month(2026, Month::October),
            QueryKey::Task(Uuid::nil()),
            QueryKey::UncompletedTasks,
            QueryKey::Memos,
            QueryKey::Profile(Uuid::nil()),
        ];

        for a in &keys {
            for b in &keys {
                assert_eq!(a == b, a.canonical() == b.canonical(), "{a} vs {b}");
            }
        }

        let seen: HashSet<QueryKey> = keys.iter().cloned().collect();
        assert!(seen.contains(&QueryKey::tasks_on(date!(2026 - 10 - 19))));
        assert_eq!(seen.len(), keys.len());
    }

    #[test]
    fn patterns_select_expected_keys() {
        let day = QueryKey::tasks_on(date!(2026 - 10 - 19));
        let other_day = QueryKey::tasks_on(date!(2026 - 10 - 18));
        let month = QueryKey::tasks_in_month(2026, Month::October);
        let detail = QueryKey::Task(Uuid::nil());

        assert!(KeyPattern::TaskCollections.matches(&day));
        assert!(KeyPattern::TaskCollections.matches(&QueryKey::UncompletedTasks));
        assert!(!KeyPattern::TaskCollections.matches(&detail));
        assert!(!KeyPattern::TaskCollections.matches(&QueryKey::Memos));

        let buckets = KeyPattern::TaskBucketsOf(date!(2026 - 10 - 19));
        assert!(buckets.matches(&day));
        assert!(buckets.matches(&month));
        assert!(!buckets.matches(&other_day));
        assert!(!buckets.matches(&QueryKey::UncompletedTasks));
    }

    #[test]
    fn scope_membership_uses_local_day() {
        let task = TaskRecord {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            created_at: datetime!(2026-10-19 23:30 UTC),
            title: "late".to_string(),
            is_completed: false,
            due_date: None,
            description: None,
            category: None,
        };

        assert!(TaskScope::Day(date!(2026 - 10 - 19)).contains(&task, Tz::UTC));
        assert!(TaskScope::Day(date!(2026 - 10 - 20)).contains(&task, chrono_tz::Asia::Tokyo));
        assert!(TaskScope::month_of(date!(2026 - 10 - 01)).contains(&task, Tz::UTC));
    }
}
