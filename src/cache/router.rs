//! Query invalidation routing.
//!
//! Maps settled mutations to the key patterns that must be refetched.

use std::collections::HashSet;
use std::fmt;

use time::Date;
use uuid::Uuid;

use super::keys::{KeyPattern, QueryKey};

/// What a committed mutation changed on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// A task was created; `day` is the local day of its `created_at`.
    TaskCreated { day: Date },
    TaskUpdated { id: Uuid },
    TaskRenamed { id: Uuid },
    TaskToggled { id: Uuid },
    TaskDeleted { id: Uuid },
    MemoCreated,
    MemoUpdated { id: Uuid },
    MemoPinToggled { id: Uuid },
    MemosDeleted { ids: Vec<Uuid> },
    ProfileUpdated { user_id: Uuid },
}

impl InvalidationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::TaskUpdated { .. } => "task_updated",
            Self::TaskRenamed { .. } => "task_renamed",
            Self::TaskToggled { .. } => "task_toggled",
            Self::TaskDeleted { .. } => "task_deleted",
            Self::MemoCreated => "memo_created",
            Self::MemoUpdated { .. } => "memo_updated",
            Self::MemoPinToggled { .. } => "memo_pin_toggled",
            Self::MemosDeleted { .. } => "memos_deleted",
            Self::ProfileUpdated { .. } => "profile_updated",
        }
    }
}

/// Key patterns to mark stale once a mutation commits.
#[derive(Debug, Default, Clone)]
pub struct InvalidationPlan {
    pub patterns: HashSet<KeyPattern>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidationPlan {{ patterns: {} }}", self.patterns.len())
    }
}

impl InvalidationPlan {
    pub fn for_event(event: &InvalidationEvent) -> Self {
        Self::from_events(std::slice::from_ref(event))
    }

    /// Merge several events into one deduplicated plan.
    pub fn from_events(events: &[InvalidationEvent]) -> Self {
        let mut plan = Self::default();

        for event in events {
            match event {
                InvalidationEvent::TaskCreated { day } => {
                    plan.patterns.insert(KeyPattern::TaskBucketsOf(*day));
                    plan.patterns
                        .insert(KeyPattern::Exact(QueryKey::UncompletedTasks));
                }
                InvalidationEvent::TaskUpdated { id } => {
                    plan.patterns.insert(KeyPattern::TaskCollections);
                    plan.patterns.insert(KeyPattern::Exact(QueryKey::Task(*id)));
                }
                // The returned row already settled every cached copy.
                InvalidationEvent::TaskRenamed { .. } => {}
                InvalidationEvent::TaskToggled { .. } => {
                    plan.patterns
                        .insert(KeyPattern::Exact(QueryKey::UncompletedTasks));
                }
                // The detail key is left alone; an open detail view closes
                // itself once the lists stop containing the id.
                InvalidationEvent::TaskDeleted { .. } => {
                    plan.patterns.insert(KeyPattern::TaskCollections);
                }
                InvalidationEvent::MemoCreated
                | InvalidationEvent::MemoUpdated { .. }
                | InvalidationEvent::MemosDeleted { .. } => {
                    plan.patterns.insert(KeyPattern::Exact(QueryKey::Memos));
                }
                InvalidationEvent::MemoPinToggled { .. } => {}
                InvalidationEvent::ProfileUpdated { user_id } => {
                    plan.patterns
                        .insert(KeyPattern::Exact(QueryKey::Profile(*user_id)));
                }
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(key))
    }
}

#[cfg(test)]
mod tests {
    use time::Month;
    use time::macros::date;

    use super::*;

    #[test]
    fn task_created_targets_its_buckets() {
        let plan = InvalidationPlan::for_event(&InvalidationEvent::TaskCreated {
            day: date!(2026 - 10 - 19),
        });

        assert!(plan.matches(&QueryKey::tasks_on(date!(2026 - 10 - 19))));
        assert!(plan.matches(&QueryKey::tasks_in_month(2026, Month::October)));
        assert!(plan.matches(&QueryKey::UncompletedTasks));
        assert!(!plan.matches(&QueryKey::tasks_on(date!(2026 - 10 - 18))));
        assert!(!plan.matches(&QueryKey::Memos));
    }

    #[test]
    fn task_updated_targets_collections_and_detail() {
        let id = Uuid::new_v4();
        let plan = InvalidationPlan::for_event(&InvalidationEvent::TaskUpdated { id });

        assert!(plan.matches(&QueryKey::Task(id)));
        assert!(plan.matches(&QueryKey::UncompletedTasks));
        assert!(plan.matches(&QueryKey::tasks_on(date!(2026 - 01 - 01))));
        assert!(!plan.matches(&QueryKey::Task(Uuid::new_v4())));
    }

    #[test]
    fn task_deleted_leaves_detail_key() {
        let id = Uuid::new_v4();
        let plan = InvalidationPlan::for_event(&InvalidationEvent::TaskDeleted { id });

        assert!(plan.matches(&QueryKey::UncompletedTasks));
        assert!(!plan.matches(&QueryKey::Task(id)));
    }

    #[test]
    fn profile_update_targets_only_that_profile() {
        let user_id = Uuid::new_v4();
        let plan = InvalidationPlan::for_event(&InvalidationEvent::ProfileUpdated { user_id });

        assert_eq!(plan.patterns.len(), 1);
        assert!(plan.matches(&QueryKey::Profile(user_id)));
        assert!(!plan.matches(&QueryKey::Profile(Uuid::new_v4())));
    }

    #[test]
    fn authoritative_mutations_need_no_refetch() {
        let id = Uuid::new_v4();
        assert!(InvalidationPlan::for_event(&InvalidationEvent::MemoPinToggled { id }).is_empty());
        assert!(InvalidationPlan::for_event(&InvalidationEvent::TaskRenamed { id }).is_empty());
    }

    #[test]
    fn merged_events_are_deduplicated() {
        let plan = InvalidationPlan::from_events(&[
            InvalidationEvent::MemoCreated,
            InvalidationEvent::MemoUpdated { id: Uuid::new_v4() },
            InvalidationEvent::MemosDeleted {
                ids: vec![Uuid::new_v4()],
            },
        ]);
        assert_eq!(plan.patterns.len(), 1);
        assert_eq!(plan.to_string(), "InvalidationPlan { patterns: 1 }");
    }
}
