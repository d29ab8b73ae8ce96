use std::sync::Arc;

use daybook::application::auth::{AuthSession, Credential};
use daybook::application::engine::CacheEngine;
use daybook::application::error::AppError;
use daybook::application::gateway::{Collection, Operation, RemoteError};
use daybook::application::mutations::{MutationKind, MutationOutput};
use daybook::cache::{CacheConfig, CacheValue, FetchStatus, QueryKey};
use daybook::domain::entities::{MemoRecord, TaskRecord};
use daybook::infra::memory::MemoryGateway;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

struct Fixture {
    engine: CacheEngine,
    gateway: Arc<MemoryGateway>,
    user: Uuid,
    now: OffsetDateTime,
}

impl Fixture {
    fn new() -> Self {
        let user = Uuid::new_v4();
        let gateway = Arc::new(MemoryGateway::new());
        let auth = Arc::new(AuthSession::with_credential(Credential::new(user, "token")));
        let engine = CacheEngine::new(CacheConfig::default(), gateway.clone(), auth);
        Self {
            engine,
            gateway,
            user,
            now: OffsetDateTime::now_utc(),
        }
    }

    fn today(&self) -> Date {
        self.now.date()
    }

    fn seed_task(&self, title: &str, minutes_ago: i64) -> Uuid {
        let id = Uuid::new_v4();
        let midnight = self.now.replace_time(time::Time::MIDNIGHT);
        let created_at = (self.now - Duration::minutes(minutes_ago)).max(midnight);
        self.gateway.seed(
            Collection::Tasks,
            json!({
                "id": id.to_string(),
                "user_id": self.user.to_string(),
                "created_at": created_at.format(&Rfc3339).expect("timestamp"),
                "title": title,
                "is_completed": false,
                "due_date": null,
                "description": null,
                "category": "personal",
            }),
        );
        id
    }

    fn seed_memo(&self, content: &str, minutes_ago: i64) -> Uuid {
        let id = Uuid::new_v4();
        let stamp = (self.now - Duration::minutes(minutes_ago))
            .format(&Rfc3339)
            .expect("timestamp");
        self.gateway.seed(
            Collection::Memos,
            json!({
                "id": id.to_string(),
                "user_id": self.user.to_string(),
                "content": content,
                "is_pinned": false,
                "created_at": stamp,
                "updated_at": stamp,
            }),
        );
        id
    }

    fn day_tasks(&self) -> Vec<TaskRecord> {
        tasks(&self.engine, &QueryKey::tasks_on(self.today()))
    }

    fn detail(&self, id: Uuid) -> TaskRecord {
        match self.engine.read(&QueryKey::Task(id)).and_then(|entry| entry.data) {
            Some(CacheValue::Task(task)) => task,
            other => panic!("task detail not cached: {other:?}"),
        }
    }

    fn memos(&self) -> Vec<MemoRecord> {
        match self.engine.read(&QueryKey::Memos).and_then(|entry| entry.data) {
            Some(CacheValue::Memos(memos)) => memos,
            other => panic!("memos not cached: {other:?}"),
        }
    }
}

fn tasks(engine: &CacheEngine, key: &QueryKey) -> Vec<TaskRecord> {
    match engine.read(key).and_then(|entry| entry.data) {
        Some(CacheValue::Tasks(tasks)) => tasks,
        other => panic!("task list not cached for {key}: {other:?}"),
    }
}

fn ids(memos: &[MemoRecord]) -> Vec<Uuid> {
    memos.iter().map(|memo| memo.id).collect()
}

#[tokio::test]
async fn toggle_rolls_back_when_remote_is_unavailable() {
    let fx = Fixture::new();
    let id = fx.seed_task("Write report", 1);
    fx.engine.tasks_on(fx.today()).await.expect("day list");
    fx.engine.task(id).await.expect("detail");
    fx.engine.uncompleted_tasks().await.expect("uncompleted");

    fx.gateway
        .fail_next_on("update", Collection::Tasks, RemoteError::unavailable("offline"));
    let handle = fx
        .engine
        .dispatch(MutationKind::ToggleTask {
            id,
            is_completed: true,
        })
        .expect("dispatch");

    assert!(fx.detail(id).is_completed);
    assert!(fx.day_tasks().iter().all(|task| task.is_completed));
    assert_eq!(
        fx.engine
            .read(&QueryKey::Task(id))
            .map(|entry| entry.pending_mutations),
        Some(1)
    );

    let err = handle.settled().await.unwrap_err();
    assert!(matches!(err.remote(), Some(RemoteError::Unavailable { .. })));

    assert!(!fx.detail(id).is_completed);
    assert!(fx.day_tasks().iter().all(|task| !task.is_completed));
    let uncompleted = tasks(&fx.engine, &QueryKey::UncompletedTasks);
    assert_eq!(uncompleted.len(), 1);
    assert!(!uncompleted[0].is_completed);
    assert_eq!(
        fx.engine
            .read(&QueryKey::Task(id))
            .map(|entry| entry.pending_mutations),
        Some(0)
    );
}

#[tokio::test]
async fn committed_toggle_drops_task_from_uncompleted_list() {
    let fx = Fixture::new();
    let id = fx.seed_task("Water plants", 1);
    fx.engine.uncompleted_tasks().await.expect("uncompleted");
    fx.engine.task(id).await.expect("detail");

    let output = fx
        .engine
        .mutate(MutationKind::ToggleTask {
            id,
            is_completed: true,
        })
        .await
        .expect("toggle");

    assert!(matches!(output, MutationOutput::Task(ref task) if task.is_completed));
    assert!(fx.detail(id).is_completed);
    assert!(tasks(&fx.engine, &QueryKey::UncompletedTasks).is_empty());

    let refetched = fx.engine.uncompleted_tasks().await.expect("refetch");
    assert!(refetched.is_empty());
}

#[tokio::test]
async fn create_then_list_has_one_entry_with_server_id() {
    let fx = Fixture::new();
    assert!(fx.engine.tasks_on(fx.today()).await.expect("day list").is_empty());

    let handle = fx
        .engine
        .dispatch(MutationKind::CreateTask {
            title: "  Buy milk ".to_string(),
            category: None,
        })
        .expect("dispatch");

    let optimistic = fx.day_tasks();
    assert_eq!(optimistic.len(), 1);
    assert_eq!(optimistic[0].title, "Buy milk");
    let provisional_id = optimistic[0].id;
    assert!(fx.gateway.rows(Collection::Tasks).is_empty());

    let created = match handle.settled().await.expect("commit") {
        MutationOutput::Task(task) => task,
        other => panic!("unexpected output: {other:?}"),
    };
    assert_ne!(created.id, provisional_id);

    let settled = fx.day_tasks();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].id, created.id);
    assert_eq!(settled[0].created_at, created.created_at);

    let entry = fx
        .engine
        .read(&QueryKey::tasks_on(fx.today()))
        .expect("entry");
    assert_eq!(entry.status, FetchStatus::Stale);

    let refetched = fx.engine.tasks_on(fx.today()).await.expect("refetch");
    let milk: Vec<_> = refetched.iter().filter(|t| t.title == "Buy milk").collect();
    assert_eq!(milk.len(), 1);
    assert_eq!(milk[0].id, created.id);
    assert_eq!(fx.gateway.calls("select", Collection::Tasks), 2);
}

#[tokio::test]
async fn invalid_create_is_rejected_before_dispatch() {
    let fx = Fixture::new();
    fx.engine.tasks_on(fx.today()).await.expect("day list");

    let err = fx
        .engine
        .dispatch(MutationKind::CreateTask {
            title: "   ".to_string(),
            category: None,
        })
        .unwrap_err();

    assert!(!err.user_message().is_empty());
    assert!(fx.day_tasks().is_empty());
    assert_eq!(fx.gateway.calls("insert", Collection::Tasks), 0);
}

#[tokio::test]
async fn invalid_remote_message_is_surfaced_verbatim() {
    let fx = Fixture::new();
    let id = fx.seed_task("Draft", 1);
    fx.engine.task(id).await.expect("detail");

    fx.gateway.fail_next_on(
        "update",
        Collection::Tasks,
        RemoteError::invalid("title must be at most 200 characters"),
    );
    let err = fx
        .engine
        .mutate(MutationKind::RenameTask {
            id,
            title: "x".repeat(300),
        })
        .await
        .unwrap_err();

    assert_eq!(err.user_message(), "title must be at most 200 characters");
    assert_eq!(fx.detail(id).title, "Draft");
}

#[tokio::test]
async fn batch_delete_success_excludes_every_id() {
    let fx = Fixture::new();
    let keep = fx.seed_memo("keep", 40);
    let doomed = [
        fx.seed_memo("one", 30),
        fx.seed_memo("two", 20),
        fx.seed_memo("three", 10),
    ];
    fx.engine.memos().await.expect("memos");

    let handle = fx
        .engine
        .dispatch(MutationKind::DeleteMemos {
            ids: doomed.to_vec(),
        })
        .expect("dispatch");
    assert_eq!(ids(&fx.memos()), vec![keep]);

    let output = handle.settled().await.expect("commit");
    assert_eq!(output, MutationOutput::Deleted(doomed.to_vec()));

    let refetched = fx.engine.memos().await.expect("refetch");
    assert_eq!(ids(&refetched), vec![keep]);
    assert_eq!(fx.gateway.calls("delete", Collection::Memos), 3);
}

#[tokio::test]
async fn batch_delete_failure_restores_original_order() {
    let fx = Fixture::new();
    fx.seed_memo("oldest", 40);
    let doomed = [
        fx.seed_memo("one", 30),
        fx.seed_memo("two", 20),
        fx.seed_memo("three", 10),
    ];
    let before = ids(&fx.engine.memos().await.expect("memos"));

    fx.gateway
        .fail_next_on("delete", Collection::Memos, RemoteError::conflict("row locked"));
    let handle = fx
        .engine
        .dispatch(MutationKind::DeleteMemos {
            ids: doomed.to_vec(),
        })
        .expect("dispatch");
    assert_eq!(fx.memos().len(), 1);

    let err = handle.settled().await.unwrap_err();
    assert!(matches!(err.remote(), Some(RemoteError::Conflict { .. })));
    assert_eq!(ids(&fx.memos()), before);
}

#[tokio::test]
async fn overlapping_mutations_roll_back_only_their_own_change() {
    let fx = Fixture::new();
    let id = fx.seed_task("Original", 1);
    fx.engine.task(id).await.expect("detail");
    fx.engine.tasks_on(fx.today()).await.expect("day list");

    fx.gateway.pause();
    fx.gateway.fail_next_where(
        |operation| {
            matches!(operation, Operation::Update { patch, .. } if patch.get("title").is_some())
        },
        RemoteError::unavailable("offline"),
    );

    let rename = fx
        .engine
        .dispatch(MutationKind::RenameTask {
            id,
            title: "Renamed".to_string(),
        })
        .expect("rename");
    let toggle = fx
        .engine
        .dispatch(MutationKind::ToggleTask {
            id,
            is_completed: true,
        })
        .expect("toggle");

    let both = fx.detail(id);
    assert_eq!(both.title, "Renamed");
    assert!(both.is_completed);
    assert_eq!(fx.engine.coordinator().in_flight().len(), 2);

    fx.gateway.resume();
    assert!(rename.settled().await.is_err());
    toggle.settled().await.expect("toggle commits");

    let settled = fx.detail(id);
    assert_eq!(settled.title, "Original");
    assert!(settled.is_completed);
    let listed = fx.day_tasks();
    assert_eq!(listed[0].title, "Original");
    assert!(listed[0].is_completed);
    assert!(fx.engine.coordinator().in_flight().is_empty());
}

#[tokio::test]
async fn updating_a_foreign_task_is_not_found() {
    let fx = Fixture::new();
    let id = fx.seed_task("Mine", 1);
    fx.engine.tasks_on(fx.today()).await.expect("day list");

    let stranger = Uuid::new_v4();
    let engine = CacheEngine::new(
        CacheConfig::default(),
        fx.gateway.clone(),
        Arc::new(AuthSession::with_credential(Credential::new(stranger, "other"))),
    );
    let err = engine
        .mutate(MutationKind::UpdateTask {
            id,
            patch: daybook::domain::entities::TaskPatch::title("Hijacked"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err.remote(), Some(RemoteError::NotFound { .. })));

    assert_eq!(fx.day_tasks()[0].title, "Mine");
    assert_eq!(fx.gateway.rows(Collection::Tasks).len(), 1);
}

#[tokio::test]
async fn signed_out_mutations_are_rejected_without_remote_calls() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = CacheEngine::new(
        CacheConfig::default(),
        gateway.clone(),
        Arc::new(AuthSession::new()),
    );

    let err = engine
        .dispatch(MutationKind::CreateMemo {
            content: "hello".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated));
    assert!(err.requires_sign_in());

    let err = engine.memos().await.unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated));
    assert_eq!(gateway.total_calls(), 0);
    assert!(engine.store().keys().is_empty());
}

#[tokio::test]
async fn pinning_a_memo_commits_without_invalidating() {
    let fx = Fixture::new();
    let id = fx.seed_memo("pin me", 5);
    fx.engine.memos().await.expect("memos");

    fx.engine
        .mutate(MutationKind::ToggleMemoPin { id, pinned: true })
        .await
        .expect("pin");

    let entry = fx.engine.read(&QueryKey::Memos).expect("entry");
    assert_eq!(entry.status, FetchStatus::Fresh);
    assert!(fx.memos()[0].is_pinned);
}
