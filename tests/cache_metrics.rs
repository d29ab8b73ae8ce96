use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use daybook::application::auth::{AuthSession, Credential};
use daybook::application::engine::CacheEngine;
use daybook::application::gateway::{Collection, RemoteError};
use daybook::application::mutations::MutationKind;
use daybook::cache::{CacheConfig, KeyPattern, QueryKey};
use daybook::infra::memory::MemoryGateway;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let user = Uuid::new_v4();
    let gateway = Arc::new(MemoryGateway::new());
    let auth = Arc::new(AuthSession::with_credential(Credential::new(user, "token")));
    let engine = CacheEngine::new(CacheConfig::default(), gateway.clone(), auth);

    let memo_id = Uuid::new_v4();
    let stamp = OffsetDateTime::now_utc().format(&Rfc3339).expect("timestamp");
    gateway.seed(
        Collection::Memos,
        json!({
            "id": memo_id.to_string(),
            "user_id": user.to_string(),
            "content": "metrics",
            "is_pinned": false,
            "created_at": stamp,
            "updated_at": stamp,
        }),
    );

    // Miss, dedup, then hit
    let (first, second) = tokio::join!(engine.memos(), engine.memos());
    first.expect("first");
    second.expect("second");
    engine.memos().await.expect("hit");

    // Invalidate
    engine.invalidate(&KeyPattern::Exact(QueryKey::Memos));
    engine.memos().await.expect("refetch");

    // Committed and rolled back mutations
    engine
        .mutate(MutationKind::ToggleMemoPin {
            id: memo_id,
            pinned: true,
        })
        .await
        .expect("pin");
    gateway.fail_next_on("update", Collection::Memos, RemoteError::unavailable("offline"));
    engine
        .mutate(MutationKind::UpdateMemo {
            id: memo_id,
            content: "lost".to_string(),
        })
        .await
        .expect_err("rolled back");

    // Garbage collection
    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(engine.collect_garbage() >= 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "daybook_cache_hit_total",
        "daybook_cache_miss_total",
        "daybook_cache_fetch_dedup_total",
        "daybook_cache_invalidate_total",
        "daybook_cache_evict_total",
        "daybook_cache_fetch_ms",
        "daybook_mutation_committed_total",
        "daybook_mutation_rolled_back_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
