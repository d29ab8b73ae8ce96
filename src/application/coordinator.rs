//! Mutation coordinator.
//!
//! `dispatch` applies a mutation's optimistic layers synchronously and then
//! runs the remote call on its own task. Settlement either commits the
//! layers (swapping in the server's record when it returned one) and
//! invalidates the routed keys, or discards exactly this mutation's layers.
//! Other in-flight mutations on the same keys keep their layers, so
//! overlapping edits to one entity never clobber each other on rollback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono_tz::Tz;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::lock::mutex_lock;
use crate::cache::{CacheValue, EntityStore, InvalidationPlan, QueryKey};

use super::auth::{AuthSession, Credential};
use super::error::AppError;
use super::gateway::{RemoteError, RemoteGateway, Row};
use super::mutations::{MutationKind, MutationOutput, PreparedMutation};

const SOURCE: &str = "application::coordinator";

const METRIC_MUTATION_COMMITTED: &str = "daybook_mutation_committed_total";
const METRIC_MUTATION_ROLLED_BACK: &str = "daybook_mutation_rolled_back_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

/// Bookkeeping for one dispatched mutation, kept until its settlement and
/// invalidation are done.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub id: Uuid,
    pub name: &'static str,
    pub target_keys: Vec<QueryKey>,
    /// Visible value of each target key just before dispatch.
    pub previous_snapshot: Vec<(QueryKey, Option<CacheValue>)>,
    /// Visible value of each target key right after the optimistic layer.
    pub optimistic_value: Vec<(QueryKey, Option<CacheValue>)>,
    pub status: MutationStatus,
}

/// Handle to a dispatched mutation.
///
/// Dropping the handle does not cancel the mutation.
#[derive(Debug)]
pub struct MutationHandle {
    id: Uuid,
    outcome: oneshot::Receiver<Result<MutationOutput, AppError>>,
}

impl MutationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for commit or rollback.
    pub async fn settled(self) -> Result<MutationOutput, AppError> {
        self.outcome
            .await
            .map_err(|_| AppError::unexpected("mutation task ended without settling"))?
    }
}

type RecordMap = Mutex<HashMap<Uuid, MutationRecord>>;

#[derive(Clone)]
pub struct MutationCoordinator {
    store: EntityStore,
    gateway: Arc<dyn RemoteGateway>,
    auth: Arc<AuthSession>,
    records: Arc<RecordMap>,
    timezone: Tz,
}

impl MutationCoordinator {
    pub fn new(
        store: EntityStore,
        gateway: Arc<dyn RemoteGateway>,
        auth: Arc<AuthSession>,
        timezone: Tz,
    ) -> Self {
        Self {
            store,
            gateway,
            auth,
            records: Arc::new(Mutex::new(HashMap::new())),
            timezone,
        }
    }

    /// Apply `kind` optimistically and start its remote call.
    ///
    /// Fails without touching the cache when no credential is installed or
    /// the mutation does not validate.
    pub fn dispatch(&self, kind: MutationKind) -> Result<MutationHandle, AppError> {
        let Some(credential) = self.auth.current() else {
            warn!(mutation = kind.name(), "Mutation rejected without credential");
            return Err(AppError::Unauthenticated);
        };
        let prepared = kind.prepare(&credential, OffsetDateTime::now_utc(), self.timezone)?;
        let id = Uuid::new_v4();

        let mut target_keys: Vec<QueryKey> = Vec::new();
        for pattern in prepared.patterns() {
            for key in self.store.keys_matching(&pattern) {
                if !target_keys.contains(&key) {
                    target_keys.push(key);
                }
            }
        }

        let mut previous_snapshot = Vec::new();
        let mut optimistic_value = Vec::new();
        let mut layered = Vec::new();
        for key in target_keys {
            let Some(patch) = prepared.optimistic_patch(&key) else {
                continue;
            };
            previous_snapshot.push((key.clone(), self.store.data(&key)));
            self.store.apply_layer(&key, id, patch);
            optimistic_value.push((key.clone(), self.store.data(&key)));
            layered.push(key);
        }

        info!(
            mutation = prepared.name,
            mutation_id = %id,
            targets = layered.len(),
            "Mutation dispatched"
        );

        self.records_lock("dispatch").insert(
            id,
            MutationRecord {
                id,
                name: prepared.name,
                target_keys: layered.clone(),
                previous_snapshot,
                optimistic_value,
                status: MutationStatus::Pending,
            },
        );

        let (sender, outcome) = oneshot::channel();
        let coordinator = self.clone();
        tokio::spawn(async move {
            let result = coordinator
                .run(id, &credential, &prepared, &layered)
                .await;
            let _ = sender.send(result);
        });

        Ok(MutationHandle { id, outcome })
    }

    /// Dispatch and wait for settlement.
    pub async fn mutate(&self, kind: MutationKind) -> Result<MutationOutput, AppError> {
        self.dispatch(kind)?.settled().await
    }

    /// Records not yet released. A settled record shows its terminal status
    /// while its invalidation runs.
    pub fn in_flight(&self) -> Vec<MutationRecord> {
        self.records_lock("in_flight").values().cloned().collect()
    }

    async fn run(
        &self,
        id: Uuid,
        credential: &Credential,
        prepared: &PreparedMutation,
        layered: &[QueryKey],
    ) -> Result<MutationOutput, AppError> {
        let settlement = self
            .execute(credential, prepared)
            .await
            .and_then(|responses| prepared.settle(responses));

        match settlement {
            Ok(settlement) => {
                for key in layered {
                    let authoritative = settlement
                        .authoritative
                        .as_ref()
                        .and_then(|record| record.patch_for(key, prepared.timezone()));
                    self.store.commit_layer(key, id, authoritative);
                }
                self.settle_record(id, MutationStatus::Committed);
                let plan = InvalidationPlan::for_event(&settlement.event);
                let mut invalidated = 0;
                for pattern in &plan.patterns {
                    invalidated += self.store.invalidate(pattern).len();
                }
                self.finish(id);
                counter!(METRIC_MUTATION_COMMITTED, "mutation" => prepared.name).increment(1);
                info!(
                    mutation = prepared.name,
                    mutation_id = %id,
                    event = settlement.event.name(),
                    invalidated,
                    "Mutation committed"
                );
                Ok(settlement.output)
            }
            Err(err) => {
                for key in layered {
                    self.store.discard_layer(key, id);
                }
                self.settle_record(id, MutationStatus::RolledBack);
                self.finish(id);
                counter!(
                    METRIC_MUTATION_ROLLED_BACK,
                    "mutation" => prepared.name,
                    "reason" => format!("{:?}", err.kind()).to_lowercase()
                )
                .increment(1);
                warn!(
                    mutation = prepared.name,
                    mutation_id = %id,
                    error = %err,
                    "Mutation rolled back"
                );
                Err(AppError::Remote(err))
            }
        }
    }

    /// Run every remote operation; any failure fails the whole mutation.
    async fn execute(
        &self,
        credential: &Credential,
        prepared: &PreparedMutation,
    ) -> Result<Vec<Vec<Row>>, RemoteError> {
        let calls = prepared
            .operations
            .iter()
            .cloned()
            .map(|operation| self.gateway.execute(credential, operation));
        join_all(calls).await.into_iter().collect()
    }

    fn settle_record(&self, id: Uuid, status: MutationStatus) {
        if let Some(record) = self.records_lock("settle_record").get_mut(&id) {
            record.status = status;
        }
    }

    /// Drop the settled record.
    fn finish(&self, id: Uuid) -> Option<MutationRecord> {
        let record = self.records_lock("finish").remove(&id)?;
        debug!(
            mutation = record.name,
            mutation_id = %id,
            status = ?record.status,
            "Mutation record released"
        );
        Some(record)
    }

    fn records_lock(&self, op: &'static str) -> MutexGuard<'_, HashMap<Uuid, MutationRecord>> {
        mutex_lock(&self.records, SOURCE, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::infra::memory::MemoryGateway;

    fn coordinator(gateway: Arc<MemoryGateway>) -> MutationCoordinator {
        let auth = Arc::new(AuthSession::with_credential(Credential::new(
            Uuid::new_v4(),
            "token",
        )));
        MutationCoordinator::new(EntityStore::new(CacheConfig::default()), gateway, auth, Tz::UTC)
    }

    #[tokio::test]
    async fn dispatched_record_stays_pending_until_settled() {
        let gateway = Arc::new(MemoryGateway::new());
        let coordinator = coordinator(Arc::clone(&gateway));
        gateway.pause();

        let handle = coordinator
            .dispatch(MutationKind::CreateMemo {
                content: "note".to_string(),
            })
            .expect("dispatch");
        let listed = coordinator.in_flight();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, handle.id());
        assert_eq!(listed[0].status, MutationStatus::Pending);

        gateway.resume();
        handle.settled().await.expect("commit");
        assert!(coordinator.in_flight().is_empty());
    }

    #[test]
    fn settled_record_carries_terminal_status_until_released() {
        let coordinator = coordinator(Arc::new(MemoryGateway::new()));
        let id = Uuid::new_v4();
        coordinator.records_lock("test").insert(
            id,
            MutationRecord {
                id,
                name: "toggle_task",
                target_keys: Vec::new(),
                previous_snapshot: Vec::new(),
                optimistic_value: Vec::new(),
                status: MutationStatus::Pending,
            },
        );

        coordinator.settle_record(id, MutationStatus::RolledBack);
        let listed = coordinator.in_flight();
        assert_eq!(listed[0].status, MutationStatus::RolledBack);

        let released = coordinator.finish(id).expect("record");
        assert_eq!(released.status, MutationStatus::RolledBack);
        assert!(coordinator.in_flight().is_empty());
        assert!(coordinator.finish(id).is_none());
    }
}
