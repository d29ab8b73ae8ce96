//! `CacheEngine`: the constructed cache instance views talk to.
//!
//! Lifecycle is `new → start → use → dispose`. Every engine owns its own
//! store, so tests can run isolated instances side by side.

use std::sync::{Arc, Mutex};

use time::{Date, Month};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::lock::mutex_lock;
use crate::cache::{
    CacheConfig, CacheEntry, CacheValue, EntityStore, KeyPattern, QueryKey, Subscription,
};
use crate::domain::entities::{MemoRecord, ProfileRecord, TaskRecord};

use super::auth::AuthSession;
use super::coordinator::{MutationCoordinator, MutationHandle};
use super::error::AppError;
use super::gateway::RemoteGateway;
use super::mutations::{MutationKind, MutationOutput};
use super::queries;

const SOURCE: &str = "application::engine";

pub struct CacheEngine {
    store: EntityStore,
    coordinator: MutationCoordinator,
    gateway: Arc<dyn RemoteGateway>,
    auth: Arc<AuthSession>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    pub fn new(config: CacheConfig, gateway: Arc<dyn RemoteGateway>, auth: Arc<AuthSession>) -> Self {
        let timezone = config.timezone;
        let store = EntityStore::new(config);
        let coordinator =
            MutationCoordinator::new(store.clone(), Arc::clone(&gateway), Arc::clone(&auth), timezone);
        Self {
            store,
            coordinator,
            gateway,
            auth,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the garbage-collection sweep and the credential watcher.
    /// Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut background = mutex_lock(&self.background, SOURCE, "start");
        if !background.is_empty() {
            return;
        }

        let store = self.store.clone();
        let interval = store.config().gc_interval;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                ticker.tick().await;
                store.collect_garbage(Instant::now());
            }
        }));

        let store = self.store.clone();
        let mut changes = self.auth.changes();
        let mut current = changes.borrow_and_update().as_ref().map(|c| c.user_id);
        background.push(tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let next = changes.borrow_and_update().as_ref().map(|c| c.user_id);
                if next != current {
                    info!(
                        previous = ?current,
                        next = ?next,
                        "Credential owner changed; clearing cache"
                    );
                    store.clear();
                }
                current = next;
            }
            debug!("Credential watcher stopped");
        }));

        info!(gc_interval_secs = interval.as_secs(), "Cache engine started");
    }

    /// Stop background work and drop every cached value.
    pub async fn dispose(&self) {
        let handles: Vec<_> = mutex_lock(&self.background, SOURCE, "dispose")
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.store.clear();
        info!("Cache engine disposed");
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    /// Load `key` through the store. Disabled while signed out.
    pub async fn query(&self, key: &QueryKey) -> Result<CacheValue, AppError> {
        let credential = self.auth.current().ok_or(AppError::Unauthenticated)?;
        let fetch = queries::fetcher(
            Arc::clone(&self.gateway),
            credential,
            key.clone(),
            self.store.config().timezone,
        );
        self.store
            .ensure(key, move || fetch)
            .await
            .map_err(AppError::from)
    }

    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.store.read(key)
    }

    pub fn subscribe(&self, key: &QueryKey) -> Subscription {
        self.store.subscribe(key)
    }

    pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        self.store.invalidate(pattern)
    }

    pub fn dispatch(&self, kind: MutationKind) -> Result<MutationHandle, AppError> {
        self.coordinator.dispatch(kind)
    }

    pub async fn mutate(&self, kind: MutationKind) -> Result<MutationOutput, AppError> {
        self.coordinator.mutate(kind).await
    }

    pub fn collect_garbage(&self) -> usize {
        self.store.collect_garbage(Instant::now())
    }

    pub async fn tasks_on(&self, date: Date) -> Result<Vec<TaskRecord>, AppError> {
        self.task_list(QueryKey::tasks_on(date)).await
    }

    pub async fn tasks_in_month(&self, year: i32, month: Month) -> Result<Vec<TaskRecord>, AppError> {
        self.task_list(QueryKey::tasks_in_month(year, month)).await
    }

    pub async fn uncompleted_tasks(&self) -> Result<Vec<TaskRecord>, AppError> {
        self.task_list(QueryKey::UncompletedTasks).await
    }

    pub async fn task(&self, id: Uuid) -> Result<TaskRecord, AppError> {
        let key = QueryKey::Task(id);
        match self.query(&key).await? {
            CacheValue::Task(task) => Ok(task),
            _ => Err(unexpected_shape(&key)),
        }
    }

    pub async fn memos(&self) -> Result<Vec<MemoRecord>, AppError> {
        let key = QueryKey::Memos;
        match self.query(&key).await? {
            CacheValue::Memos(memos) => Ok(memos),
            _ => Err(unexpected_shape(&key)),
        }
    }

    /// Profile of the signed-in user; `None` when the row does not exist.
    pub async fn profile(&self) -> Result<Option<ProfileRecord>, AppError> {
        let user_id = self
            .auth
            .current()
            .map(|credential| credential.user_id)
            .ok_or(AppError::Unauthenticated)?;
        let key = QueryKey::Profile(user_id);
        match self.query(&key).await? {
            CacheValue::Profile(profile) => Ok(profile),
            _ => Err(unexpected_shape(&key)),
        }
    }

    async fn task_list(&self, key: QueryKey) -> Result<Vec<TaskRecord>, AppError> {
        match self.query(&key).await? {
            CacheValue::Tasks(tasks) => Ok(tasks),
            _ => Err(unexpected_shape(&key)),
        }
    }
}

fn unexpected_shape(key: &QueryKey) -> AppError {
    AppError::unexpected(format!("cached value for {key} has an unexpected shape"))
}
