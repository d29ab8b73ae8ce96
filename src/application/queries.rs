//! Read side: how each `QueryKey` is loaded from the remote store.

use std::future::Future;
use std::sync::Arc;

use chrono_tz::Tz;
use daybook_api_types::{MemoRow, ProfileRow, TaskRow};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::cache::{CacheValue, QueryKey, TaskScope};
use crate::domain::entities::{MemoRecord, ProfileRecord, TaskRecord};
use crate::util::timezone::{day_range, month_range};

use super::auth::Credential;
use super::gateway::{
    Collection, Filter, Operation, Order, RemoteError, RemoteGateway, decode_rows, decode_single,
};

/// Owned fetch future for `key`, suitable for `EntityStore::ensure`.
pub fn fetcher(
    gateway: Arc<dyn RemoteGateway>,
    credential: Credential,
    key: QueryKey,
    timezone: Tz,
) -> impl Future<Output = Result<CacheValue, RemoteError>> + Send + 'static {
    async move { fetch(gateway.as_ref(), &credential, &key, timezone).await }
}

pub async fn fetch(
    gateway: &dyn RemoteGateway,
    credential: &Credential,
    key: &QueryKey,
    timezone: Tz,
) -> Result<CacheValue, RemoteError> {
    debug!(key = %key, user_id = %credential.user_id, "Fetching query");
    match key {
        QueryKey::Tasks(scope) => {
            let (start, end) = match *scope {
                TaskScope::Day(date) => day_range(date, timezone),
                TaskScope::Month { year, month } => month_range(year, month, timezone),
            };
            let filter = Filter::new()
                .eq("user_id", credential.user_id.to_string())
                .gte("created_at", timestamp(start)?)
                .lt("created_at", timestamp(end)?);
            select_tasks(gateway, credential, filter).await.map(CacheValue::Tasks)
        }
        QueryKey::Task(id) => {
            let rows = gateway
                .execute(
                    credential,
                    Operation::Select {
                        collection: Collection::Tasks,
                        filter: Filter::new().eq("id", id.to_string()),
                        order: None,
                    },
                )
                .await?;
            let row: TaskRow = decode_single(rows, Collection::Tasks)?;
            task_record(row).map(CacheValue::Task)
        }
        QueryKey::UncompletedTasks => {
            let filter = Filter::new()
                .eq("user_id", credential.user_id.to_string())
                .eq("is_completed", false);
            select_tasks(gateway, credential, filter).await.map(CacheValue::Tasks)
        }
        QueryKey::Memos => {
            let rows = gateway
                .execute(
                    credential,
                    Operation::Select {
                        collection: Collection::Memos,
                        filter: Filter::new().eq("user_id", credential.user_id.to_string()),
                        order: Some(Order::desc("created_at")),
                    },
                )
                .await?;
            let memos = decode_rows::<MemoRow>(rows)?
                .into_iter()
                .map(MemoRecord::from)
                .collect();
            Ok(CacheValue::Memos(memos))
        }
        QueryKey::Profile(user_id) => {
            let result = gateway
                .execute(
                    credential,
                    Operation::Select {
                        collection: Collection::Profiles,
                        filter: Filter::new().eq("id", user_id.to_string()),
                        order: None,
                    },
                )
                .await;
            let rows = match result {
                Ok(rows) => rows,
                Err(RemoteError::NotFound { .. }) => Vec::new(),
                Err(err) => return Err(err),
            };
            let profile = decode_rows::<ProfileRow>(rows)?
                .into_iter()
                .next()
                .map(ProfileRecord::from);
            Ok(CacheValue::Profile(profile))
        }
    }
}

async fn select_tasks(
    gateway: &dyn RemoteGateway,
    credential: &Credential,
    filter: Filter,
) -> Result<Vec<TaskRecord>, RemoteError> {
    let rows = gateway
        .execute(
            credential,
            Operation::Select {
                collection: Collection::Tasks,
                filter,
                order: Some(Order::desc("created_at")),
            },
        )
        .await?;
    decode_rows::<TaskRow>(rows)?
        .into_iter()
        .map(task_record)
        .collect()
}

pub(crate) fn task_record(row: TaskRow) -> Result<TaskRecord, RemoteError> {
    TaskRecord::try_from(row).map_err(|err| RemoteError::invalid(err.to_string()))
}

fn timestamp(value: OffsetDateTime) -> Result<String, RemoteError> {
    value
        .format(&Rfc3339)
        .map_err(|err| RemoteError::invalid(format!("unrepresentable timestamp: {err}")))
}
