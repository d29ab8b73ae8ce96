//! In-memory row store implementing [`RemoteGateway`].
//!
//! Behaves like the remote store as far as the cache can tell: rows are
//! authorized against their owner, ids and timestamps are assigned by the
//! "server", and lists come back ordered. Tests use the call counters,
//! injected failures and the two gates to pin down interleavings.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::application::auth::Credential;
use crate::application::gateway::{
    Collection, Condition, Filter, FilterOp, Operation, Order, RemoteError, RemoteGateway, Row,
};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "infra::memory";

type Matcher = Box<dyn Fn(&Operation) -> bool + Send>;

struct Failure {
    matcher: Matcher,
    error: RemoteError,
}

#[derive(Default)]
struct State {
    tables: HashMap<Collection, Vec<Map<String, Value>>>,
    calls: HashMap<(&'static str, Collection), usize>,
    failures: VecDeque<Failure>,
    held_replies: Option<Matcher>,
    revoked: Vec<String>,
    last_stamp: Option<OffsetDateTime>,
}

impl State {
    /// Strictly increasing server clock, so `created_at` ordering is total.
    fn stamp(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let next = match self.last_stamp {
            Some(last) if now <= last => last + time::Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(next);
        next
    }

    fn take_failure(&mut self, operation: &Operation) -> Option<RemoteError> {
        let position = self.failures.iter().position(|f| (f.matcher)(operation))?;
        self.failures.remove(position).map(|failure| failure.error)
    }
}

pub struct MemoryGateway {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
    reply_gate: watch::Sender<bool>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        let (gate, _receiver) = watch::channel(false);
        let (reply_gate, _receiver) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            gate,
            reply_gate,
        }
    }

    /// Insert a row as-is, bypassing authorization and server defaults.
    pub fn seed(&self, collection: Collection, row: Row) {
        if let Value::Object(row) = row {
            self.lock("seed")
                .tables
                .entry(collection)
                .or_default()
                .push(row);
        }
    }

    /// Current contents of `collection`, in insertion order.
    pub fn rows(&self, collection: Collection) -> Vec<Row> {
        self.lock("rows")
            .tables
            .get(&collection)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Number of `verb` calls made against `collection` (`"select"`, `"insert"`, ...).
    pub fn calls(&self, verb: &'static str, collection: Collection) -> usize {
        self.lock("calls")
            .calls
            .get(&(verb, collection))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock("total_calls").calls.values().sum()
    }

    /// Fail the next call of any kind with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.fail_next_where(|_| true, error);
    }

    /// Fail the next `verb` call against `collection` with `error`.
    pub fn fail_next_on(&self, verb: &'static str, collection: Collection, error: RemoteError) {
        self.fail_next_where(
            move |operation| operation.verb() == verb && operation.collection() == collection,
            error,
        );
    }

    /// Fail the next call `matcher` accepts with `error`.
    pub fn fail_next_where(
        &self,
        matcher: impl Fn(&Operation) -> bool + Send + 'static,
        error: RemoteError,
    ) {
        self.lock("fail_next_where").failures.push_back(Failure {
            matcher: Box::new(matcher),
            error,
        });
    }

    /// Reject every later call carrying `access_token`.
    pub fn revoke(&self, access_token: impl Into<String>) {
        self.lock("revoke").revoked.push(access_token.into());
    }

    /// Hold every call at the gate until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.gate.send_replace(true);
    }

    pub fn resume(&self) {
        self.gate.send_replace(false);
    }

    /// Run `verb` calls against `collection` right away but hold their
    /// replies until [`release_replies`](Self::release_replies).
    pub fn hold_replies_on(&self, verb: &'static str, collection: Collection) {
        self.lock("hold_replies_on").held_replies = Some(Box::new(move |operation: &Operation| {
            operation.verb() == verb && operation.collection() == collection
        }));
        self.reply_gate.send_replace(true);
    }

    pub fn release_replies(&self) {
        self.lock("release_replies").held_replies = None;
        self.reply_gate.send_replace(false);
    }

    fn holds_reply(&self, operation: &Operation) -> bool {
        self.lock("holds_reply")
            .held_replies
            .as_ref()
            .is_some_and(|matcher| matcher(operation))
    }

    async fn wait_open(gate: &watch::Sender<bool>) {
        let mut gate = gate.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = gate.wait_for(|closed| !closed).await;
    }

    fn lock(&self, op: &'static str) -> std::sync::MutexGuard<'_, State> {
        mutex_lock(&self.state, SOURCE, op)
    }

    fn apply(
        &self,
        credential: &Credential,
        operation: Operation,
    ) -> Result<Vec<Row>, RemoteError> {
        let mut state = self.lock("execute");
        let collection = operation.collection();
        *state.calls.entry((operation.verb(), collection)).or_default() += 1;

        if let Some(error) = state.take_failure(&operation) {
            debug!(table = %collection, verb = operation.verb(), error = %error, "Injected failure");
            return Err(error);
        }
        if state.revoked.contains(&credential.access_token) {
            return Err(RemoteError::unauthorized("JWT expired"));
        }

        let owner = credential.user_id.to_string();
        let owner_column = collection.owner_column();
        let owned = |row: &Map<String, Value>| owned_by(row, owner_column, &owner);

        match operation {
            Operation::Select { filter, order, .. } => {
                let mut rows: Vec<_> = state
                    .tables
                    .get(&collection)
                    .into_iter()
                    .flatten()
                    .filter(|row| owned_by(row, owner_column, &owner) && matches_filter(row, &filter))
                    .cloned()
                    .collect();
                if let Some(order) = order {
                    sort_rows(&mut rows, order);
                }
                Ok(rows.into_iter().map(Value::Object).collect())
            }
            Operation::Insert { row, .. } => {
                let Value::Object(mut row) = row else {
                    return Err(RemoteError::invalid("insert body must be an object"));
                };
                if !owned(&row) {
                    return Err(RemoteError::unauthorized(format!(
                        "new row violates row-level security policy for table \"{collection}\""
                    )));
                }
                let stamp = timestamp(state.stamp())?;
                fill_defaults(collection, &mut row, &stamp);

                let table = state.tables.entry(collection).or_default();
                if let Some(id) = row.get("id")
                    && table.iter().any(|existing| existing.get("id") == Some(id))
                {
                    return Err(RemoteError::conflict(format!(
                        "duplicate key value violates unique constraint \"{collection}_pkey\""
                    )));
                }
                table.push(row.clone());
                Ok(vec![Value::Object(row)])
            }
            Operation::Update { filter, patch, .. } => {
                let Value::Object(patch) = patch else {
                    return Err(RemoteError::invalid("update body must be an object"));
                };
                let stamp = timestamp(state.stamp())?;
                let touches_updated_at = matches!(collection, Collection::Memos | Collection::Profiles);
                let mut updated = Vec::new();
                for row in state.tables.entry(collection).or_default().iter_mut() {
                    if !owned_by(row, owner_column, &owner) || !matches_filter(row, &filter) {
                        continue;
                    }
                    for (column, value) in &patch {
                        row.insert(column.clone(), value.clone());
                    }
                    if touches_updated_at {
                        row.insert("updated_at".to_string(), Value::String(stamp.clone()));
                    }
                    updated.push(Value::Object(row.clone()));
                }
                Ok(updated)
            }
            Operation::Delete { filter, .. } => {
                let table = state.tables.entry(collection).or_default();
                let mut deleted = Vec::new();
                table.retain(|row| {
                    let matched = owned(row) && matches_filter(row, &filter);
                    if matched {
                        deleted.push(Value::Object(row.clone()));
                    }
                    !matched
                });
                Ok(deleted)
            }
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn execute(
        &self,
        credential: &Credential,
        operation: Operation,
    ) -> Result<Vec<Row>, RemoteError> {
        Self::wait_open(&self.gate).await;
        let hold_reply = self.holds_reply(&operation);
        let result = self.apply(credential, operation);
        if hold_reply {
            debug!("Reply held");
            Self::wait_open(&self.reply_gate).await;
        }
        result
    }
}

fn fill_defaults(collection: Collection, row: &mut Map<String, Value>, stamp: &str) {
    let stamp = Value::String(stamp.to_string());
    row.entry("id")
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    match collection {
        Collection::Tasks => {
            row.entry("created_at").or_insert(stamp);
            row.entry("is_completed").or_insert(Value::Bool(false));
            row.entry("due_date").or_insert(Value::Null);
            row.entry("description").or_insert(Value::Null);
        }
        Collection::Memos => {
            row.entry("is_pinned").or_insert(Value::Bool(false));
            row.entry("created_at").or_insert(stamp.clone());
            row.entry("updated_at").or_insert(stamp);
        }
        Collection::Profiles => {
            row.entry("updated_at").or_insert(stamp);
        }
    }
}

fn owned_by(row: &Map<String, Value>, column: &str, owner: &str) -> bool {
    row.get(column).and_then(Value::as_str) == Some(owner)
}

fn matches_filter(row: &Map<String, Value>, filter: &Filter) -> bool {
    filter.conditions.iter().all(|condition| matches_condition(row, condition))
}

fn matches_condition(row: &Map<String, Value>, condition: &Condition) -> bool {
    let actual = row.get(condition.column).unwrap_or(&Value::Null);
    match condition.op {
        FilterOp::Eq => actual == &condition.value,
        FilterOp::Gte => compare(actual, &condition.value).is_some_and(|o| o.is_ge()),
        FilterOp::Lt => compare(actual, &condition.value).is_some_and(|o| o.is_lt()),
        FilterOp::In => condition
            .value
            .as_array()
            .is_some_and(|values| values.contains(actual)),
    }
}

/// Timestamps compare as instants; other strings and numbers compare by value.
fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => {
            match (
                OffsetDateTime::parse(l, &Rfc3339),
                OffsetDateTime::parse(r, &Rfc3339),
            ) {
                (Ok(l), Ok(r)) => Some(l.cmp(&r)),
                _ => Some(l.cmp(r)),
            }
        }
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        _ => None,
    }
}

fn sort_rows(rows: &mut [Map<String, Value>], order: Order) {
    rows.sort_by(|a, b| {
        let left = a.get(order.column).unwrap_or(&Value::Null);
        let right = b.get(order.column).unwrap_or(&Value::Null);
        let ordering = compare(left, right).unwrap_or(std::cmp::Ordering::Equal);
        if order.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
}

fn timestamp(value: OffsetDateTime) -> Result<String, RemoteError> {
    value
        .format(&Rfc3339)
        .map_err(|err| RemoteError::unavailable(format!("server clock unrepresentable: {err}")))
}
