//! Remote Gateway contract: row CRUD against the external store.
//!
//! The gateway performs exactly one attempt per operation. Retries, if any,
//! are the caller's decision; nothing in this crate retries automatically.

use std::fmt;

use async_trait::async_trait;
use daybook_api_types::{MEMOS_TABLE, PROFILES_TABLE, TASKS_TABLE};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::auth::Credential;

pub type Row = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Tasks,
    Memos,
    Profiles,
}

impl Collection {
    pub fn table(self) -> &'static str {
        match self {
            Self::Tasks => TASKS_TABLE,
            Self::Memos => MEMOS_TABLE,
            Self::Profiles => PROFILES_TABLE,
        }
    }

    /// Column holding the owning user; row-level authorization keys on it.
    pub fn owner_column(self) -> &'static str {
        match self {
            Self::Tasks | Self::Memos => "user_id",
            Self::Profiles => "id",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lt,
    In,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: &'static str,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, column: &'static str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            column,
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, FilterOp::Eq, value)
    }

    pub fn gte(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, FilterOp::Gte, value)
    }

    pub fn lt(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, FilterOp::Lt, value)
    }

    pub fn is_in(self, column: &'static str, values: Vec<Value>) -> Self {
        self.push(column, FilterOp::In, Value::Array(values))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub column: &'static str,
    pub ascending: bool,
}

impl Order {
    pub fn desc(column: &'static str) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Select {
        collection: Collection,
        filter: Filter,
        order: Option<Order>,
    },
    Insert {
        collection: Collection,
        row: Row,
    },
    Update {
        collection: Collection,
        filter: Filter,
        patch: Row,
    },
    Delete {
        collection: Collection,
        filter: Filter,
    },
}

impl Operation {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Select { collection, .. }
            | Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => *collection,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Select { .. } => "select",
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    Unauthorized,
    NotFound,
    Conflict,
    Unavailable,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("not authorized: {message}")]
    Unauthorized { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("remote store unavailable: {message}")]
    Unavailable { message: String },
    #[error("{message}")]
    Invalid { message: String },
}

impl RemoteError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::Unauthorized { .. } => RemoteErrorKind::Unauthorized,
            Self::NotFound { .. } => RemoteErrorKind::NotFound,
            Self::Conflict { .. } => RemoteErrorKind::Conflict,
            Self::Unavailable { .. } => RemoteErrorKind::Unavailable,
            Self::Invalid { .. } => RemoteErrorKind::Invalid,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unauthorized { message }
            | Self::NotFound { message }
            | Self::Conflict { message }
            | Self::Unavailable { message }
            | Self::Invalid { message } => message,
        }
    }
}

/// Request/response access to the external row store.
///
/// Every call carries the caller's credential; the store authorizes each row
/// against its owner and reports violations as [`RemoteError::Unauthorized`].
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn execute(
        &self,
        credential: &Credential,
        operation: Operation,
    ) -> Result<Vec<Row>, RemoteError>;
}

/// Decode untyped rows, turning shape mismatches into `Invalid`.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, RemoteError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|err| RemoteError::invalid(format!("malformed row from remote store: {err}")))
        })
        .collect()
}

/// Decode the single row a write returned; an empty response means the
/// filter matched nothing the caller may see.
pub fn decode_single<T: DeserializeOwned>(
    rows: Vec<Row>,
    collection: Collection,
) -> Result<T, RemoteError> {
    decode_rows(rows)?
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::not_found(format!("no matching row in `{collection}`")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn filter_builder_keeps_condition_order() {
        let filter = Filter::new()
            .eq("user_id", "u1")
            .gte("created_at", "2026-10-19T00:00:00Z")
            .lt("created_at", "2026-10-20T00:00:00Z");

        let ops: Vec<_> = filter.conditions.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![FilterOp::Eq, FilterOp::Gte, FilterOp::Lt]);
    }

    #[test]
    fn malformed_rows_decode_as_invalid() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Shape {
            id: u32,
        }

        let err = decode_rows::<Shape>(vec![json!({ "id": "nope" })]).unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Invalid);
    }

    #[test]
    fn empty_write_response_is_not_found() {
        let err = decode_single::<Value>(Vec::new(), Collection::Tasks).unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::NotFound);
    }

    #[test]
    fn invalid_message_is_verbatim() {
        let err = RemoteError::invalid("title too long");
        assert_eq!(err.to_string(), "title too long");
    }
}
