//! PostgREST gateway.
//!
//! Speaks the Supabase flavour of PostgREST: one resource per table under
//! `{url}/rest/v1/`, filters as `column=op.value` query pairs and the caller's
//! access token as a bearer credential.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::application::auth::Credential;
use crate::application::gateway::{
    Collection, Filter, Operation, Order, RemoteError, RemoteGateway, Row,
};
use crate::config::RemoteSettings;

use super::error::InfraError;

const REST_PREFIX: &str = "rest/v1/";
const RETURN_REPRESENTATION: &str = "return=representation";
const NO_ROWS_CODE: &str = "PGRST116";

#[derive(Clone, Debug)]
pub struct RestGateway {
    client: Client,
    base: Url,
    anon_key: Option<String>,
}

impl RestGateway {
    pub fn new(
        url: &Url,
        anon_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let root = format!("{}/", url.as_str().trim_end_matches('/'));
        let base = Url::parse(&root)
            .and_then(|root| root.join(REST_PREFIX))
            .map_err(|err| InfraError::configuration(format!("invalid remote url `{url}`: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(InfraError::configuration(format!(
                "remote url `{url}` cannot carry a path"
            )));
        }

        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(request_timeout)
            .build()
            .map_err(InfraError::HttpClient)?;

        Ok(Self {
            client,
            base,
            anon_key,
        })
    }

    pub fn from_settings(settings: &RemoteSettings) -> Result<Self, InfraError> {
        let url = settings.url.as_ref().ok_or_else(|| {
            InfraError::configuration("remote.url is required (use --remote-url or DAYBOOK_REMOTE__URL)")
        })?;
        Self::new(url, settings.anon_key.clone(), settings.request_timeout)
    }

    pub fn user_agent() -> &'static str {
        concat!("daybook/", env!("CARGO_PKG_VERSION"))
    }

    /// Resource URL of `collection` with the operation's query string applied.
    pub fn url(&self, operation: &Operation) -> Result<Url, RemoteError> {
        let mut url = self
            .base
            .join(operation.collection().table())
            .map_err(|err| RemoteError::invalid(format!("invalid resource url: {err}")))?;

        let (filter, order) = match operation {
            Operation::Select { filter, order, .. } => (Some(filter), *order),
            Operation::Update { filter, .. } | Operation::Delete { filter, .. } => {
                (Some(filter), None)
            }
            Operation::Insert { .. } => (None, None),
        };

        {
            let mut pairs = url.query_pairs_mut();
            if matches!(operation, Operation::Select { .. }) {
                pairs.append_pair("select", "*");
            }
            if let Some(filter) = filter {
                for (column, value) in filter_pairs(filter) {
                    pairs.append_pair(column, &value);
                }
            }
            if let Some(order) = order {
                pairs.append_pair("order", &order_value(order));
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url)
    }

    fn request(&self, credential: &Credential, method: Method, url: Url) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&credential.access_token);
        if let Some(key) = self.anon_key.as_deref() {
            request = request.header("apikey", key);
        }
        request
    }
}

#[async_trait]
impl RemoteGateway for RestGateway {
    async fn execute(
        &self,
        credential: &Credential,
        operation: Operation,
    ) -> Result<Vec<Row>, RemoteError> {
        let url = self.url(&operation)?;
        let collection = operation.collection();
        let verb = operation.verb();

        let request = match operation {
            Operation::Select { .. } => self.request(credential, Method::GET, url),
            Operation::Insert { row, .. } => self
                .request(credential, Method::POST, url)
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&row),
            Operation::Update { patch, .. } => self
                .request(credential, Method::PATCH, url)
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&patch),
            Operation::Delete { .. } => self
                .request(credential, Method::DELETE, url)
                .header("Prefer", RETURN_REPRESENTATION),
        };

        let started = Instant::now();
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(
            table = %collection,
            verb,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Remote call finished"
        );

        let result = handle(response, collection).await;
        if let Err(err) = &result {
            warn!(table = %collection, verb, error = %err, "Remote call failed");
        }
        result
    }
}

async fn handle(response: Response, collection: Collection) -> Result<Vec<Row>, RemoteError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(transport_error)?;

    if !status.is_success() {
        let body = ErrorBody::parse(&bytes);
        return Err(status_error(status, body, collection));
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(rows)) => Ok(rows),
        Ok(Value::Object(row)) => Ok(vec![Value::Object(row)]),
        Ok(other) => Err(RemoteError::invalid(format!(
            "unexpected response body from `{collection}`: {other}"
        ))),
        Err(err) => Err(RemoteError::invalid(format!(
            "undecodable response body from `{collection}`: {err}"
        ))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn parse(bytes: &[u8]) -> (Self, String) {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let body = serde_json::from_slice(bytes).unwrap_or_default();
        (body, text)
    }
}

fn status_error(status: StatusCode, (body, text): (ErrorBody, String), collection: Collection) -> RemoteError {
    let message = body
        .message
        .clone()
        .unwrap_or_else(|| if text.trim().is_empty() { status.to_string() } else { text });

    if body.code.as_deref() == Some(NO_ROWS_CODE) || status == StatusCode::NOT_FOUND {
        return RemoteError::not_found(format!("`{collection}`: {message}"));
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::unauthorized(message),
        StatusCode::CONFLICT => RemoteError::conflict(message),
        status if status.is_client_error() => RemoteError::invalid(message),
        _ => RemoteError::unavailable(format!("status {status}: {message}")),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_builder() {
        return RemoteError::invalid(format!("malformed request: {err}"));
    }
    if err.is_decode() {
        return RemoteError::invalid(format!("undecodable response: {err}"));
    }
    RemoteError::unavailable(err.to_string())
}

fn filter_pairs(filter: &Filter) -> Vec<(&'static str, String)> {
    filter
        .conditions
        .iter()
        .map(|condition| {
            let value = match &condition.value {
                Value::Array(items) => {
                    let items: Vec<_> = items.iter().map(scalar).collect();
                    format!("({})", items.join(","))
                }
                other => scalar(other),
            };
            (condition.column, format!("{}.{}", condition.op.as_str(), value))
        })
        .collect()
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn order_value(order: Order) -> String {
    let direction = if order.ascending { "asc" } else { "desc" };
    format!("{}.{direction}", order.column)
}
