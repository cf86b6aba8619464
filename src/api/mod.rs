//! Remote REST API consumed by the offline layer.
//!
//! Every endpoint answers with `{ success, data?, message? }`. The engine only
//! depends on the [`RemoteApi`] trait; [`ApiClient`] is the HTTP implementation.

mod cache;
mod client;
pub mod endpoints;
#[cfg(test)]
pub mod mock;
pub mod types;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::store::{strip_offline_fields, Cacheable};

pub use client::ApiClient;

/// HTTP verb carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Patch => "PATCH",
      HttpMethod::Delete => "DELETE",
    }
  }
}

impl FromStr for HttpMethod {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(HttpMethod::Get),
      "POST" => Ok(HttpMethod::Post),
      "PUT" => Ok(HttpMethod::Put),
      "PATCH" => Ok(HttpMethod::Patch),
      "DELETE" => Ok(HttpMethod::Delete),
      other => Err(eyre!("Unsupported HTTP method '{}'", other)),
    }
  }
}

impl From<HttpMethod> for reqwest::Method {
  fn from(method: HttpMethod) -> Self {
    match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Why a remote call failed.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
  /// No HTTP response at all (DNS, refused connection, timeout)
  #[error("Server unreachable: {0}")]
  Unreachable(String),
  #[error("HTTP {status}: {message}")]
  Status { status: u16, message: String },
  /// `success: false` envelope
  #[error("{0}")]
  Rejected(String),
  #[error("Invalid response: {0}")]
  InvalidResponse(String),
}

/// Whether an error means the server could not be reached at all.
pub fn is_unreachable(err: &color_eyre::Report) -> bool {
  matches!(
    err.downcast_ref::<RemoteError>(),
    Some(RemoteError::Unreachable(_))
  )
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
  pub success: bool,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub message: Option<String>,
}

impl ApiEnvelope {
  pub fn into_data(self) -> std::result::Result<Value, RemoteError> {
    if self.success {
      Ok(self.data.unwrap_or(Value::Null))
    } else {
      Err(RemoteError::Rejected(
        self
          .message
          .unwrap_or_else(|| "Request rejected by server".to_string()),
      ))
    }
  }
}

/// Equality filters for list endpoints, sent as query parameters online and
/// applied to stored documents offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListParams(BTreeMap<String, String>);

impl ListParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: &str, value: impl ToString) -> Self {
    self.0.insert(key.to_string(), value.to_string());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
    self.0.iter()
  }

  /// Whether a document satisfies every filter.
  pub fn matches(&self, document: &Value) -> bool {
    self.0.iter().all(|(key, expected)| match document.get(key) {
      Some(Value::String(s)) => s == expected,
      Some(Value::Number(n)) => n.to_string() == *expected,
      Some(Value::Bool(b)) => b.to_string() == *expected,
      _ => false,
    })
  }
}

/// The remote collaborator, reduced to what the offline layer needs.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// GET `endpoint` and return the envelope's `data`.
  async fn get(&self, endpoint: &str, params: &ListParams) -> Result<Value>;

  /// Send a write and return the envelope's `data` (`Null` when absent).
  async fn send(&self, method: HttpMethod, endpoint: &str, payload: &Value) -> Result<Value>;

  /// Install or clear the session token used for later requests.
  fn set_token(&self, token: Option<String>);
}

/// Decode a `data` payload that should hold a list of `T`.
/// A single object is accepted as a one-element list.
pub fn decode_list<T: Cacheable>(data: Value) -> Result<Vec<T>> {
  decode_items(data, T::table().name())
}

/// Same as `decode_list` for types that are not stored as-is.
pub fn decode_items<T: DeserializeOwned>(data: Value, what: &str) -> Result<Vec<T>> {
  let items = match data {
    Value::Array(items) => items,
    Value::Null => Vec::new(),
    single @ Value::Object(_) => vec![single],
    other => return Err(eyre!("Expected a list of {} but got {}", what, other)),
  };

  items
    .into_iter()
    .map(|mut item| {
      strip_offline_fields(&mut item);
      serde_json::from_value(item).map_err(|e| eyre!("Failed to parse {}: {}", what, e))
    })
    .collect()
}

/// GET a list endpoint and decode it.
pub async fn fetch_list<T: Cacheable>(
  api: &dyn RemoteApi,
  endpoint: &str,
  params: &ListParams,
) -> Result<Vec<T>> {
  let data = api.get(endpoint, params).await?;
  decode_list(data)
}

/// GET a single-entity endpoint and decode it.
pub async fn fetch_one<T: Cacheable>(api: &dyn RemoteApi, endpoint: &str) -> Result<T> {
  let mut data = api.get(endpoint, &ListParams::new()).await?;
  strip_offline_fields(&mut data);
  serde_json::from_value(data).map_err(|e| eyre!("Failed to parse {}: {}", T::table(), e))
}
