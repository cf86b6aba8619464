//! In-memory `RemoteApi` for tests.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{HttpMethod, ListParams, RemoteApi, RemoteError};

/// Canned responses keyed by endpoint, with switchable failures.
#[derive(Default)]
pub struct MockApi {
  responses: Mutex<HashMap<String, Value>>,
  write_responses: Mutex<HashMap<String, Value>>,
  failing: Mutex<HashSet<String>>,
  unreachable: Mutex<bool>,
  delay: Mutex<Option<Duration>>,
  calls: Mutex<Vec<(HttpMethod, String)>>,
  sent: Mutex<Vec<(HttpMethod, String, Value)>>,
  token: Mutex<Option<String>>,
}

impl MockApi {
  pub fn new() -> Self {
    Self::default()
  }

  /// Data returned by `GET endpoint`.
  pub fn respond(&self, endpoint: &str, data: Value) -> &Self {
    self
      .responses
      .lock()
      .unwrap()
      .insert(endpoint.to_string(), data);
    self
  }

  /// Data returned by writes to `endpoint`.
  pub fn respond_write(&self, endpoint: &str, data: Value) -> &Self {
    self
      .write_responses
      .lock()
      .unwrap()
      .insert(endpoint.to_string(), data);
    self
  }

  /// Make every call to `endpoint` fail with HTTP 500.
  pub fn fail(&self, endpoint: &str) -> &Self {
    self.failing.lock().unwrap().insert(endpoint.to_string());
    self
  }

  pub fn heal(&self, endpoint: &str) -> &Self {
    self.failing.lock().unwrap().remove(endpoint);
    self
  }

  /// Make every call fail as if the network were down.
  pub fn set_unreachable(&self, unreachable: bool) {
    *self.unreachable.lock().unwrap() = unreachable;
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<(HttpMethod, String)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, endpoint: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, e)| e == endpoint)
      .count()
  }

  pub fn sent(&self) -> Vec<(HttpMethod, String, Value)> {
    self.sent.lock().unwrap().clone()
  }

  pub fn token(&self) -> Option<String> {
    self.token.lock().unwrap().clone()
  }

  async fn before_call(&self, method: HttpMethod, endpoint: &str) -> Result<()> {
    self
      .calls
      .lock()
      .unwrap()
      .push((method, endpoint.to_string()));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if *self.unreachable.lock().unwrap() {
      return Err(RemoteError::Unreachable("connection refused".into()).into());
    }
    if self.failing.lock().unwrap().contains(endpoint) {
      return Err(
        RemoteError::Status {
          status: 500,
          message: format!("{} failed", endpoint),
        }
        .into(),
      );
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteApi for MockApi {
  async fn get(&self, endpoint: &str, _params: &ListParams) -> Result<Value> {
    self.before_call(HttpMethod::Get, endpoint).await?;
    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(endpoint)
        .cloned()
        .unwrap_or_else(|| json!([])),
    )
  }

  async fn send(&self, method: HttpMethod, endpoint: &str, payload: &Value) -> Result<Value> {
    self.before_call(method, endpoint).await?;
    self
      .sent
      .lock()
      .unwrap()
      .push((method, endpoint.to_string(), payload.clone()));
    Ok(
      self
        .write_responses
        .lock()
        .unwrap()
        .get(endpoint)
        .cloned()
        .unwrap_or(Value::Null),
    )
  }

  fn set_token(&self, token: Option<String>) {
    *self.token.lock().unwrap() = token;
  }
}
