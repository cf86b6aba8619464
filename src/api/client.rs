use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::debug;
use url::Url;

use super::{ApiEnvelope, HttpMethod, ListParams, RemoteApi, RemoteError};
use crate::config::Config;

/// HTTP client for the console's REST API
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid API url {}: {}", config.api.url, e))?;

    // Timeouts are left to reqwest's defaults
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      token: Arc::new(RwLock::new(Config::get_api_token())),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  /// Whether the server answers at all. Any HTTP status counts as reachable.
  pub async fn is_reachable(&self) -> bool {
    self.http.head(self.base.clone()).send().await.is_ok()
  }

  fn url_for(&self, endpoint: &str, params: &ListParams) -> Result<Url> {
    let raw = format!("{}{}", self.base.as_str().trim_end_matches('/'), endpoint);
    let mut url = Url::parse(&raw).map_err(|e| eyre!("Invalid endpoint {}: {}", endpoint, e))?;

    if !params.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (key, value) in params.iter() {
        pairs.append_pair(key, value);
      }
    }

    Ok(url)
  }

  fn token(&self) -> Option<String> {
    self.token.read().ok().and_then(|t| t.clone())
  }

  async fn request(
    &self,
    method: HttpMethod,
    endpoint: &str,
    params: &ListParams,
    body: Option<&Value>,
  ) -> Result<Value> {
    let url = self.url_for(endpoint, params)?;
    debug!(method = method.as_str(), %url, "API request");

    let mut request = self.http.request(method.into(), url);
    if let Some(token) = self.token() {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body.filter(|b| !b.is_null()) {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

    if !status.is_success() {
      let message = serde_json::from_str::<ApiEnvelope>(&text)
        .ok()
        .and_then(|envelope| envelope.message)
        .unwrap_or(text);
      return Err(
        RemoteError::Status {
          status: status.as_u16(),
          message,
        }
        .into(),
      );
    }

    // 204 and friends
    if text.trim().is_empty() {
      return Ok(Value::Null);
    }

    let envelope: ApiEnvelope =
      serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

    Ok(envelope.into_data()?)
  }
}

#[async_trait]
impl RemoteApi for ApiClient {
  async fn get(&self, endpoint: &str, params: &ListParams) -> Result<Value> {
    self.request(HttpMethod::Get, endpoint, params, None).await
  }

  async fn send(&self, method: HttpMethod, endpoint: &str, payload: &Value) -> Result<Value> {
    self
      .request(method, endpoint, &ListParams::new(), Some(payload))
      .await
  }

  fn set_token(&self, token: Option<String>) {
    if let Ok(mut current) = self.token.write() {
      *current = token;
    }
  }
}
