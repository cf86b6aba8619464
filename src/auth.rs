//! Offline authentication.
//!
//! A successful online login leaves a salted SHA-256 digest of the password,
//! the issued token and the user profile behind, so the same credentials can
//! be verified later without a network round trip.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::types::LoginResponse;
use crate::api::{endpoints, is_unreachable, HttpMethod, RemoteApi};
use crate::connectivity::ConnectivityMonitor;
use crate::store::LocalStore;

pub const INVALID_CREDENTIALS: &str = "Invalid credentials";
pub const NO_OFFLINE_CREDENTIALS: &str =
  "No offline credentials found for this email. Please log in online first.";

const SALT_LEN: usize = 16;

/// Row of the `auth_cache` table.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEntry {
  pub email: String,
  /// Hex SHA-256 of `salt || password`
  pub password_hash: String,
  pub salt: String,
  pub token: String,
  pub user_data: Value,
  pub last_login_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
  pub token: String,
  pub user: Value,
  /// Established from the local cache rather than the server
  pub offline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub session: Option<Session>,
}

impl AuthOutcome {
  fn granted(session: Session) -> Self {
    Self {
      success: true,
      message: None,
      session: Some(session),
    }
  }

  fn denied(message: impl Into<String>) -> Self {
    Self {
      success: false,
      message: Some(message.into()),
      session: None,
    }
  }
}

/// Credential digests of users who logged in online on this device.
#[derive(Clone)]
pub struct OfflineAuthCache {
  store: Arc<dyn LocalStore>,
}

impl OfflineAuthCache {
  pub fn new(store: Arc<dyn LocalStore>) -> Self {
    Self { store }
  }

  /// Remember credentials after a successful online login. Overwrites any
  /// previous entry for the email.
  pub fn cache(&self, email: &str, password: &str, token: &str, user_data: Value) -> Result<()> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex::encode(salt);

    let entry = AuthEntry {
      email: normalize_email(email),
      password_hash: digest(&salt, password),
      salt,
      token: token.to_string(),
      user_data,
      last_login_at: Utc::now(),
    };

    self.store.put_auth(&entry)?;
    info!(email = %entry.email, "Cached offline credentials");
    Ok(())
  }

  pub fn verify(&self, email: &str, password: &str) -> Result<AuthOutcome> {
    let Some(entry) = self.store.get_auth(&normalize_email(email))? else {
      return Ok(AuthOutcome::denied(NO_OFFLINE_CREDENTIALS));
    };

    let candidate = digest(&entry.salt, password);
    if !constant_time_eq(candidate.as_bytes(), entry.password_hash.as_bytes()) {
      warn!(email = %entry.email, "Offline login rejected");
      return Ok(AuthOutcome::denied(INVALID_CREDENTIALS));
    }

    Ok(AuthOutcome::granted(Session {
      token: entry.token,
      user: entry.user_data,
      offline: true,
    }))
  }

  pub fn is_available(&self, email: &str) -> Result<bool> {
    Ok(self.store.get_auth(&normalize_email(email))?.is_some())
  }

  /// Forget one email, or every cached credential when `email` is `None`.
  pub fn clear(&self, email: Option<&str>) -> Result<()> {
    match email {
      Some(email) => {
        self.store.delete_auth(&normalize_email(email))?;
      }
      None => self.store.clear_auth()?,
    }
    Ok(())
  }
}

/// Online-first login with fallback to the offline cache.
pub struct Authenticator {
  api: Arc<dyn RemoteApi>,
  cache: OfflineAuthCache,
  monitor: ConnectivityMonitor,
}

impl Authenticator {
  pub fn new(api: Arc<dyn RemoteApi>, cache: OfflineAuthCache, monitor: ConnectivityMonitor) -> Self {
    Self {
      api,
      cache,
      monitor,
    }
  }

  pub fn cache(&self) -> &OfflineAuthCache {
    &self.cache
  }

  pub async fn login(&self, email: &str, password: &str) -> Result<AuthOutcome> {
    if !self.monitor.is_online() {
      return self.login_offline(email, password);
    }

    let body = json!({ "email": email.trim(), "password": password });
    let response = match self.api.send(HttpMethod::Post, endpoints::AUTH_LOGIN, &body).await {
      Ok(response) => response,
      Err(e) if is_unreachable(&e) => {
        warn!("Login server unreachable, falling back to offline credentials: {}", e);
        return self.login_offline(email, password);
      }
      Err(e) => return Ok(AuthOutcome::denied(e.to_string())),
    };

    let login: LoginResponse = serde_json::from_value(response)
      .map_err(|e| eyre!("Failed to parse login response: {}", e))?;

    if let Err(e) = self.cache.cache(email, password, &login.token, login.user.clone()) {
      // Online login still succeeds without offline capability
      warn!("Failed to cache offline credentials: {}", e);
    }

    self.api.set_token(Some(login.token.clone()));
    info!(email = %normalize_email(email), "Logged in online");

    Ok(AuthOutcome::granted(Session {
      token: login.token,
      user: login.user,
      offline: false,
    }))
  }

  pub fn logout(&self) {
    self.api.set_token(None);
  }

  fn login_offline(&self, email: &str, password: &str) -> Result<AuthOutcome> {
    let outcome = self.cache.verify(email, password)?;
    if let Some(session) = &outcome.session {
      self.api.set_token(Some(session.token.clone()));
      info!(email = %normalize_email(email), "Logged in with offline credentials");
    }
    Ok(outcome)
  }
}

fn normalize_email(email: &str) -> String {
  email.trim().to_lowercase()
}

fn digest(salt: &str, password: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(salt.as_bytes());
  hasher.update(password.as_bytes());
  hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  if a.len() != b.len() {
    return false;
  }
  a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
