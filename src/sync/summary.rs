use color_eyre::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Result of one fetch step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome {
  pub success: bool,
  pub cached: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl FetchOutcome {
  pub fn ok(cached: usize) -> Self {
    Self {
      success: true,
      cached,
      error: None,
    }
  }

  pub fn failed(cached: usize, error: impl Into<String>) -> Self {
    Self {
      success: false,
      cached,
      error: Some(error.into()),
    }
  }
}

impl From<Result<usize>> for FetchOutcome {
  fn from(result: Result<usize>) -> Self {
    match result {
      Ok(cached) => FetchOutcome::ok(cached),
      Err(e) => FetchOutcome::failed(0, e.to_string()),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTotals {
  pub success: usize,
  pub failed: usize,
  pub total_cached: usize,
}

/// Per-step outcomes of a preload or pull, plus aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchSummary {
  pub steps: BTreeMap<String, FetchOutcome>,
  pub total: FetchTotals,
}

impl FetchSummary {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record(&mut self, step: &str, outcome: impl Into<FetchOutcome>) {
    let outcome = outcome.into();
    if outcome.success {
      self.total.success += 1;
    } else {
      self.total.failed += 1;
      warn!(
        step,
        error = outcome.error.as_deref().unwrap_or_default(),
        "Fetch step failed"
      );
    }
    self.total.total_cached += outcome.cached;

    if let Some(previous) = self.steps.insert(step.to_string(), outcome) {
      // Re-recorded step: keep totals consistent with the map
      if previous.success {
        self.total.success -= 1;
      } else {
        self.total.failed -= 1;
      }
      self.total.total_cached -= previous.cached;
    }
  }

  pub fn get(&self, step: &str) -> Option<&FetchOutcome> {
    self.steps.get(step)
  }

  pub fn is_complete_success(&self) -> bool {
    self.total.failed == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_totals_follow_steps() {
    let mut summary = FetchSummary::new();
    summary.record("projects", Ok(3));
    summary.record("users", Err(eyre!("HTTP 500")));
    summary.record("services", FetchOutcome::failed(2, "partial"));

    assert_eq!(summary.total.success, 1);
    assert_eq!(summary.total.failed, 2);
    assert_eq!(summary.total.total_cached, 5);
    assert_eq!(summary.get("users").unwrap().error.as_deref(), Some("HTTP 500"));
    assert!(!summary.is_complete_success());
  }

  #[test]
  fn test_rerecording_replaces_step() {
    let mut summary = FetchSummary::new();
    summary.record("projects", Err(eyre!("down")));
    summary.record("projects", Ok(4));

    assert_eq!(summary.steps.len(), 1);
    assert_eq!(summary.total.success, 1);
    assert_eq!(summary.total.failed, 0);
    assert_eq!(summary.total.total_cached, 4);
  }
}
