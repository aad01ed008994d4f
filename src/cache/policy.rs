//! Consecutive-failure tracking for cache storage.
//!
//! Caching starts enabled. Every failed cache operation bumps a counter and
//! every successful one resets it; once the counter reaches the threshold
//! caching is switched off until [`CacheFailurePolicy::reenable`] is called.
//! There is no automatic recovery.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::error::{CacheResult, FailureKind};

/// Default number of consecutive failures tolerated before disabling.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Severity of a [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
  Info,
  Warning,
  Error,
}

/// User-facing advisory emitted by the cache layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
  pub level: NoticeLevel,
  pub message: String,
}

/// Policy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
  Enabled,
  Disabled,
}

/// Counter owned by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
  pub consecutive_failures: u32,
  pub enabled: bool,
}

impl Default for FailureCounter {
  fn default() -> Self {
    Self {
      consecutive_failures: 0,
      enabled: true,
    }
  }
}

pub struct CacheFailurePolicy {
  counter: FailureCounter,
  max_failures: u32,
  notices: Option<UnboundedSender<Notice>>,
}

impl Default for CacheFailurePolicy {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_FAILURES)
  }
}

impl CacheFailurePolicy {
  pub fn new(max_failures: u32) -> Self {
    Self {
      counter: FailureCounter::default(),
      max_failures: max_failures.max(1),
      notices: None,
    }
  }

  /// Send notices to `tx` as well as to the log.
  pub fn with_notices(mut self, tx: UnboundedSender<Notice>) -> Self {
    self.notices = Some(tx);
    self
  }

  pub fn state(&self) -> PolicyState {
    if self.counter.enabled {
      PolicyState::Enabled
    } else {
      PolicyState::Disabled
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.counter.enabled
  }

  pub fn counter(&self) -> FailureCounter {
    self.counter
  }

  pub fn max_failures(&self) -> u32 {
    self.max_failures
  }

  /// A cache operation succeeded. Does not re-enable a disabled policy.
  pub fn on_success(&mut self) {
    self.counter.consecutive_failures = 0;
  }

  /// A cache operation failed with `kind`.
  ///
  /// On [`FailureKind::QuotaExceeded`] `purge` runs once to free space
  /// before the failure is counted.
  pub fn on_failure<F>(&mut self, kind: FailureKind, purge: F) -> PolicyState
  where
    F: FnOnce() -> CacheResult<()>,
  {
    self.counter.consecutive_failures += 1;
    warn!(
      ?kind,
      consecutive_failures = self.counter.consecutive_failures,
      max_failures = self.max_failures,
      "cache operation failed"
    );

    if kind == FailureKind::QuotaExceeded {
      match purge() {
        Ok(()) => self.notify(
          NoticeLevel::Warning,
          "Storage is full; the local cache was cleared. Data will be reloaded from the server.",
        ),
        Err(e) => self.notify(
          NoticeLevel::Error,
          format!("Storage is full and the local cache could not be cleared: {}", e),
        ),
      }
    }

    if self.counter.enabled && self.counter.consecutive_failures >= self.max_failures {
      self.counter.enabled = false;
      self.notify(
        NoticeLevel::Warning,
        format!(
          "Caching disabled after {} consecutive failures; data will load directly from the server.",
          self.counter.consecutive_failures
        ),
      );
    }

    self.state()
  }

  /// Explicit user action: turn caching back on and forget past failures.
  pub fn reenable(&mut self) {
    let was_disabled = !self.counter.enabled;
    self.counter = FailureCounter::default();
    if was_disabled {
      self.notify(NoticeLevel::Info, "Caching re-enabled.");
    }
  }

  fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
    let message = message.into();
    match level {
      NoticeLevel::Info => info!(%message, "cache notice"),
      NoticeLevel::Warning | NoticeLevel::Error => warn!(%message, "cache notice"),
    }
    if let Some(tx) = &self.notices {
      // A closed channel only means nobody is listening any more.
      let _ = tx.send(Notice { level, message });
    }
  }
}
