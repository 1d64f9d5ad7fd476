//! User-facing status notifications.
//!
//! The toast presenter lives outside this core; it is modeled as a
//! fire-and-forget collaborator. Every sync attempt surfaces exactly one
//! status message through it.

use tracing::{info, warn};

/// Visual treatment of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Info,
  Success,
  Error,
}

/// Notification collaborator. No return value is consumed.
pub trait Notifier: Send + Sync {
  fn notify(&self, message: &str, severity: Severity);
}

impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
  fn notify(&self, message: &str, severity: Severity) {
    (**self).notify(message, severity);
  }
}

/// Default presenter for hosts without a UI: routes messages to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, message: &str, severity: Severity) {
    match severity {
      Severity::Error => warn!("{}", message),
      Severity::Info | Severity::Success => info!("{}", message),
    }
  }
}
