//! Page-context controller: platform event dispatch and install-prompt state.
//!
//! Owns the process-wide mutable state the page glue used to keep in
//! freestanding globals: the install-prompt reference and the
//! installed-state flag, both with explicit transitions.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::event::{Connectivity, EventHandler, PageEvent};
use crate::net::SyncTransport;
use crate::notify::{Notifier, Severity};
use crate::queue::{QueueStore, SyncQueueManager};

/// Install prompt lifecycle. The platform hands the prompt over at most
/// once per page; prompting or dismissing consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
  Unavailable,
  Available,
  Consumed,
}

/// Whether the app runs installed (standalone). Detected once at startup;
/// an install event during the session upgrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledState {
  Unknown,
  Installed,
  NotInstalled,
}

/// Don't re-offer the install prompt within this window after a dismissal.
const DISMISS_COOLDOWN_HOURS: i64 = 24;

/// Drives the page half of the offline layer from platform events.
pub struct PageController<Q: QueueStore, T: SyncTransport, N: Notifier> {
  manager: Arc<SyncQueueManager<Q, T, N>>,
  notifier: N,
  connectivity: Connectivity,
  prompt: PromptState,
  installed: InstalledState,
  dismissed_at: Option<DateTime<Utc>>,
}

impl<Q: QueueStore, T: SyncTransport, N: Notifier> PageController<Q, T, N> {
  pub fn new(
    manager: Arc<SyncQueueManager<Q, T, N>>,
    notifier: N,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      manager,
      notifier,
      connectivity,
      prompt: PromptState::Unavailable,
      installed: InstalledState::Unknown,
      dismissed_at: None,
    }
  }

  /// One-time startup detection from the platform's standalone flag.
  /// Later detections are ignored; only an install event can change the
  /// state afterwards.
  pub fn detect_installed(&mut self, standalone: bool) {
    if self.installed == InstalledState::Unknown {
      self.installed = if standalone {
        InstalledState::Installed
      } else {
        InstalledState::NotInstalled
      };
    }
  }

  pub fn installed_state(&self) -> InstalledState {
    self.installed
  }

  pub fn prompt_state(&self) -> PromptState {
    self.prompt
  }

  /// Whether the install prompt should be shown right now: it must be
  /// available, the app not installed, and no dismissal within the
  /// cooldown window.
  pub fn should_offer_install(&self) -> bool {
    if self.installed == InstalledState::Installed {
      return false;
    }
    if self.prompt != PromptState::Available {
      return false;
    }
    match self.dismissed_at {
      Some(at) => Utc::now() - at >= Duration::hours(DISMISS_COOLDOWN_HOURS),
      None => true,
    }
  }

  /// Buffer a user operation; delegates to the sync queue manager. Returns
  /// as soon as the operation is durable, without waiting on the sync
  /// attempt it triggers.
  pub fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<i64>
  where
    Q: 'static,
    T: 'static,
    N: 'static,
  {
    self.manager.enqueue(kind, payload)
  }

  /// Dispatch loop. Ends when every event sender is gone.
  pub async fn run(&mut self, mut events: EventHandler) -> Result<()> {
    while let Some(event) = events.next().await {
      self.handle_event(event).await?;
    }
    Ok(())
  }

  /// Single handler per event type.
  pub async fn handle_event(&mut self, event: PageEvent) -> Result<()> {
    match event {
      PageEvent::Loaded => {
        self.manager.try_sync().await?;
      }
      PageEvent::Online => {
        self.connectivity.set_online(true);
        self.manager.try_sync().await?;
      }
      PageEvent::Offline => {
        self.connectivity.set_online(false);
        self.notifier.notify("You are offline.", Severity::Error);
      }
      PageEvent::SyncRequested => {
        self.manager.try_sync().await?;
      }
      PageEvent::InstallPromptAvailable => {
        self.prompt = PromptState::Available;
      }
      PageEvent::InstallAccepted => {
        self.prompt = PromptState::Consumed;
        self.installed = InstalledState::Installed;
      }
      PageEvent::InstallDismissed => {
        self.prompt = PromptState::Consumed;
        self.dismissed_at = Some(Utc::now());
        debug!("install prompt dismissed");
      }
      PageEvent::AppInstalled => {
        self.prompt = PromptState::Consumed;
        self.installed = InstalledState::Installed;
      }
    }
    Ok(())
  }
}
