//! Platform signals and inter-context messages.
//!
//! Browser events (connectivity transitions, install prompt, page load) are
//! delivered as named events over a channel so the page controller's state
//! machine can be driven by synthetic events in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Page-context platform events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
  /// Initial page load; triggers the first sync attempt.
  Loaded,
  /// Connectivity became available.
  Online,
  /// Connectivity was lost.
  Offline,
  /// Explicit sync trigger from the application.
  SyncRequested,
  /// The platform offered an install prompt.
  InstallPromptAvailable,
  /// The user accepted the install prompt.
  InstallAccepted,
  /// The user dismissed the install prompt.
  InstallDismissed,
  /// The platform reports the app was installed.
  AppInstalled,
}

/// One-way advisory message from the page context to the worker context.
/// No acknowledgment is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
  SyncNow,
}

/// Channel for page-to-worker messages.
pub fn worker_channel() -> (
  mpsc::UnboundedSender<WorkerMessage>,
  mpsc::UnboundedReceiver<WorkerMessage>,
) {
  mpsc::unbounded_channel()
}

/// Receiving half of the platform event stream.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<PageEvent>,
}

/// Injects platform events. The real host wires browser callbacks to this;
/// tests send events directly.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<PageEvent>,
}

impl EventHandler {
  pub fn new() -> (EventSender, EventHandler) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventHandler { rx })
  }

  /// Receive the next event. Returns None once every sender is gone.
  pub async fn next(&mut self) -> Option<PageEvent> {
    self.rx.recv().await
  }
}

impl EventSender {
  pub fn send(&self, event: PageEvent) {
    // A closed receiver means the page is being torn down.
    let _ = self.tx.send(event);
  }
}

/// Process-wide connectivity flag, written on online/offline transitions and
/// observed by the sync queue manager. Not persisted.
#[derive(Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
  pub fn new(online: bool) -> Self {
    Self(Arc::new(AtomicBool::new(online)))
  }

  pub fn is_online(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  pub fn set_online(&self, online: bool) {
    self.0.store(online, Ordering::SeqCst);
  }
}
