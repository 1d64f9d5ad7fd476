//! Sync queue manager: durable buffering and at-least-once batch replay.
//!
//! Runs in the page context. Operations that cannot be confirmed against the
//! server are appended to the durable store and replayed as one ordered batch
//! whenever connectivity allows. Retry semantics are all-or-nothing per
//! attempt: the remote side applies the batch transactionally or rejects it
//! wholesale, so a failed attempt leaves the store untouched.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{Connectivity, WorkerMessage};
use crate::net::{SyncBatch, SyncTransport};
use crate::notify::{Notifier, Severity};

use super::store::{Operation, QueueStore};

/// Result of a single sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Connectivity known unavailable; nothing attempted.
  Offline,
  /// Another attempt is in flight; this trigger was dropped as redundant.
  AlreadyRunning,
  /// Queue was empty; no network call issued.
  Clean,
  /// Batch acknowledged and removed from the store.
  Synced(usize),
  /// Transport or remote failure; queue preserved for a later retry.
  Failed,
}

/// The page-context half of the offline layer.
pub struct SyncQueueManager<Q: QueueStore, T: SyncTransport, N: Notifier> {
  store: Q,
  transport: T,
  notifier: N,
  connectivity: Connectivity,
  worker: mpsc::UnboundedSender<WorkerMessage>,
  // Serializes try_sync so concurrent triggers cannot race on
  // read-then-remove and double-submit the batch.
  in_flight: tokio::sync::Mutex<()>,
}

impl<Q: QueueStore, T: SyncTransport, N: Notifier> SyncQueueManager<Q, T, N> {
  pub fn new(
    store: Q,
    transport: T,
    notifier: N,
    connectivity: Connectivity,
    worker: mpsc::UnboundedSender<WorkerMessage>,
  ) -> Self {
    Self {
      store,
      transport,
      notifier,
      connectivity,
      worker,
      in_flight: tokio::sync::Mutex::new(()),
    }
  }

  /// Buffer an operation durably, then kick off a sync attempt. The caller
  /// waits only for the append: a storage failure propagates, while the
  /// sync attempt runs detached and reports through the notifier.
  pub fn enqueue(self: &Arc<Self>, kind: &str, payload: serde_json::Value) -> Result<i64>
  where
    Q: 'static,
    T: 'static,
    N: 'static,
  {
    let operation = Operation {
      kind: kind.to_string(),
      payload,
      queued_at: Utc::now().timestamp_millis(),
    };

    let id = self.store.append(&operation)?;
    debug!(id, kind, "operation queued");

    let manager = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(err) = manager.try_sync().await {
        warn!("sync attempt after enqueue failed: {}", err);
      }
    });

    Ok(id)
  }

  /// Replay the entire queue as one batch, if connectivity allows and no
  /// other attempt is in flight. On acknowledgment, exactly the submitted
  /// ids are removed and the worker is told to refresh; on failure the
  /// store is left untouched.
  pub async fn try_sync(&self) -> Result<SyncOutcome> {
    let _guard = match self.in_flight.try_lock() {
      Ok(guard) => guard,
      Err(_) => return Ok(SyncOutcome::AlreadyRunning),
    };

    if !self.connectivity.is_online() {
      return Ok(SyncOutcome::Offline);
    }

    let queued = self.store.read_all()?;
    if queued.is_empty() {
      return Ok(SyncOutcome::Clean);
    }

    self
      .notifier
      .notify("Syncing queued operations...", Severity::Info);

    let batch = SyncBatch {
      operations: queued.iter().map(|q| q.operation.clone()).collect(),
    };

    match self.transport.submit(&batch).await {
      Ok(()) => {
        let ids: Vec<i64> = queued.iter().map(|q| q.id).collect();
        self.store.remove(&ids)?;

        // Advisory only; a torn-down worker is not an error.
        let _ = self.worker.send(WorkerMessage::SyncNow);

        self
          .notifier
          .notify("Back online. Queued changes synced.", Severity::Success);
        info!(count = ids.len(), "sync batch acknowledged");
        Ok(SyncOutcome::Synced(ids.len()))
      }
      Err(err) => {
        warn!("sync attempt failed: {}", err);
        self
          .notifier
          .notify("Sync failed. Changes kept for retry.", Severity::Error);
        Ok(SyncOutcome::Failed)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::worker_channel;
  use crate::notify::testing::RecordingNotifier;
  use crate::queue::store::SqliteQueueStore;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::{Arc, Mutex};

  /// Scripted transport: records every submitted batch, optionally failing.
  #[derive(Default)]
  struct FakeTransport {
    fail: AtomicBool,
    batches: Mutex<Vec<serde_json::Value>>,
  }

  impl FakeTransport {
    fn submissions(&self) -> usize {
      self.batches.lock().unwrap().len()
    }
  }

  impl SyncTransport for Arc<FakeTransport> {
    async fn submit(&self, batch: &SyncBatch) -> Result<()> {
      self
        .batches
        .lock()
        .unwrap()
        .push(serde_json::to_value(batch).unwrap());
      if self.fail.load(Ordering::SeqCst) {
        return Err(eyre!("sync endpoint returned 500"));
      }
      Ok(())
    }
  }

  fn manager(
    transport: Arc<FakeTransport>,
    notifier: Arc<RecordingNotifier>,
    online: bool,
  ) -> (
    Arc<SyncQueueManager<SqliteQueueStore, Arc<FakeTransport>, Arc<RecordingNotifier>>>,
    Connectivity,
    mpsc::UnboundedReceiver<WorkerMessage>,
  ) {
    let connectivity = Connectivity::new(online);
    let (tx, rx) = worker_channel();
    let manager = Arc::new(SyncQueueManager::new(
      SqliteQueueStore::open_in_memory().unwrap(),
      transport,
      notifier,
      connectivity.clone(),
      tx,
    ));
    (manager, connectivity, rx)
  }

  #[tokio::test]
  async fn test_offline_enqueues_accumulate_in_order() {
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, _connectivity, _rx) = manager(Arc::clone(&transport), notifier, false);

    for qty in 1..=3 {
      manager
        .enqueue("sale", json!({"sku": "A1", "qty": qty}))
        .unwrap();
    }

    let queued = manager.store.read_all().unwrap();
    assert_eq!(queued.len(), 3);
    assert_eq!(queued[0].operation.payload["qty"], 1);
    assert_eq!(queued[2].operation.payload["qty"], 3);
    // Offline the whole time: nothing was ever submitted.
    assert_eq!(transport.submissions(), 0);
  }

  #[tokio::test]
  async fn test_empty_queue_sync_is_idempotent_noop() {
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, _connectivity, _rx) =
      manager(Arc::clone(&transport), Arc::clone(&notifier), true);

    for _ in 0..3 {
      assert_eq!(manager.try_sync().await.unwrap(), SyncOutcome::Clean);
    }
    assert_eq!(transport.submissions(), 0);
    assert!(notifier.messages.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_sync_leaves_store_untouched() {
    let transport = Arc::new(FakeTransport::default());
    transport.fail.store(true, Ordering::SeqCst);
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, connectivity, _rx) =
      manager(Arc::clone(&transport), Arc::clone(&notifier), false);

    manager.enqueue("sale", json!({"sku": "A1"})).unwrap();
    manager.enqueue("sale", json!({"sku": "B2"})).unwrap();
    let before = manager.store.read_all().unwrap();

    connectivity.set_online(true);
    assert_eq!(manager.try_sync().await.unwrap(), SyncOutcome::Failed);
    assert_eq!(manager.store.read_all().unwrap(), before);
    assert_eq!(
      notifier.severities().last(),
      Some(&Severity::Error)
    );
  }

  #[tokio::test]
  async fn test_offline_sale_round_trip() {
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, connectivity, mut worker_rx) =
      manager(Arc::clone(&transport), Arc::clone(&notifier), false);

    manager
      .enqueue("sale", json!({"sku": "A1", "qty": 2}))
      .unwrap();
    assert_eq!(manager.store.read_all().unwrap().len(), 1);

    // Connectivity returns.
    connectivity.set_online(true);
    assert_eq!(manager.try_sync().await.unwrap(), SyncOutcome::Synced(1));

    // Exactly one POST carrying the full operation record.
    let batches = transport.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let operations = batches[0]["operations"].as_array().unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0]["type"], "sale");
    assert_eq!(operations[0]["payload"], json!({"sku": "A1", "qty": 2}));
    assert!(operations[0]["queued_at"].is_i64());
    drop(batches);

    // Store emptied, worker told to refresh, success surfaced.
    assert!(manager.store.read_all().unwrap().is_empty());
    assert_eq!(worker_rx.try_recv().unwrap(), WorkerMessage::SyncNow);
    assert_eq!(
      notifier.severities(),
      vec![Severity::Info, Severity::Success]
    );
  }

  /// Transport stalled on a slow network round trip.
  struct SlowTransport;

  impl SyncTransport for SlowTransport {
    async fn submit(&self, _batch: &SyncBatch) -> Result<()> {
      tokio::time::sleep(std::time::Duration::from_millis(500)).await;
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_enqueue_returns_before_sync_completes() {
    let notifier = Arc::new(RecordingNotifier::default());
    let connectivity = Connectivity::new(true);
    let (tx, _rx) = worker_channel();
    let manager = Arc::new(SyncQueueManager::new(
      SqliteQueueStore::open_in_memory().unwrap(),
      SlowTransport,
      notifier,
      connectivity,
      tx,
    ));

    let started = std::time::Instant::now();
    manager.enqueue("sale", json!({"sku": "A1"})).unwrap();

    // The caller waits for the durable append only, never for the network.
    assert!(started.elapsed() < std::time::Duration::from_millis(200));
    assert_eq!(manager.store.read_all().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_batch_preserves_queue_order() {
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, connectivity, _rx) = manager(Arc::clone(&transport), notifier, false);

    manager.enqueue("sale", json!({"seq": 1})).unwrap();
    manager.enqueue("refund", json!({"seq": 2})).unwrap();
    manager.enqueue("sale", json!({"seq": 3})).unwrap();

    connectivity.set_online(true);
    manager.try_sync().await.unwrap();

    let batches = transport.batches.lock().unwrap();
    let operations = batches[0]["operations"].as_array().unwrap();
    let seqs: Vec<i64> = operations
      .iter()
      .map(|op| op["payload"]["seq"].as_i64().unwrap())
      .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_dropped() {
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, _connectivity, _rx) = manager(transport, notifier, true);

    let guard = manager.in_flight.lock().await;
    assert_eq!(
      manager.try_sync().await.unwrap(),
      SyncOutcome::AlreadyRunning
    );
    drop(guard);

    assert_eq!(manager.try_sync().await.unwrap(), SyncOutcome::Clean);
  }

  #[tokio::test]
  async fn test_late_enqueue_survives_inflight_cleanup() {
    let transport = Arc::new(FakeTransport::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let (manager, _connectivity, _rx) = manager(transport, notifier, true);

    // Simulate the window between batch read and cleanup: the batch read
    // for submission does not include the late arrival, and the
    // batch-scoped remove must not delete it either.
    let early = Operation {
      kind: "sale".to_string(),
      payload: json!({"seq": 1}),
      queued_at: 1,
    };
    let early_id = manager.store.append(&early).unwrap();
    let batch = manager.store.read_all().unwrap();

    let late = Operation {
      kind: "sale".to_string(),
      payload: json!({"seq": 2}),
      queued_at: 2,
    };
    manager.store.append(&late).unwrap();

    let ids: Vec<i64> = batch.iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![early_id]);
    manager.store.remove(&ids).unwrap();

    let remaining = manager.store.read_all().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].operation.payload["seq"], 2);
  }
}
