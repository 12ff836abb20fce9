//! Live telemetry distribution.
//!
//! Fans scan events out to N subscribers without blocking the producer and
//! without unbounded buffering.
//!
//! # Policy
//!
//! All subscribers share a single "latest pending" slot (a `watch` channel),
//! not a queue: a scan arriving before the previous one was consumed simply
//! overwrites it. Each subscriber runs its own delivery task that waits for
//! the slot to change, enforces its `min_interval` throttle, then delivers a
//! freshly summarized projection of whatever scan is newest *after* the
//! wait. A slow or full client drops only its own frames.
//!
//! ```text
//! producer --publish()--> watch slot --+--> delivery task --mpsc--> client
//!                                      +--> delivery task --mpsc--> client
//! ```

use crate::config::TelemetryConfig;
use crate::core::{ScanEvent, ScanSummary};
use crate::summary::summarize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Broadcasts scan events to registered subscribers with per-subscriber
/// throttling.
pub struct ScanDistributor {
    latest: watch::Sender<Option<Arc<ScanEvent>>>,
    subscribers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    default_interval: Duration,
    client_buffer: usize,
}

/// A live subscription to the scan stream.
///
/// Dropping the subscription detaches it from the distributor.
pub struct Subscription {
    id: Uuid,
    distributor: Arc<ScanDistributor>,
    rx: mpsc::Receiver<Arc<ScanSummary>>,
}

impl Subscription {
    /// Subscriber identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next delivered summary. Returns `None` once the
    /// subscription has been detached. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Arc<ScanSummary>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.distributor.remove_subscriber(self.id);
    }
}

impl ScanDistributor {
    /// Create a distributor with the configured default throttle interval
    /// and per-client delivery buffer.
    pub fn new(config: &TelemetryConfig) -> Arc<Self> {
        Arc::new(Self {
            latest: watch::Sender::new(None),
            subscribers: Mutex::new(HashMap::new()),
            default_interval: config.throttle_interval,
            client_buffer: config.client_buffer,
        })
    }

    /// Publish a scan, overwriting any undelivered one.
    ///
    /// Non-blocking; safe to call from the driver's notification context.
    pub fn publish(&self, scan: ScanEvent) {
        trace!(scan_number = scan.scan_number, "scan published");
        self.latest.send_replace(Some(Arc::new(scan)));
    }

    /// Register a subscriber with its own throttle interval (the configured
    /// default when `None`) and spawn its delivery task.
    pub fn add_subscriber(self: &Arc<Self>, min_interval: Option<Duration>) -> Subscription {
        let id = Uuid::new_v4();
        let min_interval = min_interval.unwrap_or(self.default_interval);
        let (tx, rx) = mpsc::channel(self.client_buffer);
        let slot = self.latest.subscribe();

        let task = tokio::spawn(deliver(id, slot, tx, min_interval));
        self.subscribers.lock().unwrap().insert(id, task);
        debug!(%id, ?min_interval, "subscriber added");

        Subscription {
            id,
            distributor: self.clone(),
            rx,
        }
    }

    /// Detach a subscriber and stop its delivery task. Unknown ids are a
    /// no-op, so this is safe to call concurrently with ongoing
    /// distribution.
    pub fn remove_subscriber(&self, id: Uuid) {
        if let Some(task) = self.subscribers.lock().unwrap().remove(&id) {
            task.abort();
            debug!(%id, "subscriber removed");
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// Per-subscriber delivery loop.
///
/// Waits for the shared slot to change, enforces the throttle, then delivers
/// the newest scan observed after the wait. Per-subscriber `scan_number`
/// delivery is monotonically non-decreasing.
async fn deliver(
    id: Uuid,
    mut slot: watch::Receiver<Option<Arc<ScanEvent>>>,
    tx: mpsc::Sender<Arc<ScanSummary>>,
    min_interval: Duration,
) {
    let mut last_delivered_at: Option<Instant> = None;
    let mut last_scan_number: u64 = 0;

    loop {
        if slot.changed().await.is_err() {
            break;
        }

        if let Some(at) = last_delivered_at {
            let due = at + min_interval;
            if Instant::now() < due {
                tokio::time::sleep_until(due).await;
            }
        }

        // Freshest scan after the wait; anything published during the
        // throttle window has been coalesced into the slot.
        let scan = match slot.borrow_and_update().clone() {
            Some(scan) => scan,
            None => continue,
        };
        if scan.scan_number < last_scan_number {
            continue;
        }

        match summarize(&scan) {
            Ok(summary) => match tx.try_send(Arc::new(summary)) {
                Ok(()) => {
                    last_delivered_at = Some(Instant::now());
                    last_scan_number = scan.scan_number;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%id, scan_number = scan.scan_number, "client busy, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Err(err) => {
                warn!(%id, scan_number = scan.scan_number, "dropping scan: {err}");
            }
        }
    }
}

/// In-process subscriber that keeps the most recent summary available for
/// synchronous readers (the status/scan-data endpoints).
pub struct LatestScanCache {
    slot: Arc<RwLock<Option<Arc<ScanSummary>>>>,
    task: JoinHandle<()>,
}

impl LatestScanCache {
    /// Attach the cache to a distributor as an ordinary subscriber.
    pub fn attach(distributor: &Arc<ScanDistributor>) -> Self {
        let mut subscription = distributor.add_subscriber(None);
        let slot = Arc::new(RwLock::new(None));
        let store = slot.clone();
        let task = tokio::spawn(async move {
            while let Some(summary) = subscription.recv().await {
                *store.write().unwrap() = Some(summary);
            }
        });
        Self { slot, task }
    }

    /// Most recent summary, if any scan has been delivered yet.
    pub fn latest(&self) -> Option<Arc<ScanSummary>> {
        self.slot.read().unwrap().clone()
    }
}

impl Drop for LatestScanCache {
    fn drop(&mut self) {
        self.task.abort();
    }
}
