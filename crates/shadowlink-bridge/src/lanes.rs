//! Per-device execution lanes.
//!
//! Each device id gets one worker task that runs submitted jobs one at a time
//! in submission order. Lanes for different devices run concurrently.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

type Job = BoxFuture<'static, ()>;

#[derive(Default)]
pub struct DeviceLanes {
    lanes: DashMap<String, mpsc::UnboundedSender<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DeviceLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind every job previously submitted for `device_id`.
    pub fn submit(&self, device_id: &str, job: Job) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }

        let sender = self
            .lanes
            .entry(device_id.to_string())
            .or_insert_with(|| self.spawn_lane(device_id))
            .value()
            .clone();

        sender.send(job).map_err(|_| {
            warn!(device_id = %device_id, "Device lane closed, dropping job");
            BridgeError::ShuttingDown
        })
    }

    fn spawn_lane(&self, device_id: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let id = device_id.to_string();
        let handle = tokio::spawn(async move {
            debug!(device_id = %id, "Device lane started");
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(device_id = %id, "Device lane stopped");
        });
        self.workers.lock().push(handle);
        tx
    }

    /// Number of lanes started so far.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lanes.clear();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Device lane task failed: {}", e);
            }
        }
    }
}
