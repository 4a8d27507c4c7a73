//! Async batching writer: settled-spend events are enqueued non-blockingly
//! from the request path and drained by a single consumer task that batches
//! them into `BaselineStore::append_spend_event_batch` calls.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::store::{BaselineStore, SpendEventRecord};

pub const CHANNEL_CAPACITY: usize = 4096;
pub const BATCH_SIZE: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle for enqueueing settled-spend events. Cheap to clone; the
/// background consumer is spawned once by `EventWriter::spawn`.
#[derive(Clone)]
pub struct EventWriter {
    sender: mpsc::Sender<SpendEventRecord>,
    dropped: Arc<AtomicU64>,
}

pub struct EventWriterHandle {
    pub writer: EventWriter,
    pub join: JoinHandle<()>,
}

impl EventWriter {
    /// Spawn the consumer task and return a writer handle plus its join handle.
    pub fn spawn(store: Arc<dyn BaselineStore>) -> EventWriterHandle {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let writer = EventWriter {
            sender,
            dropped: Arc::clone(&dropped),
        };
        let join = tokio::spawn(Self::run(receiver, store));
        EventWriterHandle { writer, join }
    }

    /// Non-blocking enqueue. Drops and counts the drop if the channel is full.
    pub fn send(&self, agent: &str, counterparty: &str, amount: crate::amount::UsdcAmount, at: DateTime<Utc>) {
        let record = SpendEventRecord::new(agent, counterparty, amount, at);
        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("event writer channel full; dropping settled-spend event");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn run(mut receiver: mpsc::Receiver<SpendEventRecord>, store: Arc<dyn BaselineStore>) {
        info!("event writer consumer started");
        let mut buffer: Vec<SpendEventRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                maybe_record = receiver.recv() => {
                    match maybe_record {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= BATCH_SIZE {
                                Self::flush(&store, &mut buffer).await;
                            }
                        }
                        None => {
                            Self::flush(&store, &mut buffer).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    Self::flush(&store, &mut buffer).await;
                }
            }
        }
        info!("event writer consumer stopped");
    }

    async fn flush(store: &Arc<dyn BaselineStore>, buffer: &mut Vec<SpendEventRecord>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        let store = Arc::clone(store);
        let result = AssertUnwindSafe(async move {
            tokio::time::timeout(FLUSH_TIMEOUT, store.append_spend_event_batch(&batch)).await
        })
        .catch_unwind()
        .await;

        match result {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(store_err))) => {
                error!(error = %store_err, "failed to append settled-spend event batch");
            }
            Ok(Err(_elapsed)) => {
                error!("timed out appending settled-spend event batch");
            }
            Err(_panic) => {
                error!("panic while flushing settled-spend event batch");
            }
        }
    }
}
