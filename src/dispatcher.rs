//! The scheduler: an interval-poll loop over due delivery events, each one
//! handed to the `Executor`. Same shape as a timer-processor poll loop
//! (poll a due set, dispatch one item at a time, isolate per-item errors),
//! driven here by the store's `poll_due_events` instead of a Redis
//! sorted-set poll.

use crate::orchestrator::Executor;
use crate::store::Store;
use crate::types::EventType;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

const DUE_EVENT_TYPES: [EventType; 2] = [EventType::ExecutionCreated, EventType::ExecutionRetry];

/// Batch size per poll tick — bounds how much work one tick can pick up so
/// a burst of deliveries doesn't starve the interval loop.
const POLL_BATCH_SIZE: usize = 50;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    poll_interval_ms: u64,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, executor: Arc<Executor>, poll_interval_ms: u64) -> Self {
        Self { store, executor, poll_interval_ms }
    }

    /// Run the poll loop forever. Intended to be `tokio::spawn`ed; aborted
    /// on process shutdown.
    pub async fn run(self) {
        let mut ticker = interval(Duration::from_millis(self.poll_interval_ms));

        loop {
            ticker.tick().await;

            if let Err(e) = self.poll_once().await {
                error!("dispatcher poll error: {}", e);
            }
        }
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let due = self.store.poll_due_events(&DUE_EVENT_TYPES, now, POLL_BATCH_SIZE).await?;

        if due.is_empty() {
            return Ok(());
        }

        info!("dispatching {} due execution event(s)", due.len());

        for event in due {
            if let Err(e) = self.executor.run_once(&event.execution_id).await {
                error!(execution_id = %event.execution_id, "execution run failed: {}", e);
            }

            // Consume regardless of outcome: at-least-once delivery. A
            // crash between `run_once` and this call leaves the row
            // unconsumed for redelivery on the next poll.
            if let Err(e) = self.store.consume_event(&event.id, now).await {
                error!(event_id = %event.id, "failed to consume delivery event: {}", e);
            }
        }

        Ok(())
    }
}
