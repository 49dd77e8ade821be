//! Snapshot fan-out.
//!
//! On a fixed interval the publisher captures the latest snapshot, trims it
//! to the bounded stream payload and broadcasts it. The broadcast ring is
//! bounded: every subscriber holds an independent cursor, and a slow consumer
//! drops its own oldest undelivered payloads without ever blocking the
//! publish loop or another subscriber. Dropped receivers clean themselves up
//! on the next send.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::fleet::aggregator::StateAggregator;
use crate::models::{AgentStatusEntry, FleetSnapshot, StreamPayload};

/// Bounded payload fields.
pub const MAX_STREAM_OPPORTUNITIES: usize = 5;
pub const MAX_STREAM_LOG_EVENTS: usize = 10;

pub const DEFAULT_STREAM_CAPACITY: usize = 16;
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

pub struct StreamPublisher {
    aggregator: Arc<StateAggregator>,
    tx: broadcast::Sender<Arc<StreamPayload>>,
    publish_interval: Duration,
}

impl StreamPublisher {
    pub fn new(
        aggregator: Arc<StateAggregator>,
        capacity: usize,
        publish_interval: Duration,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            aggregator,
            tx,
            publish_interval,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Trim a snapshot to the fixed stream shape.
    pub fn payload_from(snapshot: &FleetSnapshot) -> StreamPayload {
        let opportunities = snapshot
            .open_opportunities
            .iter()
            .take(MAX_STREAM_OPPORTUNITIES)
            .cloned()
            .collect();

        let log_skip = snapshot
            .recent_logs
            .len()
            .saturating_sub(MAX_STREAM_LOG_EVENTS);
        let logs = snapshot.recent_logs.iter().skip(log_skip).cloned().collect();

        let accounts: BTreeMap<String, AgentStatusEntry> = snapshot
            .accounts
            .iter()
            .map(|a| {
                (
                    a.account_id.clone(),
                    AgentStatusEntry {
                        status: a.status,
                        opportunity_count: a.opportunity_count,
                    },
                )
            })
            .collect();

        StreamPayload {
            timestamp: snapshot.taken_at,
            opportunities,
            logs,
            accounts,
            portfolio_pnl: snapshot.portfolio_pnl,
        }
    }

    /// Capture and broadcast one payload. Returns the number of subscribers
    /// it reached.
    pub fn publish_once(&self) -> usize {
        let snapshot = self.aggregator.capture();
        let payload = Arc::new(Self::payload_from(&snapshot));
        match self.tx.send(payload) {
            Ok(receivers) => receivers,
            // No subscribers; nothing to deliver.
            Err(_) => 0,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.publish_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let reached = self.publish_once();
            debug!(subscribers = reached, "snapshot published");
        }
    }
}

/// One subscriber's handle. `recv` transparently skips over payloads the
/// subscriber was too slow to take, counting them in `dropped`.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<StreamPayload>>,
    pub dropped: u64,
}

impl Subscription {
    /// Next payload, or None once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Arc<StreamPayload>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, "slow stream subscriber dropped snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests.
    pub fn try_recv(&mut self) -> Option<Arc<StreamPayload>> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }
}
