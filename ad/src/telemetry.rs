//! Telemetry broadcaster
//!
//! Maintains the bounded set of live stream channels feeding operator
//! dashboards. One loop assembles a single snapshot per tick from two
//! aggregate ledger reads and fans it out to every subscriber, so the
//! per-tick read cost does not grow with the number of channels. The read
//! handle is never held across the sleep between ticks. Subscribes beyond
//! the cap are rejected, not queued; disconnected channels are torn down
//! and their slots freed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use runledger::{AgentRollup, ExecutionStatus, day_start_ms, now_ms};

use crate::config::TelemetryConfig;
use crate::runtime::{RuntimeState, derive_state};
use crate::state::{StateError, StateManager};

/// Buffered snapshots per channel; a consumer this far behind misses ticks
/// rather than stalling the broadcaster
const CHANNEL_BUFFER: usize = 8;

/// Subscribe attempt beyond the hard channel cap
#[derive(Debug, Error)]
#[error("Stream channel capacity exceeded (cap {cap})")]
pub struct CapacityRejected {
    pub cap: usize,
}

/// Point-in-time view of every agent, pushed to subscribers each tick
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: i64,
    pub agents: Vec<AgentMetrics>,
}

/// One agent's row in a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub name: String,
    pub state: RuntimeState,
    pub enabled: bool,
    pub paused: bool,
    pub last_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
    pub executions_today: u64,
    pub items_today: i64,
    pub cost_today_usd: f64,
    pub errors_today: u64,
}

/// The receiving half of one stream channel
#[derive(Debug)]
pub struct MetricsStream {
    id: String,
    rx: mpsc::Receiver<MetricsSnapshot>,
}

impl MetricsStream {
    /// Channel identifier, usable for explicit unsubscription
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next snapshot; None when the broadcaster shut down
    pub async fn recv(&mut self) -> Option<MetricsSnapshot> {
        self.rx.recv().await
    }
}

/// One live subscriber slot
struct StreamChannel {
    id: String,
    tx: mpsc::Sender<MetricsSnapshot>,
    #[allow(dead_code)]
    subscribed_at: i64,
    #[allow(dead_code)]
    last_snapshot_at: Option<i64>,
}

/// The broadcaster over one StateManager
#[derive(Clone)]
pub struct MetricsBroadcaster {
    state: StateManager,
    config: TelemetryConfig,
    channels: Arc<Mutex<Vec<StreamChannel>>>,
}

impl MetricsBroadcaster {
    /// Create a new broadcaster
    pub fn new(state: StateManager, config: TelemetryConfig) -> Self {
        Self {
            state,
            config,
            channels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Open a stream channel, failing closed at the cap
    pub fn subscribe(&self) -> Result<MetricsStream, CapacityRejected> {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Reap already-disconnected subscribers before judging capacity so a
        // freed slot is immediately reusable
        channels.retain(|channel| !channel.tx.is_closed());

        if channels.len() >= self.config.channel_cap {
            debug!(cap = self.config.channel_cap, "subscribe: capacity rejected");
            return Err(CapacityRejected {
                cap: self.config.channel_cap,
            });
        }

        let id = uuid::Uuid::now_v7().to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        channels.push(StreamChannel {
            id: id.clone(),
            tx,
            subscribed_at: now_ms(),
            last_snapshot_at: None,
        });
        info!(channel_id = %id, live = channels.len(), "Stream channel subscribed");

        Ok(MetricsStream { id, rx })
    }

    /// Tear down one channel explicitly
    pub fn unsubscribe(&self, id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = channels.len();
        channels.retain(|channel| channel.id != id);
        if channels.len() < before {
            info!(channel_id = %id, "Stream channel unsubscribed");
        }
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.retain(|channel| !channel.tx.is_closed());
        channels.len()
    }

    /// Run the broadcast loop until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick_secs,
            channel_cap = self.config.channel_cap,
            "Telemetry broadcaster started"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.broadcast_once(now_ms()).await;
                }
                _ = shutdown.changed() => {
                    info!("Telemetry broadcaster stopping");
                    break;
                }
            }
        }
    }

    /// One tick: assemble a snapshot once, fan it out, reap the disconnected
    ///
    /// Returns the number of channels that received the snapshot. With no
    /// live channels the ledger is not read at all.
    pub async fn broadcast_once(&self, now: i64) -> usize {
        if self.channel_count() == 0 {
            return 0;
        }

        let snapshot = match self.assemble_snapshot(now).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "broadcast_once: failed to assemble snapshot");
                return 0;
            }
        };

        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut delivered = 0;
        channels.retain_mut(|channel| {
            match channel.tx.try_send(snapshot.clone()) {
                Ok(()) => {
                    channel.last_snapshot_at = Some(now);
                    delivered += 1;
                    true
                }
                // Receiver dropped: the disconnect detected via the transport
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!(channel_id = %channel.id, "Stream channel disconnected, freeing slot");
                    false
                }
                // Slow consumer: skip this tick, keep the slot
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(channel_id = %channel.id, "broadcast_once: channel buffer full, skipping tick");
                    true
                }
            }
        });
        delivered
    }

    /// Assemble the snapshot from short-lived aggregate reads
    ///
    /// Three batched queries regardless of agent count: definitions, latest
    /// record per agent, and today's rollup counters.
    async fn assemble_snapshot(&self, now: i64) -> Result<MetricsSnapshot, StateError> {
        let agents = self.state.list_agents().await?;
        let statuses = self.state.status_snapshot().await?;
        let rollups = self.state.rollups_since(day_start_ms(now)).await?;

        let mut rows = Vec::with_capacity(agents.len());
        for def in agents {
            let status = statuses.iter().find(|row| row.agent == def.name);
            let rollup = rollups.iter().find(|row| row.agent == def.name);

            let state = derive_state(&def, status.map(|row| row.last_status));

            let empty = AgentRollup::default();
            let rollup = rollup.unwrap_or(&empty);
            rows.push(AgentMetrics {
                name: def.name.clone(),
                state,
                enabled: def.enabled,
                paused: def.paused,
                last_status: status.map(|row| row.last_status),
                last_error: status.and_then(|row| row.last_error.clone()),
                executions_today: rollup.executions,
                items_today: rollup.items_processed,
                cost_today_usd: rollup.cost_usd,
                errors_today: rollup.errors,
            });
        }

        Ok(MetricsSnapshot {
            generated_at: now,
            agents: rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runledger::{AdmitOutcome, AgentDef, Ledger, RunOutcome};

    fn broadcaster_with_cap(cap: usize) -> MetricsBroadcaster {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        MetricsBroadcaster::new(
            state,
            TelemetryConfig {
                tick_secs: 5,
                channel_cap: cap,
            },
        )
    }

    #[tokio::test]
    async fn test_subscribe_beyond_cap_is_rejected() {
        let broadcaster = broadcaster_with_cap(2);

        let _first = broadcaster.subscribe().unwrap();
        let _second = broadcaster.subscribe().unwrap();

        let err = broadcaster.subscribe().unwrap_err();
        assert_eq!(err.cap, 2);
        assert_eq!(broadcaster.channel_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_frees_a_slot() {
        let broadcaster = broadcaster_with_cap(2);

        let first = broadcaster.subscribe().unwrap();
        let _second = broadcaster.subscribe().unwrap();
        assert!(broadcaster.subscribe().is_err());

        // Dropping the stream is the disconnect
        drop(first);

        let _third = broadcaster.subscribe().unwrap();
        assert_eq!(broadcaster.channel_count(), 2);
    }

    #[tokio::test]
    async fn test_explicit_unsubscribe_frees_a_slot() {
        let broadcaster = broadcaster_with_cap(1);

        let stream = broadcaster.subscribe().unwrap();
        assert!(broadcaster.subscribe().is_err());

        broadcaster.unsubscribe(stream.id());
        assert!(broadcaster.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_derived_state_and_rollups() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let broadcaster = MetricsBroadcaster::new(state.clone(), TelemetryConfig::default());

        state.create_agent(AgentDef::new("a", "anthropic", "m")).await.unwrap();
        let now = now_ms();
        let AdmitOutcome::Admitted(record) = state.admit_run("a", "manual", now).await.unwrap() else {
            panic!("expected admission");
        };
        state
            .finalize_run(&record.id, "a", RunOutcome::completed(7, 1000, 0.25), now + 100)
            .await
            .unwrap();

        let mut stream = broadcaster.subscribe().unwrap();
        let delivered = broadcaster.broadcast_once(now + 200).await;
        assert_eq!(delivered, 1);

        let snapshot = stream.recv().await.unwrap();
        assert_eq!(snapshot.agents.len(), 1);
        let row = &snapshot.agents[0];
        assert_eq!(row.name, "a");
        assert_eq!(row.state, RuntimeState::Idle);
        assert_eq!(row.last_status, Some(ExecutionStatus::Completed));
        assert_eq!(row.executions_today, 1);
        assert_eq!(row.items_today, 7);
        assert!((row.cost_today_usd - 0.25).abs() < 1e-9);
        assert_eq!(row.errors_today, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reports_error_state() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let broadcaster = MetricsBroadcaster::new(state.clone(), TelemetryConfig::default());

        state.create_agent(AgentDef::new("a", "anthropic", "m")).await.unwrap();
        let now = now_ms();
        let AdmitOutcome::Admitted(record) = state.admit_run("a", "manual", now).await.unwrap() else {
            panic!("expected admission");
        };
        state
            .finalize_run(&record.id, "a", RunOutcome::failed("provider exploded"), now + 100)
            .await
            .unwrap();

        let mut stream = broadcaster.subscribe().unwrap();
        broadcaster.broadcast_once(now + 200).await;

        let snapshot = stream.recv().await.unwrap();
        let row = &snapshot.agents[0];
        assert_eq!(row.state, RuntimeState::Error);
        assert_eq!(row.last_error.as_deref(), Some("provider exploded"));
        assert_eq!(row.errors_today, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaps_disconnected_channels() {
        let broadcaster = broadcaster_with_cap(4);
        let state = &broadcaster.state;
        state.create_agent(AgentDef::new("a", "anthropic", "m")).await.unwrap();

        let kept = broadcaster.subscribe().unwrap();
        let dropped = broadcaster.subscribe().unwrap();
        drop(dropped);

        let delivered = broadcaster.broadcast_once(now_ms()).await;
        assert_eq!(delivered, 1);
        assert_eq!(broadcaster.channel_count(), 1);
        drop(kept);
    }

    #[tokio::test]
    async fn test_no_subscribers_means_no_reads() {
        let broadcaster = broadcaster_with_cap(4);
        assert_eq!(broadcaster.broadcast_once(now_ms()).await, 0);
    }
}
