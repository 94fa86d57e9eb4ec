//! Background expiry of NAT state
//!
//! The reaper wakes once per tick and runs one [`NatTable::reap`] pass. It is
//! stopped cooperatively through a cancellation token and joined, so a pass
//! is never cut off halfway through.

use super::clock::Clock;
use super::napt::{NaptConfig, NatTable};
use crate::telemetry::NatMetrics;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a running reaper task
pub struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Spawn the reaper on the current tokio runtime.
    ///
    /// A zero `tick` is rejected; the task could never be scheduled.
    pub fn spawn(table: Arc<NatTable>, tick: Duration) -> Result<Self> {
        if tick.is_zero() {
            return Err(Error::Config(
                "reaper tick must be greater than zero".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            info!(tick_ms = tick.as_millis() as u64, "reaper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = table.reap();
                        if !summary.is_empty() {
                            debug!(
                                icmp_expired = summary.icmp_expired,
                                tcp_expired = summary.tcp_expired,
                                connections_expired = summary.connections_expired,
                                remaining = table.len(),
                                "reaper pass"
                            );
                        }
                    }
                    _ = token.cancelled() => {
                        break;
                    }
                }
            }
            info!("reaper stopped");
        });

        Ok(Self { cancel, handle })
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task to stop and wait for it.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("reaper task failed: {}", e);
        }
    }
}

/// A NAT table together with its reaper.
///
/// Packet-processing paths share the table through [`Nat::table`];
/// [`Nat::shutdown`] is the single teardown point.
pub struct Nat {
    table: Arc<NatTable>,
    reaper: Reaper,
}

impl Nat {
    /// Build the table and start reaping it every `tick`.
    pub fn start(
        config: NaptConfig,
        tick: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<NatMetrics>,
    ) -> Result<Self> {
        let table = Arc::new(NatTable::with_metrics(config, clock, metrics));
        let reaper = Reaper::spawn(table.clone(), tick)?;
        Ok(Self { table, reaper })
    }

    pub fn table(&self) -> &Arc<NatTable> {
        &self.table
    }

    /// Stop the reaper, wait for it, then release every mapping.
    pub async fn shutdown(self) {
        self.reaper.shutdown().await;
        let released = self.table.clear();
        info!(released, "NAT table torn down");
    }
}
