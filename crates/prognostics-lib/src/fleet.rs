//! Share-nothing dispatch of readings to per-asset units
//!
//! Every asset gets its own [`AssetUnit`] task, spawned on its first reading
//! and fed through a bounded queue. A full queue makes `ingest` wait, so
//! producers are slowed down instead of readings being dropped. A unit whose
//! task has died is reaped and replaced on the asset's next reading.

use crate::models::{AssetId, SensorReading};
use crate::observability::PipelineMetrics;
use crate::projection::FleetView;
use crate::unit::{AssetUnit, UnitContext};
use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct UnitHandle {
    tx: mpsc::Sender<SensorReading>,
    task: JoinHandle<()>,
}

/// Decrements the active-units gauge when a unit's task ends, panics included
struct ActiveUnit(PipelineMetrics);

impl Drop for ActiveUnit {
    fn drop(&mut self) {
        self.0.dec_active_units();
    }
}

pub struct Fleet {
    ctx: UnitContext,
    units: DashMap<AssetId, UnitHandle>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl Fleet {
    pub fn new(ctx: UnitContext) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx,
            units: DashMap::new(),
            shutdown_tx,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &UnitContext {
        &self.ctx
    }

    pub fn view(&self) -> &Arc<FleetView> {
        &self.ctx.view
    }

    /// Number of running asset units
    pub fn active_units(&self) -> usize {
        self.units.len()
    }

    /// Route one reading to its asset's unit, waiting while its queue is full
    pub async fn ingest(&self, reading: SensorReading) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            bail!("fleet is shutting down");
        }
        let asset = reading.asset.clone();
        // the sender is cloned out so no map guard is held across the send
        let tx = self.sender(&asset).await;
        match tx.send(reading).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(reading)) => {
                if self.stopping.load(Ordering::Acquire) {
                    bail!("fleet is shutting down");
                }
                // the unit died while this reading waited for queue space
                self.sender(&asset)
                    .await
                    .send(reading)
                    .await
                    .map_err(|_| anyhow!("unit for asset '{asset}' has stopped"))
            }
        }
    }

    /// Route a batch in order, stopping at the first failure
    pub async fn ingest_batch(&self, readings: Vec<SensorReading>) -> Result<usize> {
        let mut accepted = 0;
        for reading in readings {
            self.ingest(reading).await?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Sender of the asset's unit, replacing a unit whose task has ended
    async fn sender(&self, asset: &AssetId) -> mpsc::Sender<SensorReading> {
        if let Some(tx) = self.live_sender(asset) {
            return tx;
        }
        let dead = self.units.remove_if(asset, |_, handle| handle.tx.is_closed());
        if let Some((_, handle)) = dead {
            match handle.task.await {
                Err(e) if e.is_panic() => {
                    error!(asset = %asset, error = %e, "Asset unit panicked, respawning")
                }
                Err(e) => warn!(asset = %asset, error = %e, "Asset unit ended abnormally, respawning"),
                Ok(()) => warn!(asset = %asset, "Asset unit exited, respawning"),
            }
        }
        self.units
            .entry(asset.clone())
            .or_insert_with(|| self.spawn(asset.clone()))
            .tx
            .clone()
    }

    fn live_sender(&self, asset: &AssetId) -> Option<mpsc::Sender<SensorReading>> {
        self.units
            .get(asset)
            .filter(|handle| !handle.tx.is_closed())
            .map(|handle| handle.tx.clone())
    }

    fn spawn(&self, asset: AssetId) -> UnitHandle {
        let (tx, rx) = mpsc::channel(self.ctx.config.queue.capacity);
        let shutdown = self.shutdown_tx.subscribe();
        let unit = AssetUnit::new(asset.clone(), self.ctx.clone());

        self.ctx.metrics.inc_active_units();
        let active = ActiveUnit(self.ctx.metrics.clone());
        info!(
            asset = %asset,
            queue_capacity = self.ctx.config.queue.capacity,
            "Spawning asset unit"
        );
        let task = tokio::spawn(async move {
            let _active = active;
            unit.run(rx, shutdown).await;
        });
        UnitHandle { tx, task }
    }

    /// Signal every unit to stop at its next window boundary and wait for them
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let signalled = self.shutdown_tx.send(()).unwrap_or(0);
        debug!(units = signalled, "Shutdown signal broadcast");

        let assets: Vec<AssetId> = self.units.iter().map(|e| e.key().clone()).collect();
        for asset in assets {
            let Some((_, handle)) = self.units.remove(&asset) else {
                continue;
            };
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                warn!(asset = %asset, error = %e, "Asset unit ended abnormally");
            }
        }
        info!("All asset units stopped");
    }
}
