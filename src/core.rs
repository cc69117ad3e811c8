//! The per-device simulation core: owns the memory map and the model, ticks
//! on a fixed interval, and publishes exported snapshots to the peer links.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::memory::{Address, MemoryMap, Value, Writer};
use crate::models::{DeviceModel, StepContext};
use crate::simproto::{Guid, PeerMessage, PeerTable};

/// Owns exactly one memory map, one model, and the peer tables for both
/// directions. The loop blocks only on the tick timer: peer state is consumed
/// as last-known snapshots, never awaited.
pub struct DeviceCore {
    guid: Guid,
    memory: Arc<MemoryMap>,
    model: Box<dyn DeviceModel>,
    upstream: Arc<PeerTable>,
    downstream: Arc<PeerTable>,
    tick: Duration,
    export_down: watch::Sender<Option<PeerMessage>>,
    export_up: watch::Sender<Option<PeerMessage>>,
    sequence: u64,
    ticks: u64,
    upstream_was_stale: bool,
}

impl DeviceCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guid: Guid,
        memory: Arc<MemoryMap>,
        model: Box<dyn DeviceModel>,
        upstream: Arc<PeerTable>,
        downstream: Arc<PeerTable>,
        tick: Duration,
        export_down: watch::Sender<Option<PeerMessage>>,
        export_up: watch::Sender<Option<PeerMessage>>,
    ) -> Self {
        Self {
            guid,
            memory,
            model,
            upstream,
            downstream,
            tick,
            export_down,
            export_up,
            sequence: 0,
            ticks: 0,
            upstream_was_stale: false,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run the simulation loop until the shutdown signal flips. The current
    /// tick always completes before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(guid = %self.guid, model = self.model.kind(), tick_ms = self.tick.as_millis() as u64, "simulation loop started");
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.step_once(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(guid = %self.guid, ticks = self.ticks, "simulation loop stopped");
    }

    /// Advance the model by one tick. Public so model behavior can be driven
    /// deterministically in tests without a runtime.
    pub fn step_once(&mut self) {
        let upstream = self.upstream.snapshot();
        let downstream = self.downstream.snapshot();

        // Flag staleness transitions for observability; stale peers never
        // block the tick, their last values keep feeding the model.
        let stale_now = upstream.any_stale() || downstream.any_stale();
        if stale_now && !self.upstream_was_stale {
            warn!(guid = %self.guid, "peer state stale; simulating with last known values");
        } else if !stale_now && self.upstream_was_stale {
            info!(guid = %self.guid, "peer state fresh again");
        }
        self.upstream_was_stale = stale_now;

        let controls: Vec<(Address, Value)> = self
            .model
            .control_points()
            .into_iter()
            .filter_map(|addr| self.memory.read(addr).ok().map(|value| (addr, value)))
            .collect();

        let ctx = StepContext {
            tick: self.ticks,
            upstream: &upstream,
            downstream: &downstream,
            controls: &controls,
        };
        let out = self.model.step(&ctx);

        for (addr, value) in out.points {
            if let Err(e) = self.memory.write(addr, value, Writer::Simulation) {
                // A model writing outside its own declared layout is a bug,
                // but it must not take the loop down.
                error!(guid = %self.guid, error = %e, "model wrote outside its memory layout");
            }
        }

        self.ticks += 1;
        self.sequence += 1;

        if !out.export_downstream.is_empty() {
            let msg = PeerMessage::new(self.guid, self.sequence, out.export_downstream);
            self.export_down.send_replace(Some(msg));
        }
        if !out.export_upstream.is_empty() {
            let msg = PeerMessage::new(self.guid, self.sequence, out.export_upstream);
            self.export_up.send_replace(Some(msg));
        }
    }
}
