//! Simulated terminal inputs.
//!
//! Stands in for real field signals so subscribers see changing data:
//! BOOL inputs toggle at a per-channel rate, integers ramp as sawtooths
//! and floats follow a sine.

use catio_ads::image::ProcessImage;
use catio_ads::index;
use catio_ads::topology::Topology;
use catio_ads::SharedState;
use catio_common::ads_types::AdsDataType;
use catio_common::config::Direction;
use catio_common::error::AdsResult;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sawtooth period of integer ramps.
const RAMP_PERIOD: u64 = 1000;

#[derive(Debug, Clone)]
struct SimChannel {
    name: String,
    offset: usize,
    kind: AdsDataType,
    phase: u64,
}

/// Drives every scalar input symbol of a topology.
#[derive(Debug, Clone)]
pub struct InputSimulator {
    channels: Vec<SimChannel>,
    tick: u64,
}

impl InputSimulator {
    /// Collect the input channels of `topology`.
    #[must_use]
    pub fn new(topology: &Topology) -> Self {
        let channels = topology
            .symbols
            .values()
            .filter(|entry| entry.index_group == index::IO_RW_I)
            .filter_map(|entry| {
                let kind = entry.ads_type().filter(|k| k.size() > 0)?;
                Some((entry, kind))
            })
            .zip(0u64..)
            .map(|((entry, kind), phase)| SimChannel {
                name: entry.name.clone(),
                offset: entry.index_offset as usize,
                kind,
                phase,
            })
            .collect();
        Self { channels, tick: 0 }
    }

    /// Number of driven channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Advance one tick and write every channel into `image`.
    pub fn step(&mut self, image: &mut ProcessImage) -> AdsResult<()> {
        self.tick = self.tick.wrapping_add(1);
        for channel in &self.channels {
            let bytes = channel_value(channel.kind, self.tick, channel.phase);
            image.write(Direction::Input, channel.offset, &bytes)?;
        }
        Ok(())
    }

    /// Names of the driven channels.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn channel_value(kind: AdsDataType, tick: u64, phase: u64) -> Vec<u8> {
    let ramp = (tick * (phase + 1)) % RAMP_PERIOD;
    let wave = ((tick as f64) / 10.0 + phase as f64).sin() * 100.0;
    match kind {
        AdsDataType::Bool => vec![u8::from((tick / (phase + 1)) % 2 == 1)],
        AdsDataType::Sint => vec![(ramp % 128) as u8],
        AdsDataType::Usint => vec![(ramp % 256) as u8],
        AdsDataType::Int => (ramp as i16).to_le_bytes().to_vec(),
        AdsDataType::Uint => (ramp as u16).to_le_bytes().to_vec(),
        AdsDataType::Dint => (ramp as i32).to_le_bytes().to_vec(),
        AdsDataType::Udint => (ramp as u32).to_le_bytes().to_vec(),
        AdsDataType::Lint => (ramp as i64).to_le_bytes().to_vec(),
        AdsDataType::Ulint => ramp.to_le_bytes().to_vec(),
        AdsDataType::Real => (wave as f32).to_le_bytes().to_vec(),
        AdsDataType::Lreal => wave.to_le_bytes().to_vec(),
        AdsDataType::Bigtype => Vec::new(),
    }
}

/// Step `simulator` against the served image every `period` until shutdown.
pub fn spawn_simulator(
    mut simulator: InputSimulator,
    state: SharedState,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(channels = simulator.channel_count(), ?period, "Input simulation started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
                    if let Err(e) = simulator.step(&mut guard.topology.image) {
                        warn!(error = %e, "Input simulation stopped");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Input simulation stopped");
    })
}
