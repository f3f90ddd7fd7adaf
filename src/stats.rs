//! Traffic statistics accumulator.
//!
//! Consumes the same normalized event shapes the transport engine emits
//! and keeps per-frequency / per-modulation / per-status counters. The
//! snapshot export is a destructive read: counters restart from zero.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::events::{
    DownlinkFrame, DownlinkTxAck, Modulation, UplinkFrame, TXACK_STATUS_IGNORED, TXACK_STATUS_OK,
};

#[derive(Debug, Default)]
struct Counters {
    rx_count: u64,
    tx_count: u64,
    rx_per_frequency: HashMap<u32, u64>,
    tx_per_frequency: HashMap<u32, u64>,
    rx_per_modulation: HashMap<Modulation, u64>,
    tx_per_modulation: HashMap<Modulation, u64>,
    tx_per_status: HashMap<String, u64>,
}

/// Accumulates traffic counters until the next export
#[derive(Debug, Default)]
pub struct Collector {
    counters: Mutex<Counters>,
}

/// Immutable view of the counters at export time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub rx_count: u64,
    pub tx_count: u64,
    pub rx_per_frequency: HashMap<u32, u64>,
    pub tx_per_frequency: HashMap<u32, u64>,
    pub rx_per_modulation: Vec<ModulationCount>,
    pub tx_per_modulation: Vec<ModulationCount>,
    pub tx_per_status: HashMap<String, u64>,
}

/// One modulation variant and how often it was seen. The variant itself is
/// the canonical key; it is reproduced in full on export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModulationCount {
    #[serde(flatten)]
    pub modulation: Modulation,
    pub count: u64,
}

impl Collector {
    pub fn new() -> Self {
        Collector::default()
    }

    /// Count one received uplink
    pub fn record_uplink(&self, frame: &UplinkFrame) {
        let mut counters = self.counters.lock().expect("stats lock poisoned");
        counters.rx_count += 1;
        *counters
            .rx_per_frequency
            .entry(frame.tx_info.frequency)
            .or_default() += 1;
        *counters
            .rx_per_modulation
            .entry(frame.tx_info.modulation.clone())
            .or_default() += 1;
    }

    /// Account a downlink acknowledgement against the batch it answers.
    /// Ack items align with sent items by index; "IGNORED" items are
    /// skipped entirely, every other status is counted, and only in-range
    /// "OK" items credit the totals and breakdowns.
    pub fn record_downlink(&self, sent: &DownlinkFrame, ack: &DownlinkTxAck) {
        let mut counters = self.counters.lock().expect("stats lock poisoned");
        for (i, item) in ack.items.iter().enumerate() {
            if item.status == TXACK_STATUS_IGNORED {
                continue;
            }
            *counters.tx_per_status.entry(item.status.clone()).or_default() += 1;

            if item.status != TXACK_STATUS_OK {
                continue;
            }
            if let Some(sent_item) = sent.items.get(i) {
                counters.tx_count += 1;
                *counters
                    .tx_per_frequency
                    .entry(sent_item.tx_info.frequency)
                    .or_default() += 1;
                *counters
                    .tx_per_modulation
                    .entry(sent_item.tx_info.modulation.clone())
                    .or_default() += 1;
            }
        }
    }

    /// Export a snapshot and atomically reset all counters to zero
    pub fn export_and_reset(&self) -> Snapshot {
        let mut counters = self.counters.lock().expect("stats lock poisoned");
        let counters = std::mem::take(&mut *counters);
        Snapshot {
            rx_count: counters.rx_count,
            tx_count: counters.tx_count,
            rx_per_frequency: counters.rx_per_frequency,
            tx_per_frequency: counters.tx_per_frequency,
            rx_per_modulation: modulation_counts(counters.rx_per_modulation),
            tx_per_modulation: modulation_counts(counters.tx_per_modulation),
            tx_per_status: counters.tx_per_status,
        }
    }
}

fn modulation_counts(map: HashMap<Modulation, u64>) -> Vec<ModulationCount> {
    map.into_iter()
        .map(|(modulation, count)| ModulationCount { modulation, count })
        .collect()
}
