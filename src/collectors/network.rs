use crate::error::SensorError;
use log::debug;
use std::time::Instant;
use systemstat::{Platform, System};

const LOOPBACK: &str = "lo";

/// Which side of the interface counters to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    fn probe(self) -> &'static str {
        match self {
            Direction::Rx => "net_rx",
            Direction::Tx => "net_tx",
        }
    }
}

/// Cumulative byte counters since boot, summed over every non-loopback
/// interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl ByteCounters {
    pub fn get(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Rx => self.rx_bytes,
            Direction::Tx => self.tx_bytes,
        }
    }
}

pub fn collect_counters(sys: &System) -> Result<ByteCounters, SensorError> {
    let start = Instant::now();
    let networks = sys
        .networks()
        .map_err(|e| SensorError::probe("network", e))?;

    let mut counters = ByteCounters::default();
    for net in networks.values() {
        if net.name == LOOPBACK {
            continue;
        }
        if let Ok(stats) = sys.network_stats(&net.name) {
            counters.rx_bytes = counters.rx_bytes.saturating_add(stats.rx_bytes.as_u64());
            counters.tx_bytes = counters.tx_bytes.saturating_add(stats.tx_bytes.as_u64());
        }
    }

    debug!("collect_counters took: {} ms", start.elapsed().as_millis());
    Ok(counters)
}

/// Reads one direction of the interface counters.
pub fn collect_counter(sys: &System, direction: Direction) -> Result<u64, SensorError> {
    collect_counters(sys)
        .map(|counters| counters.get(direction))
        .map_err(|e| match e {
            SensorError::Probe { message, .. } => SensorError::probe(direction.probe(), message),
            other => other,
        })
}
