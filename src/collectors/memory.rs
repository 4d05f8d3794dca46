use crate::error::SensorError;
use log::debug;
use std::time::Instant;
use systemstat::{Platform, System};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RamUsage {
    pub used: u64,
    pub available: u64,
    pub total: u64,
}

impl RamUsage {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64 * 100.0
    }
}

pub fn collect_ram(sys: &System) -> Result<RamUsage, SensorError> {
    let start = Instant::now();
    let mem = sys
        .memory()
        .map_err(|e| SensorError::probe("memory", e))?;
    let total = mem.total.as_u64();
    let available = mem.free.as_u64();
    let result = RamUsage {
        used: total.saturating_sub(available),
        available,
        total,
    };
    debug!("collect_ram took: {} ms", start.elapsed().as_millis());
    Ok(result)
}
