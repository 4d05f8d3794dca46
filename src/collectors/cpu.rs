use crate::error::SensorError;
use log::debug;
use std::time::Instant;
use sysinfo::System as SysInfo;

/// CPU usage in percent, averaged over all cores.
pub async fn collect_usage() -> Result<f64, SensorError> {
    let start = Instant::now();
    let mut sys = SysInfo::new();
    sys.refresh_cpu_usage();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu_usage();
    if sys.cpus().is_empty() {
        return Err(SensorError::probe("cpu_usage", "no CPUs reported"));
    }
    let usage = f64::from(sys.global_cpu_usage());
    debug!("collect_usage took: {} ms", start.elapsed().as_millis());
    Ok(usage)
}

pub fn collect_count() -> Result<usize, SensorError> {
    let start = Instant::now();
    let mut sys = SysInfo::new();
    sys.refresh_cpu_all();
    let count = sys.cpus().len();
    debug!("collect_count took: {} ms", start.elapsed().as_millis());
    if count == 0 {
        return Err(SensorError::probe("cpu_cores", "no CPUs reported"));
    }
    Ok(count)
}

/// Home Assistant icon matching the target word size.
pub fn icon() -> String {
    format!("mdi:cpu-{}-bit", usize::BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icon_matches_word_size() {
        let icon = icon();
        assert!(icon == "mdi:cpu-64-bit" || icon == "mdi:cpu-32-bit");
    }

    #[test]
    fn test_count_is_positive() {
        assert!(collect_count().unwrap() > 0);
    }
}
