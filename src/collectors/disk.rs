use crate::error::SensorError;
use log::debug;
use std::path::Path;
use std::time::Instant;

/// Used space of the filesystem mounted at `mount_point`, in percent.
pub fn collect_usage(mount_point: &str) -> Result<f64, SensorError> {
    let start = Instant::now();
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new(mount_point))
        .ok_or_else(|| SensorError::probe("root_fs_usage", format!("{mount_point} is not mounted")))?;

    let total = disk.total_space();
    if total == 0 {
        return Err(SensorError::probe(
            "root_fs_usage",
            format!("{mount_point} reports zero size"),
        ));
    }
    let used = total.saturating_sub(disk.available_space());
    debug!("collect_usage took: {} ms", start.elapsed().as_millis());
    Ok(used as f64 / total as f64 * 100.0)
}
