//! Free-space lookup for backup preflight

use std::path::Path;

use sysinfo::Disks;

/// Bytes available on the filesystem holding `path`.
///
/// Walks up to the nearest existing ancestor and picks the disk with the
/// longest matching mount point. `None` when no mounted disk matches.
pub fn available_space(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    let resolved = existing.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
