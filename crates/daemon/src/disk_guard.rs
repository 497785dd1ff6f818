//! Disk space preflight.
//!
//! A conversion needs room for the extracted stream, the converted stream and
//! the remuxed output at the same time, so the requirement scales with the
//! source size. A shortfall is never a failure of the file itself.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const BYTES_PER_GB: u64 = 1_000_000_000;

/// Source of free-space figures for the filesystem holding a path.
pub trait FreeSpace: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Free space as reported by the operating system through sysinfo.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpace for SystemFreeSpace {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        use sysinfo::Disks;

        let resolved = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();

        // The disk with the longest mount point containing the path owns it.
        disks
            .list()
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted filesystem contains {}", resolved.display()),
                )
            })
    }
}

/// Preflight check run before a job commits disk resources.
#[derive(Clone)]
pub struct DiskSpaceGuard {
    min_free_bytes: u64,
    multiplier: f64,
    free: Arc<dyn FreeSpace>,
}

impl DiskSpaceGuard {
    pub fn new(min_free_gb: u64, multiplier: f64, free: Arc<dyn FreeSpace>) -> Self {
        Self {
            min_free_bytes: min_free_gb.saturating_mul(BYTES_PER_GB),
            multiplier,
            free,
        }
    }

    /// Headroom needed to convert a file of `source_bytes`:
    /// `source_bytes * multiplier + min_free`.
    pub fn required_bytes(&self, source_bytes: u64) -> u64 {
        let scaled = (source_bytes as f64 * self.multiplier).ceil();
        let scaled = if scaled >= u64::MAX as f64 {
            u64::MAX
        } else {
            scaled as u64
        };
        scaled.saturating_add(self.min_free_bytes)
    }

    /// True when every filesystem in `targets` has enough room.
    ///
    /// A target whose free space cannot be read counts as insufficient.
    pub fn has_room(&self, source_bytes: u64, targets: &[PathBuf]) -> bool {
        let required = self.required_bytes(source_bytes);
        for target in targets {
            match self.free.available_bytes(target) {
                Ok(available) if available >= required => {
                    debug!(
                        target = %target.display(),
                        available,
                        required,
                        "Disk space sufficient"
                    );
                }
                Ok(available) => {
                    warn!(
                        target = %target.display(),
                        available_gb = available / BYTES_PER_GB,
                        required_gb = required / BYTES_PER_GB,
                        "Insufficient disk space"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(target = %target.display(), "Cannot read free space: {}", e);
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for DiskSpaceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSpaceGuard")
            .field("min_free_bytes", &self.min_free_bytes)
            .field("multiplier", &self.multiplier)
            .finish()
    }
}
