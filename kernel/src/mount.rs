//! Mount table and the registry of filesystem drivers that can serve mounts.

use core::fmt;

use bitflags::bitflags;
use heapless::{String, Vec};

use crate::sync::SpinLock;

pub const MAX_MOUNTS: usize = 8;
pub const MAX_FILESYSTEMS: usize = 8;

const PATH_CAPACITY: usize = 64;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const READ_ONLY = 1 << 0;
        const NO_EXEC = 1 << 1;
        const NO_DEVICES = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountError {
    /// No driver is registered under the requested type.
    UnknownFilesystem,
    /// Something is already mounted on the target.
    Busy,
    /// The target is not an absolute path or does not fit.
    InvalidTarget,
    /// The driver does not recognise the source.
    InvalidSource,
    /// The mount or driver table is full.
    TableFull,
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFilesystem => f.write_str("unknown filesystem type"),
            Self::Busy => f.write_str("target busy"),
            Self::InvalidTarget => f.write_str("invalid mount point"),
            Self::InvalidSource => f.write_str("source not recognised"),
            Self::TableFull => f.write_str("table full"),
        }
    }
}

/// A filesystem type the kernel knows how to mount.
pub trait FilesystemDriver: Sync {
    fn name(&self) -> &'static str;

    /// Checks that `source` holds a filesystem of this type.
    fn probe(&self, source: &str) -> Result<(), MountError>;
}

#[derive(Clone, Debug)]
pub struct Mount {
    pub source: String<PATH_CAPACITY>,
    pub target: String<PATH_CAPACITY>,
    pub fs_type: &'static str,
    pub flags: MountFlags,
}

struct Tables {
    drivers: Vec<&'static dyn FilesystemDriver, MAX_FILESYSTEMS>,
    mounts: Vec<Mount, MAX_MOUNTS>,
}

pub struct MountTable {
    tables: SpinLock<Tables>,
}

impl MountTable {
    pub const fn new() -> Self {
        Self {
            tables: SpinLock::new(Tables {
                drivers: Vec::new(),
                mounts: Vec::new(),
            }),
        }
    }

    /// Makes a filesystem type mountable. Registering a name twice keeps the
    /// first driver.
    pub fn register(&self, driver: &'static dyn FilesystemDriver) -> Result<(), MountError> {
        let mut tables = self.tables.lock();
        if tables.drivers.iter().any(|known| known.name() == driver.name()) {
            return Ok(());
        }
        tables
            .drivers
            .push(driver)
            .map_err(|_| MountError::TableFull)?;
        log::debug!("vfs: registered filesystem {}", driver.name());
        Ok(())
    }

    pub fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: MountFlags,
    ) -> Result<(), MountError> {
        let target = normalize(target)?;
        let driver = {
            let tables = self.tables.lock();
            if tables.mounts.iter().any(|mount| mount.target == target) {
                return Err(MountError::Busy);
            }
            *tables
                .drivers
                .iter()
                .find(|driver| driver.name() == fs_type)
                .ok_or(MountError::UnknownFilesystem)?
        };

        // Probing may touch devices, so it runs without the table lock.
        driver.probe(source)?;

        let mut stored_source = String::new();
        stored_source
            .push_str(source)
            .map_err(|_| MountError::InvalidSource)?;

        let mut tables = self.tables.lock();
        if tables.mounts.iter().any(|mount| mount.target == target) {
            return Err(MountError::Busy);
        }
        tables
            .mounts
            .push(Mount {
                source: stored_source,
                target,
                fs_type: driver.name(),
                flags,
            })
            .map_err(|_| MountError::TableFull)?;

        if let Some(mount) = tables.mounts.last() {
            log::info!("vfs: mounted {} on {} ({})", source, mount.target, mount.fs_type);
        }
        Ok(())
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.filesystem_at(target).is_some()
    }

    /// The filesystem type mounted exactly at `target`.
    pub fn filesystem_at(&self, target: &str) -> Option<&'static str> {
        let target = normalize(target).ok()?;
        self.tables
            .lock()
            .mounts
            .iter()
            .find(|mount| mount.target == target)
            .map(|mount| mount.fs_type)
    }

    pub fn mount_at(&self, target: &str) -> Option<Mount> {
        let target = normalize(target).ok()?;
        self.tables
            .lock()
            .mounts
            .iter()
            .find(|mount| mount.target == target)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

// Absolute path without a trailing slash, except for the root itself.
fn normalize(target: &str) -> Result<String<PATH_CAPACITY>, MountError> {
    if !target.starts_with('/') {
        return Err(MountError::InvalidTarget);
    }
    let trimmed = target.trim_end_matches('/');
    let trimmed = if trimmed.is_empty() { "/" } else { trimmed };

    let mut path = String::new();
    path.push_str(trimmed)
        .map_err(|_| MountError::InvalidTarget)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        source: &'static str,
    }

    impl FilesystemDriver for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn probe(&self, source: &str) -> Result<(), MountError> {
            if source == self.source {
                Ok(())
            } else {
                Err(MountError::InvalidSource)
            }
        }
    }

    static DEVFS: Fixed = Fixed {
        name: "devfs",
        source: "devfs",
    };
    static EXT2: Fixed = Fixed {
        name: "ext2",
        source: "/dev/sda1",
    };

    fn table() -> MountTable {
        let table = MountTable::new();
        table.register(&DEVFS).unwrap();
        table.register(&EXT2).unwrap();
        table
    }

    #[test]
    fn mounts_registered_filesystems() {
        let table = table();
        table.mount("devfs", "/dev", "devfs", MountFlags::empty()).unwrap();
        table
            .mount("/dev/sda1", "/", "ext2", MountFlags::READ_ONLY)
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.filesystem_at("/"), Some("ext2"));
        assert_eq!(table.filesystem_at("/dev/"), Some("devfs"));
        let root = table.mount_at("/").unwrap();
        assert_eq!(root.source.as_str(), "/dev/sda1");
        assert!(root.flags.contains(MountFlags::READ_ONLY));
    }

    #[test]
    fn rejects_unknown_types_and_sources() {
        let table = table();
        assert_eq!(
            table.mount("/dev/sda1", "/", "xfs", MountFlags::empty()),
            Err(MountError::UnknownFilesystem)
        );
        assert_eq!(
            table.mount("/dev/sdb9", "/", "ext2", MountFlags::empty()),
            Err(MountError::InvalidSource)
        );
        assert_eq!(
            table.mount("", "/", "", MountFlags::empty()),
            Err(MountError::UnknownFilesystem)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn a_target_takes_one_mount() {
        let table = table();
        table.mount("devfs", "/dev", "devfs", MountFlags::empty()).unwrap();
        assert_eq!(
            table.mount("devfs", "/dev/", "devfs", MountFlags::empty()),
            Err(MountError::Busy)
        );
    }

    #[test]
    fn targets_must_be_absolute() {
        let table = table();
        assert_eq!(
            table.mount("devfs", "dev", "devfs", MountFlags::empty()),
            Err(MountError::InvalidTarget)
        );
        assert!(!table.is_mounted("dev"));
    }

    #[test]
    fn duplicate_registration_keeps_first_driver() {
        static OTHER: Fixed = Fixed {
            name: "ext2",
            source: "/dev/other",
        };
        let table = table();
        table.register(&OTHER).unwrap();
        assert_eq!(
            table.mount("/dev/other", "/", "ext2", MountFlags::empty()),
            Err(MountError::InvalidSource)
        );
    }
}
