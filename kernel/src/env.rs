//! [`Environment`] backed by the kernel's own mount table and device registry.

use log::{info, warn};

use crate::cmdline::{CmdlineError, CommandLine, Value};
use crate::devices::{CharDevice, DevFs, Handle, IoError, OpenMode, Vfs};
use crate::error::InitError;
use crate::mount::{FilesystemDriver, MountError, MountFlags};
use crate::rootenv::Environment;
use crate::task::Endpoints;

pub const DEFAULT_HOSTNAME: &str = "rustcore";

/// Looks for network hardware; returns how many interfaces came up.
pub type NetworkProbe = fn() -> Result<usize, InitError>;

static DEVFS_DRIVER: DevFs = DevFs;

/// Drivers the environment installs during bring-up of the root task.
#[derive(Clone, Copy)]
pub struct Drivers {
    pub filesystems: &'static [&'static dyn FilesystemDriver],
    pub terminals: &'static [(&'static str, &'static dyn CharDevice)],
    pub network: Option<NetworkProbe>,
}

pub struct KernelEnvironment<'a> {
    vfs: Vfs<'a>,
    cmdline: &'a CommandLine<'a>,
    drivers: Drivers,
    hostname: Value,
}

impl<'a> KernelEnvironment<'a> {
    pub fn new(vfs: Vfs<'a>, cmdline: &'a CommandLine<'a>, drivers: Drivers) -> Self {
        Self {
            vfs,
            cmdline,
            drivers,
            hostname: Value::new(),
        }
    }

    /// Empty until `init_hostname` runs.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl Environment for KernelEnvironment<'_> {
    fn init_fd(&mut self) -> Result<(), InitError> {
        self.vfs.devices().reset_handles();
        Ok(())
    }

    fn init_fs(&mut self) -> Result<(), InitError> {
        let mounts = self.vfs.mounts();
        let table_full = |_: MountError| InitError::Exhausted("filesystem table");
        mounts.register(&DEVFS_DRIVER).map_err(table_full)?;
        for driver in self.drivers.filesystems {
            mounts.register(*driver).map_err(table_full)?;
        }
        Ok(())
    }

    fn mount(
        &mut self,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: MountFlags,
    ) -> Result<(), MountError> {
        self.vfs.mounts().mount(source, target, fs_type, flags)
    }

    fn init_devices(&mut self) -> Result<(), InitError> {
        let devices = self.vfs.devices();
        for (name, device) in self.drivers.terminals {
            match devices.register(name, *device) {
                Ok(()) => {}
                Err(IoError::Exists) => warn!("devices: {} registered twice", name),
                Err(IoError::TableFull) => return Err(InitError::Exhausted("device table")),
                Err(_) => return Err(InitError::Invalid("device name")),
            }
        }
        info!("devices: {} device(s) registered", devices.len());
        Ok(())
    }

    fn init_network(&mut self) -> Result<(), InitError> {
        match self.drivers.network {
            Some(probe) => {
                let interfaces = probe()?;
                info!("net: {} interface(s) up", interfaces);
            }
            None => info!("net: no network drivers"),
        }
        Ok(())
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, IoError> {
        self.vfs.open(path, mode)
    }

    fn close(&mut self, handle: Handle) {
        self.vfs.close_endpoint(handle);
    }

    fn read_line(&mut self, handle: Handle, prompt: &str, out: &mut Value) -> Result<(), IoError> {
        self.vfs.devices().read_line(handle, prompt, out).map(|_| ())
    }

    fn init_hostname(&mut self) -> Result<(), InitError> {
        match self.cmdline.value_into("hostname", &mut self.hostname) {
            Ok(()) if !self.hostname.is_empty() => {}
            Ok(()) | Err(CmdlineError::Missing) => {
                self.hostname.clear();
                // Shorter than any value buffer.
                let _ = self.hostname.push_str(DEFAULT_HOSTNAME);
            }
            Err(CmdlineError::Truncated) => {
                warn!("hostname: truncated to {}", self.hostname);
            }
        }
        info!("hostname: {}", self.hostname);
        Ok(())
    }
}
