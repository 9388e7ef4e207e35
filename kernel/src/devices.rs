//! Character devices, the descriptor table and the `/dev` view over them.

use core::fmt;

use bitflags::bitflags;
use heapless::{String, Vec};

use crate::mount::{FilesystemDriver, MountError, MountTable};
use crate::sync::SpinLock;
use crate::task::Endpoints;

pub const MAX_DEVICES: usize = 16;
pub const MAX_HANDLES: usize = 32;

/// Filesystem type name of the device filesystem.
pub const DEVFS: &str = "devfs";

/// Directory the device filesystem is expected at.
pub const DEV_DIR: &str = "/dev";

const NAME_CAPACITY: usize = 16;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// An open device, as seen by the task that opened it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(pub u16);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoError {
    /// No device answers to the path.
    NoDevice,
    /// The device filesystem is not mounted.
    NotMounted,
    /// The handle is not open.
    BadHandle,
    /// The handle was not opened for this direction.
    PermissionDenied,
    /// Every descriptor or device slot is in use.
    TableFull,
    /// A device with that name already exists.
    Exists,
    /// The device ran out of input before a line was entered.
    NoInput,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoDevice => "no such device",
            Self::NotMounted => "device filesystem not mounted",
            Self::BadHandle => "bad handle",
            Self::PermissionDenied => "permission denied",
            Self::TableFull => "table full",
            Self::Exists => "device exists",
            Self::NoInput => "no input",
        };
        f.write_str(text)
    }
}

/// Byte-oriented terminal-like device.
pub trait CharDevice: Sync {
    fn write(&self, bytes: &[u8]);

    /// Next input byte, blocking if the device can wait for one. `None`
    /// means the device will never produce more input.
    fn read_byte(&self) -> Option<u8>;
}

struct Registered {
    name: String<NAME_CAPACITY>,
    device: &'static dyn CharDevice,
}

#[derive(Clone, Copy)]
struct OpenFile {
    device: usize,
    mode: OpenMode,
}

struct Tables {
    devices: Vec<Registered, MAX_DEVICES>,
    open: [Option<OpenFile>; MAX_HANDLES],
}

/// Named character devices plus the system-wide descriptor table.
pub struct DeviceRegistry {
    tables: SpinLock<Tables>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            tables: SpinLock::new(Tables {
                devices: Vec::new(),
                open: [None; MAX_HANDLES],
            }),
        }
    }

    pub fn register(&self, name: &str, device: &'static dyn CharDevice) -> Result<(), IoError> {
        let mut stored = String::new();
        stored.push_str(name).map_err(|_| IoError::NoDevice)?;

        let mut tables = self.tables.lock();
        if tables.devices.iter().any(|dev| dev.name == stored) {
            return Err(IoError::Exists);
        }
        tables
            .devices
            .push(Registered {
                name: stored,
                device,
            })
            .map_err(|_| IoError::TableFull)?;
        log::debug!("devices: registered {}", name);
        Ok(())
    }

    /// Forgets every open handle. Devices stay registered.
    pub fn reset_handles(&self) {
        self.tables.lock().open = [None; MAX_HANDLES];
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> Result<Handle, IoError> {
        let mut tables = self.tables.lock();
        let device = tables
            .devices
            .iter()
            .position(|dev| dev.name == name)
            .ok_or(IoError::NoDevice)?;
        let slot = tables
            .open
            .iter()
            .position(Option::is_none)
            .ok_or(IoError::TableFull)?;
        tables.open[slot] = Some(OpenFile { device, mode });
        Ok(Handle(slot as u16))
    }

    pub fn close(&self, handle: Handle) -> Result<(), IoError> {
        let mut tables = self.tables.lock();
        let slot = tables
            .open
            .get_mut(usize::from(handle.0))
            .ok_or(IoError::BadHandle)?;
        slot.take().map(|_| ()).ok_or(IoError::BadHandle)
    }

    pub fn write(&self, handle: Handle, bytes: &[u8]) -> Result<usize, IoError> {
        let device = self.device_for(handle, OpenMode::WRITE)?;
        device.write(bytes);
        Ok(bytes.len())
    }

    /// Prints `prompt`, then reads one line with echo and backspace editing.
    /// Input past the buffer capacity ends the line.
    pub fn read_line<const N: usize>(
        &self,
        handle: Handle,
        prompt: &str,
        out: &mut String<N>,
    ) -> Result<usize, IoError> {
        let device = self.device_for(handle, OpenMode::READ_WRITE)?;
        out.clear();
        device.write(prompt.as_bytes());

        loop {
            let Some(byte) = device.read_byte() else {
                if out.is_empty() {
                    return Err(IoError::NoInput);
                }
                break;
            };
            match byte {
                b'\r' | b'\n' => break,
                BACKSPACE | DELETE => {
                    if out.pop().is_some() {
                        device.write(b"\x08 \x08");
                    }
                }
                b' '..=b'~' => {
                    if out.push(char::from(byte)).is_err() {
                        break;
                    }
                    device.write(&[byte]);
                }
                _ => {}
            }
        }

        device.write(b"\n");
        Ok(out.len())
    }

    pub fn open_handles(&self) -> usize {
        self.tables
            .lock()
            .open
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Device I/O may block, so it happens after the table lock is dropped.
    fn device_for(&self, handle: Handle, needs: OpenMode) -> Result<&'static dyn CharDevice, IoError> {
        let tables = self.tables.lock();
        let open = tables
            .open
            .get(usize::from(handle.0))
            .copied()
            .flatten()
            .ok_or(IoError::BadHandle)?;
        if !open.mode.contains(needs) {
            return Err(IoError::PermissionDenied);
        }
        Ok(tables.devices[open.device].device)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The device filesystem. It has no backing store, so only the `devfs`
/// pseudo-source mounts.
pub struct DevFs;

impl FilesystemDriver for DevFs {
    fn name(&self) -> &'static str {
        DEVFS
    }

    fn probe(&self, source: &str) -> Result<(), MountError> {
        if source == DEVFS {
            Ok(())
        } else {
            Err(MountError::InvalidSource)
        }
    }
}

/// Path-level access to devices, honouring the mount table.
#[derive(Clone, Copy)]
pub struct Vfs<'a> {
    mounts: &'a MountTable,
    devices: &'a DeviceRegistry,
}

impl<'a> Vfs<'a> {
    pub const fn new(mounts: &'a MountTable, devices: &'a DeviceRegistry) -> Self {
        Self { mounts, devices }
    }

    pub fn mounts(&self) -> &'a MountTable {
        self.mounts
    }

    pub fn devices(&self) -> &'a DeviceRegistry {
        self.devices
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> Result<Handle, IoError> {
        let name = path
            .strip_prefix(DEV_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or(IoError::NoDevice)?;
        if self.mounts.filesystem_at(DEV_DIR) != Some(DEVFS) {
            return Err(IoError::NotMounted);
        }
        self.devices.open(name, mode)
    }

    pub fn close(&self, handle: Handle) -> Result<(), IoError> {
        self.devices.close(handle)
    }
}

impl Endpoints for Vfs<'_> {
    fn open_endpoint(&self, path: &str) -> Result<Handle, IoError> {
        self.open(path, OpenMode::READ_WRITE)
    }

    fn close_endpoint(&self, handle: Handle) {
        if let Err(err) = self.close(handle) {
            log::warn!("devices: close of {} failed: {}", handle, err);
        }
    }
}
