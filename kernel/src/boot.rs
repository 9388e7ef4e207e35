//! Loader handoff record and the boot-wide values derived from it.

use bootproto::{BootInfo, MemoryRegion, BOOTINFO_VERSION};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::Once;

use crate::cmdline::CommandLine;

static BOOT_INFO: AtomicPtr<BootInfo> = AtomicPtr::new(ptr::null_mut());
static CMDLINE: Once<CommandLine<'static>> = Once::new();
static UNIX_EPOCH: Once<u64> = Once::new();
static EMPTY_CMDLINE: CommandLine<'static> = CommandLine::empty();

/// Filled in by the stage-0 loader before it jumps to the kernel.
#[no_mangle]
pub static mut RUSTCORE_BOOTINFO: BootInfo = BootInfo::empty();

/// Records the [`BootInfo`] passed in by the loader and parses the command
/// line it carries. Later calls return the first parse.
pub fn init(boot_info: Option<&'static BootInfo>) -> &'static CommandLine<'static> {
    let boot_info = boot_info.filter(|info| {
        let compatible = info.is_compatible();
        if !compatible {
            log::warn!(
                "boot: ignoring boot info version {} (expected {})",
                info.version,
                BOOTINFO_VERSION
            );
        }
        compatible
    });

    if let Some(info) = boot_info {
        BOOT_INFO.store(info as *const BootInfo as *mut BootInfo, Ordering::Release);
    }

    CMDLINE.call_once(|| CommandLine::parse(boot_info.map_or("", raw_cmdline)))
}

fn raw_cmdline(info: &'static BootInfo) -> &'static str {
    // SAFETY: a compatible record points at loader memory that stays mapped.
    let bytes = unsafe { info.cmdline.as_slice() };
    match core::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            log::warn!("boot: command line is not UTF-8 past byte {}", err.valid_up_to());
            // The prefix up to `valid_up_to` is valid by definition.
            core::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or("")
        }
    }
}

/// Returns the loader-provided [`BootInfo`], when available.
pub fn boot_info() -> Option<&'static BootInfo> {
    let ptr = BOOT_INFO.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// The parsed command line; empty until [`init`] runs.
pub fn cmdline() -> &'static CommandLine<'static> {
    CMDLINE.get().unwrap_or(&EMPTY_CMDLINE)
}

/// The firmware memory map, empty when the loader provided none.
pub fn memory_map() -> &'static [MemoryRegion] {
    // SAFETY: see `raw_cmdline`.
    match boot_info() {
        Some(info) => unsafe { info.memory_map.as_slice() },
        None => &[],
    }
}

pub fn rsdp() -> Option<u64> {
    boot_info().map(|info| info.rsdp).filter(|&addr| addr != 0)
}

/// Stores the boot-time Unix epoch. Only the first value sticks; it is
/// returned on every call.
pub fn record_epoch(epoch: u64) -> u64 {
    *UNIX_EPOCH.call_once(|| epoch)
}

pub fn unix_epoch() -> Option<u64> {
    UNIX_EPOCH.get().copied()
}

pub fn build_id() -> &'static str {
    match option_env!("RUSTCORE_BUILD_ID") {
        Some(id) => id,
        None => concat!("rustcore ", env!("CARGO_PKG_VERSION")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootproto::PointerRange;
    use std::boxed::Box;

    #[test]
    fn command_line_comes_from_boot_info_once() {
        static RAW: &[u8] = b"root=/dev/ram0 rootfs=initfs acpi=disabled";
        let mut info = BootInfo::empty();
        info.cmdline = PointerRange::from_slice(RAW);
        let info: &'static BootInfo = Box::leak(Box::new(info));

        let parsed = init(Some(info));
        assert_eq!(parsed.get("root"), Some("/dev/ram0"));
        assert!(!parsed.enabled("acpi"));
        assert!(core::ptr::eq(cmdline(), parsed));
        assert!(boot_info().is_some());
        assert_eq!(rsdp(), None);
        assert!(memory_map().is_empty());

        let again = init(None);
        assert_eq!(again.get("rootfs"), Some("initfs"));
    }

    #[test]
    fn epoch_is_recorded_once() {
        assert_eq!(record_epoch(1_700_000_000), 1_700_000_000);
        assert_eq!(record_epoch(5), 1_700_000_000);
        assert_eq!(unix_epoch(), Some(1_700_000_000));
    }

    #[test]
    fn build_id_names_the_kernel() {
        assert!(!build_id().is_empty());
    }
}
