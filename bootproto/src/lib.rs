#![no_std]

//! Bootloader-to-kernel handoff structures shared between the Rustcore kernel
//! and any stage-0 loader. The format is intentionally plain C so a loader can
//! populate the fields without depending on Rust support libraries.

use core::marker::PhantomData;

/// Increment the version each time the layout of [`BootInfo`] changes.
pub const BOOTINFO_VERSION: u16 = 2;

/// Longest command line a loader may hand over, in bytes.
pub const CMDLINE_MAX: usize = 1024;

/// Describes the execution environment prepared by the boot loader.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BootInfo {
    /// Format version for compatibility checks.
    pub version: u16,
    /// Reserved for future flags (must be zero for now).
    pub flags: u16,
    /// Bounds of the bootloader-provided memory map.
    pub memory_map: PointerRange<MemoryRegion>,
    /// ACPI RSDP physical address when available.
    pub rsdp: u64,
    /// Kernel command line, UTF-8 without a terminating NUL.
    pub cmdline: PointerRange<u8>,
}

impl BootInfo {
    /// A record with no memory map, no RSDP and an empty command line.
    pub const fn empty() -> Self {
        Self {
            version: BOOTINFO_VERSION,
            flags: 0,
            memory_map: PointerRange::empty(),
            rsdp: 0,
            cmdline: PointerRange::empty(),
        }
    }

    /// Returns `true` when the structure is considered compatible with the
    /// current kernel expectations.
    pub fn is_compatible(&self) -> bool {
        self.version == BOOTINFO_VERSION && self.cmdline.len as usize <= CMDLINE_MAX
    }
}

/// A pointer + length pair that describes an array of `T` in physical memory.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PointerRange<T> {
    pub base: u64,
    pub len: u64,
    #[doc(hidden)]
    pub marker: PhantomData<T>,
}

impl<T> PointerRange<T> {
    /// A helper to construct an empty pointer range.
    pub const fn empty() -> Self {
        Self {
            base: 0,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Describes `slice` in place. Only meaningful while the slice outlives
    /// the record, which holds for statics and identity-mapped loader memory.
    pub fn from_slice(slice: &[T]) -> Self {
        Self {
            base: slice.as_ptr() as u64,
            len: slice.len() as u64,
            marker: PhantomData,
        }
    }

    /// Returns true if no elements are described.
    pub const fn is_empty(&self) -> bool {
        self.len == 0 || self.base == 0
    }

    /// Views the described array.
    ///
    /// # Safety
    /// `base` must point at `len` initialized elements that stay valid and
    /// unmodified for `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [T] {
        if self.is_empty() {
            &[]
        } else {
            core::slice::from_raw_parts(self.base as *const T, self.len as usize)
        }
    }
}

/// Entry in the physical memory map provided by firmware.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    /// First address past the region.
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Memory classifications understood by the kernel during early boot.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    UsableRam = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Mmio = 5,
}
