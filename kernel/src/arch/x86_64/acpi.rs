//! ACPI table discovery. Tables are read in place through the identity map.

use core::{mem::size_of, ptr, slice};

use log::{debug, info};
use spin::Once;

use crate::error::InitError;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const BIOS_AREA: (u64, u64) = (0xE_0000, 0x10_0000);
const DSDT_OFFSET: usize = 40;
const X_DSDT_OFFSET: usize = 140;

#[allow(dead_code)]
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt: u32,
    // Revision 2 and later.
    length: u32,
    xsdt: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

const RSDP_V1_LEN: usize = 20;

#[allow(dead_code)]
#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[derive(Clone, Copy)]
struct RootTable {
    address: u64,
    entry_size: usize,
}

static ROOT: Once<RootTable> = Once::new();

fn checksum_ok(address: u64, len: usize) -> bool {
    // SAFETY: callers pass firmware tables inside the identity map.
    let bytes = unsafe { slice::from_raw_parts(address as *const u8, len) };
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte)) == 0
}

fn find_rsdp(hint: Option<u64>) -> Option<u64> {
    let has_signature = |address: u64| {
        // SAFETY: see `checksum_ok`.
        unsafe { ptr::read_unaligned(address as *const [u8; 8]) == *RSDP_SIGNATURE }
    };
    if let Some(address) = hint.filter(|&address| has_signature(address)) {
        return Some(address);
    }
    (BIOS_AREA.0..BIOS_AREA.1)
        .step_by(16)
        .find(|&address| has_signature(address))
}

fn header(address: u64) -> SdtHeader {
    // SAFETY: see `checksum_ok`.
    unsafe { ptr::read_unaligned(address as *const SdtHeader) }
}

fn valid_table(address: u64, signature: &[u8; 4]) -> bool {
    let SdtHeader {
        signature: found,
        length,
        ..
    } = header(address);
    found == *signature && checksum_ok(address, length as usize)
}

/// Locates and validates the RSDP and root table; returns how many tables
/// the root lists.
pub(super) fn init(hint: Option<u64>) -> Result<usize, InitError> {
    let address = find_rsdp(hint).ok_or(InitError::Missing("RSDP"))?;
    if !checksum_ok(address, RSDP_V1_LEN) {
        return Err(InitError::Invalid("RSDP checksum"));
    }
    // SAFETY: the signature matched and the checksum covers these bytes.
    let rsdp = unsafe { ptr::read_unaligned(address as *const Rsdp) };
    let (revision, xsdt, length) = (rsdp.revision, rsdp.xsdt, rsdp.length);

    let root = if revision >= 2 && xsdt != 0 {
        if !checksum_ok(address, length as usize) {
            return Err(InitError::Invalid("RSDP extended checksum"));
        }
        if !valid_table(xsdt, b"XSDT") {
            return Err(InitError::Invalid("XSDT"));
        }
        RootTable {
            address: xsdt,
            entry_size: size_of::<u64>(),
        }
    } else {
        let rsdt = u64::from(rsdp.rsdt);
        if !valid_table(rsdt, b"RSDT") {
            return Err(InitError::Invalid("RSDT"));
        }
        RootTable {
            address: rsdt,
            entry_size: size_of::<u32>(),
        }
    };

    let tables = entries(root).count();
    info!("acpi: revision {} root at {:#x}, {} table(s)", revision, root.address, tables);
    ROOT.call_once(|| root);
    Ok(tables)
}

fn entries(root: RootTable) -> impl Iterator<Item = u64> {
    let length = header(root.address).length as usize;
    let first = root.address + size_of::<SdtHeader>() as u64;
    let count = length.saturating_sub(size_of::<SdtHeader>()) / root.entry_size;
    (0..count).map(move |idx| {
        let slot = first + (idx * root.entry_size) as u64;
        // SAFETY: slots lie inside the checksummed root table.
        unsafe {
            if root.entry_size == size_of::<u64>() {
                ptr::read_unaligned(slot as *const u64)
            } else {
                u64::from(ptr::read_unaligned(slot as *const u32))
            }
        }
    })
}

fn find(signature: &[u8; 4]) -> Option<u64> {
    let root = *ROOT.get()?;
    entries(root).find(|&address| header(address).signature == *signature)
}

/// Checks the definition block the AML namespace is built from: FADT, then
/// the DSDT it points at.
pub(super) fn load_namespace() -> Result<(), InitError> {
    let fadt = find(b"FACP").ok_or(InitError::Missing("FADT"))?;
    if !checksum_ok(fadt, header(fadt).length as usize) {
        return Err(InitError::Invalid("FADT checksum"));
    }
    let fadt_len = header(fadt).length as usize;
    // SAFETY: both fields sit inside the FADT when its length covers them.
    let dsdt = unsafe {
        if fadt_len >= X_DSDT_OFFSET + size_of::<u64>() {
            ptr::read_unaligned((fadt + X_DSDT_OFFSET as u64) as *const u64)
        } else {
            0
        }
    };
    let dsdt = if dsdt != 0 {
        dsdt
    } else {
        u64::from(unsafe { ptr::read_unaligned((fadt + DSDT_OFFSET as u64) as *const u32) })
    };
    if dsdt == 0 || !valid_table(dsdt, b"DSDT") {
        return Err(InitError::Invalid("DSDT"));
    }
    let aml = header(dsdt).length as usize - size_of::<SdtHeader>();
    debug!("acpi: DSDT at {:#x}", dsdt);
    info!("acpi: namespace definition block holds {} byte(s) of AML", aml);
    Ok(())
}
