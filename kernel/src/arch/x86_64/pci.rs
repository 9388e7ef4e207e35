//! PCI enumeration through configuration mechanism #1.

use log::debug;

use super::io;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const NO_DEVICE: u16 = 0xFFFF;
const MULTIFUNCTION: u8 = 0x80;

fn read_config(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    let address = (1 << 31)
        | (u32::from(bus) << 16)
        | (u32::from(device) << 11)
        | (u32::from(function) << 8)
        | u32::from(offset & 0xFC);
    unsafe {
        io::out_u32(CONFIG_ADDRESS, address);
        io::in_u32(CONFIG_DATA)
    }
}

fn vendor(bus: u8, device: u8, function: u8) -> u16 {
    read_config(bus, device, function, 0x00) as u16
}

fn header_type(bus: u8, device: u8) -> u8 {
    (read_config(bus, device, 0, 0x0C) >> 16) as u8
}

/// Walks every bus and returns how many functions answered.
pub(super) fn scan() -> usize {
    let mut found = 0;
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            if vendor(bus, device, 0) == NO_DEVICE {
                continue;
            }
            let functions = if header_type(bus, device) & MULTIFUNCTION != 0 { 8 } else { 1 };
            for function in 0..functions {
                let vendor_id = vendor(bus, device, function);
                if vendor_id == NO_DEVICE {
                    continue;
                }
                let class = read_config(bus, device, function, 0x08) >> 16;
                debug!(
                    "pci: {:02x}:{:02x}.{} vendor {:04x} class {:04x}",
                    bus, device, function, vendor_id, class
                );
                found += 1;
            }
        }
    }
    found
}
