//! Real-time clock in the CMOS.

use super::io;
use crate::time::RtcTime;

const ADDRESS: u16 = 0x70;
const DATA: u16 = 0x71;

// Keeps NMIs masked while a register is selected.
const NMI_DISABLE: u8 = 0x80;

const SECONDS: u8 = 0x00;
const MINUTES: u8 = 0x02;
const HOURS: u8 = 0x04;
const DAY: u8 = 0x07;
const MONTH: u8 = 0x08;
const YEAR: u8 = 0x09;
const CENTURY: u8 = 0x32;
const STATUS_A: u8 = 0x0A;
const STATUS_B: u8 = 0x0B;

const UPDATE_IN_PROGRESS: u8 = 1 << 7;
const BINARY_MODE: u8 = 1 << 2;
const HOURS_24: u8 = 1 << 1;
const PM: u8 = 1 << 7;

#[derive(Clone, Copy, PartialEq, Eq)]
struct Raw {
    second: u8,
    minute: u8,
    hour: u8,
    day: u8,
    month: u8,
    year: u8,
    century: u8,
}

fn read_register(register: u8) -> u8 {
    unsafe {
        io::out_u8(ADDRESS, NMI_DISABLE | register);
        io::in_u8(DATA)
    }
}

fn snapshot() -> Raw {
    while read_register(STATUS_A) & UPDATE_IN_PROGRESS != 0 {
        core::hint::spin_loop();
    }
    Raw {
        second: read_register(SECONDS),
        minute: read_register(MINUTES),
        hour: read_register(HOURS),
        day: read_register(DAY),
        month: read_register(MONTH),
        year: read_register(YEAR),
        century: read_register(CENTURY),
    }
}

fn from_bcd(value: u8) -> u8 {
    (value & 0x0F) + (value >> 4) * 10
}

/// Reads the clock, retrying until two consecutive snapshots agree so an
/// update mid-read cannot tear the result.
pub(super) fn read() -> RtcTime {
    let mut raw = snapshot();
    loop {
        let again = snapshot();
        if again == raw {
            break;
        }
        raw = again;
    }

    let status = read_register(STATUS_B);
    let binary = status & BINARY_MODE != 0;
    let decode = |value: u8| if binary { value } else { from_bcd(value) };

    let pm = raw.hour & PM != 0;
    let mut hour = decode(raw.hour & !PM);
    if status & HOURS_24 == 0 {
        hour %= 12;
        if pm {
            hour += 12;
        }
    }

    let century = match decode(raw.century) {
        19..=99 => u16::from(decode(raw.century)),
        // No century register: assume the 2000s.
        _ => 20,
    };

    RtcTime::new(
        century * 100 + u16::from(decode(raw.year)),
        decode(raw.month),
        decode(raw.day),
        hour,
        decode(raw.minute),
        decode(raw.second),
    )
}
