//! Serial and VGA text consoles, exposed as log sinks and as the
//! `/dev/tty*` character devices.

use core::ptr;

use super::serial;
use crate::devices::CharDevice;
use crate::logger::Sink;
use crate::rootenv;
use crate::sync::SpinLock;

const VGA_BUFFER: usize = 0xB8000;
const COLUMNS: usize = 80;
const ROWS: usize = 25;
// Light grey on black.
const ATTRIBUTE: u16 = 0x07 << 8;

struct TextScreen {
    column: usize,
    row: usize,
}

impl TextScreen {
    const fn new() -> Self {
        Self { column: 0, row: 0 }
    }

    fn cell(row: usize, column: usize) -> *mut u16 {
        (VGA_BUFFER as *mut u16).wrapping_add(row * COLUMNS + column)
    }

    fn put(row: usize, column: usize, value: u16) {
        // SAFETY: the text buffer is identity mapped and the cell is in range.
        unsafe { ptr::write_volatile(Self::cell(row, column), value) }
    }

    fn get(row: usize, column: usize) -> u16 {
        unsafe { ptr::read_volatile(Self::cell(row, column)) }
    }

    fn clear(&mut self) {
        for row in 0..ROWS {
            self.clear_row(row);
        }
        self.row = 0;
        self.column = 0;
    }

    fn clear_row(&mut self, row: usize) {
        for column in 0..COLUMNS {
            Self::put(row, column, ATTRIBUTE | u16::from(b' '));
        }
    }

    fn newline(&mut self) {
        self.column = 0;
        if self.row + 1 < ROWS {
            self.row += 1;
            return;
        }
        for row in 1..ROWS {
            for column in 0..COLUMNS {
                Self::put(row - 1, column, Self::get(row, column));
            }
        }
        self.clear_row(ROWS - 1);
    }

    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.column = 0,
            0x08 => self.column = self.column.saturating_sub(1),
            byte => {
                if self.column == COLUMNS {
                    self.newline();
                }
                let glyph = if byte.is_ascii_graphic() || byte == b' ' { byte } else { b'?' };
                Self::put(self.row, self.column, ATTRIBUTE | u16::from(glyph));
                self.column += 1;
            }
        }
    }
}

static SCREEN: SpinLock<TextScreen> = SpinLock::new(TextScreen::new());

pub(super) fn clear_screen() {
    SCREEN.lock().clear();
}

fn screen_write(bytes: &[u8]) {
    let mut screen = SCREEN.lock();
    for &byte in bytes {
        screen.write_byte(byte);
    }
}

pub struct SerialSink;

impl Sink for SerialSink {
    fn write_str(&self, text: &str) {
        serial::write_bytes(text.as_bytes());
    }
}

pub struct VgaSink;

impl Sink for VgaSink {
    fn write_str(&self, text: &str) {
        screen_write(text.as_bytes());
    }
}

pub static SERIAL: SerialSink = SerialSink;
pub static VGA: VgaSink = VgaSink;

/// One of the text terminals. Output is mirrored to serial and the screen;
/// only the first terminal owns the serial keyboard.
pub struct Terminal {
    index: u8,
}

impl CharDevice for Terminal {
    fn write(&self, bytes: &[u8]) {
        serial::write_bytes(bytes);
        screen_write(bytes);
    }

    fn read_byte(&self) -> Option<u8> {
        if self.index != 0 {
            return None;
        }
        let byte = match serial::read_byte() {
            b'\r' => b'\n',
            // DEL from most terminal emulators.
            0x7F => 0x08,
            byte => byte,
        };
        Some(byte)
    }
}

static TTYS: [Terminal; rootenv::TERMINALS] = [
    Terminal { index: 0 },
    Terminal { index: 1 },
    Terminal { index: 2 },
    Terminal { index: 3 },
    Terminal { index: 4 },
    Terminal { index: 5 },
];

/// Device names and drivers for `/dev/tty0` through `/dev/tty5`.
pub static TERMINALS: [(&str, &dyn CharDevice); rootenv::TERMINALS] = [
    ("tty0", &TTYS[0]),
    ("tty1", &TTYS[1]),
    ("tty2", &TTYS[2]),
    ("tty3", &TTYS[3]),
    ("tty4", &TTYS[4]),
    ("tty5", &TTYS[5]),
];
