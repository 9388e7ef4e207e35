use core::arch::asm;

mod acpi;
mod cmos;
pub mod console;
mod cpu;
mod machine;
mod pci;

pub use machine::{Machine, FRAMES};

/// Enables maskable interrupts.
pub fn enable_interrupts() {
    unsafe {
        // SAFETY: `sti` depends on a well-formed IDT, which bring-up installs first.
        asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Disables maskable interrupts.
pub fn disable_interrupts() {
    unsafe {
        // SAFETY: `cli` simply clears the IF flag; callers are responsible for progress.
        asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Returns true when the CPU interrupt flag is set.
pub fn interrupts_enabled() -> bool {
    let rflags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {0}",
            out(reg) rflags,
            options(nomem, preserves_flags)
        );
    }
    rflags & (1 << 9) != 0
}

/// Sleeps until the next interrupt. Interrupts must be enabled.
pub fn wait_for_interrupt() {
    unsafe {
        asm!("hlt", options(nomem, nostack));
    }
}

/// Stops this processor for good.
pub fn halt() -> ! {
    disable_interrupts();
    loop {
        unsafe {
            // SAFETY: with IF clear only NMIs wake the core, and it halts again.
            asm!("hlt", options(nomem, nostack));
        }
    }
}

pub fn timer_ticks() -> u64 {
    interrupts::timer_ticks()
}

/// Brings up COM1 so logging works before anything else is initialized.
pub fn early_serial() {
    unsafe { serial::init() }
}

mod descriptor {
    use core::{arch::asm, mem::size_of, ptr};

    #[repr(C, packed)]
    struct DescriptorTablePointer {
        limit: u16,
        base: u64,
    }

    #[repr(C, align(16))]
    struct TaskStateSegment {
        _reserved1: u32,
        rsp: [u64; 3],
        _reserved2: u64,
        ist: [u64; 7],
        _reserved3: u64,
        _reserved4: u16,
        iomap_base: u16,
    }

    impl TaskStateSegment {
        const fn new() -> Self {
            Self {
                _reserved1: 0,
                rsp: [0; 3],
                _reserved2: 0,
                ist: [0; 7],
                _reserved3: 0,
                _reserved4: 0,
                iomap_base: size_of::<Self>() as u16,
            }
        }
    }

    // Stack the double-fault handler switches to, so a blown kernel stack
    // still gets reported.
    const FAULT_STACK_SIZE: usize = 4096 * 4;

    #[repr(align(16))]
    struct FaultStack([u8; FAULT_STACK_SIZE]);

    static mut FAULT_STACK: FaultStack = FaultStack([0; FAULT_STACK_SIZE]);

    /// Interrupt stack table slot holding the fault stack.
    pub(super) const FAULT_IST: u16 = 1;

    // Null, code, data, TSS (low), TSS (high).
    const GDT_ENTRIES: usize = 5;

    static mut GDT: [u64; GDT_ENTRIES] = [0; GDT_ENTRIES];
    static mut TSS: TaskStateSegment = TaskStateSegment::new();

    pub(super) const KERNEL_CODE_SELECTOR: u16 = 0x08;
    const KERNEL_DATA_SELECTOR: u16 = 0x10;
    const TSS_SELECTOR: u16 = 0x18;

    const KERNEL_CODE: u64 = 0x00af_9a00_0000_ffff;
    const KERNEL_DATA: u64 = 0x00af_9200_0000_ffff;

    #[allow(static_mut_refs)]
    pub(super) unsafe fn init() {
        TSS.ist[usize::from(FAULT_IST) - 1] =
            ptr::addr_of!(FAULT_STACK) as u64 + FAULT_STACK_SIZE as u64;

        GDT[0] = 0;
        GDT[1] = KERNEL_CODE;
        GDT[2] = KERNEL_DATA;

        let (tss_low, tss_high) = tss_descriptor(ptr::addr_of!(TSS));
        GDT[3] = tss_low;
        GDT[4] = tss_high;

        let descriptor = DescriptorTablePointer {
            limit: (GDT_ENTRIES * size_of::<u64>() - 1) as u16,
            base: ptr::addr_of!(GDT[0]) as u64,
        };

        // SAFETY: Pointer references the statically allocated GDT.
        asm!("lgdt [{0}]", in(reg) &descriptor, options(readonly, nostack));

        reload_segment_selectors();
        asm!("ltr {0:x}", in(reg) TSS_SELECTOR, options(nostack));
    }

    fn tss_descriptor(tss: *const TaskStateSegment) -> (u64, u64) {
        let base = tss as u64;
        let limit = (size_of::<TaskStateSegment>() - 1) as u64;

        let lower = (limit & 0xFFFF)
            | ((base & 0xFFFF) << 16)
            | ((base >> 16 & 0xFF) << 32)
            | (0x89u64 << 40)
            | ((limit >> 16 & 0xF) << 48)
            | ((base >> 24 & 0xFF) << 56);

        (lower, base >> 32)
    }

    unsafe fn reload_segment_selectors() {
        asm!(
            "push {sel}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            sel = const KERNEL_CODE_SELECTOR as u64,
            tmp = lateout(reg) _,
            options(nostack)
        );

        asm!(
            "mov ds, ax",
            "mov es, ax",
            "mov ss, ax",
            in("ax") KERNEL_DATA_SELECTOR,
            options(nomem, preserves_flags)
        );
    }
}

mod interrupts {
    use core::sync::atomic::{AtomicU64, Ordering};
    use core::{arch::asm, mem::size_of, ptr};

    use super::{descriptor, pic};

    #[repr(C, packed)]
    struct DescriptorTablePointer {
        limit: u16,
        base: u64,
    }

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct IdtEntry {
        offset_low: u16,
        selector: u16,
        options: u16,
        offset_mid: u16,
        offset_high: u32,
        reserved: u32,
    }

    impl IdtEntry {
        const fn missing() -> Self {
            Self {
                offset_low: 0,
                selector: 0,
                options: 0,
                offset_mid: 0,
                offset_high: 0,
                reserved: 0,
            }
        }

        fn new(handler: u64, ist: u16) -> Self {
            Self {
                offset_low: handler as u16,
                selector: descriptor::KERNEL_CODE_SELECTOR,
                // Present, ring 0, 64-bit interrupt gate.
                options: 0x8E00 | (ist & 0x7),
                offset_mid: (handler >> 16) as u16,
                offset_high: (handler >> 32) as u32,
                reserved: 0,
            }
        }
    }

    #[repr(C, align(16))]
    struct Idt {
        entries: [IdtEntry; 256],
    }

    static mut IDT: Idt = Idt {
        entries: [IdtEntry::missing(); 256],
    };

    static TIMER_TICKS: AtomicU64 = AtomicU64::new(0);

    type Handler = extern "x86-interrupt" fn(InterruptStackFrame);
    type HandlerWithCode = extern "x86-interrupt" fn(InterruptStackFrame, u64);
    type DivergingWithCode = extern "x86-interrupt" fn(InterruptStackFrame, u64) -> !;

    #[derive(Debug)]
    #[repr(C)]
    pub struct InterruptStackFrame {
        pub instruction_pointer: u64,
        pub code_segment: u64,
        pub cpu_flags: u64,
        pub stack_pointer: u64,
        pub stack_segment: u64,
    }

    #[repr(u8)]
    #[derive(Clone, Copy)]
    enum Vector {
        DoubleFault = 8,
        GeneralProtection = 13,
        PageFault = 14,
        Timer = 32,
        PrimarySpurious = 0x27,
        SecondarySpurious = 0x2F,
    }

    #[allow(static_mut_refs)]
    unsafe fn set(vector: Vector, handler: u64, ist: u16) {
        IDT.entries[vector as usize] = IdtEntry::new(handler, ist);
    }

    #[allow(static_mut_refs)]
    pub(super) unsafe fn init() {
        set(
            Vector::DoubleFault,
            double_fault as DivergingWithCode as usize as u64,
            descriptor::FAULT_IST,
        );
        set(Vector::GeneralProtection, general_protection as HandlerWithCode as usize as u64, 0);
        set(Vector::PageFault, page_fault as HandlerWithCode as usize as u64, 0);
        set(Vector::Timer, timer as Handler as usize as u64, 0);
        set(Vector::PrimarySpurious, spurious as Handler as usize as u64, 0);
        set(Vector::SecondarySpurious, spurious as Handler as usize as u64, 0);

        let descriptor = DescriptorTablePointer {
            limit: (size_of::<Idt>() - 1) as u16,
            base: ptr::addr_of!(IDT) as u64,
        };

        asm!("lidt [{0}]", in(reg) &descriptor, options(readonly, nostack));
    }

    extern "x86-interrupt" fn timer(_frame: InterruptStackFrame) {
        TIMER_TICKS.fetch_add(1, Ordering::Relaxed);
        pic::end_of_interrupt(0);
    }

    extern "x86-interrupt" fn spurious(_frame: InterruptStackFrame) {}

    extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, code: u64) {
        panic!("general protection fault (code {:#x}) at {:#x}", code, frame.instruction_pointer);
    }

    extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, code: u64) {
        let address: u64;
        unsafe {
            asm!("mov {}, cr2", out(reg) address, options(nomem, nostack, preserves_flags));
        }
        panic!(
            "page fault at {:#x} (code {:#x}) from {:#x}",
            address, code, frame.instruction_pointer
        );
    }

    extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, _code: u64) -> ! {
        panic!("double fault at {:#x}", frame.instruction_pointer);
    }

    pub fn timer_ticks() -> u64 {
        TIMER_TICKS.load(Ordering::Relaxed)
    }
}

mod paging {
    use core::{arch::asm, ptr};

    #[repr(align(4096))]
    struct PageTable {
        entries: [u64; 512],
    }

    impl PageTable {
        const fn new() -> Self {
            Self { entries: [0; 512] }
        }
    }

    static mut PML4: PageTable = PageTable::new();
    static mut PDP: PageTable = PageTable::new();
    static mut PD: PageTable = PageTable::new();

    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const HUGE: u64 = 1 << 7;

    const HUGE_PAGE: u64 = 2 * 1024 * 1024;

    /// Bytes identity-mapped by [`init`].
    pub(super) const MAPPED: u64 = 512 * HUGE_PAGE;

    /// Identity-maps the first gigabyte with 2 MiB pages and switches to it.
    #[allow(static_mut_refs)]
    pub(super) unsafe fn init() {
        PML4.entries[0] = (ptr::addr_of!(PDP) as u64) | PRESENT | WRITABLE;
        PDP.entries[0] = (ptr::addr_of!(PD) as u64) | PRESENT | WRITABLE;

        for (idx, entry) in PD.entries.iter_mut().enumerate() {
            *entry = (idx as u64 * HUGE_PAGE) | PRESENT | WRITABLE | HUGE;
        }

        let root_table = ptr::addr_of!(PML4) as u64;
        asm!("mov cr3, {0}", in(reg) root_table, options(nostack, preserves_flags));
    }
}

mod io {
    use core::arch::asm;

    #[inline]
    pub unsafe fn out_u8(port: u16, value: u8) {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }

    #[inline]
    pub unsafe fn in_u8(port: u16) -> u8 {
        let value: u8;
        asm!(
            "in al, dx",
            in("dx") port,
            out("al") value,
            options(nomem, nostack, preserves_flags)
        );
        value
    }

    #[inline]
    pub unsafe fn out_u32(port: u16, value: u32) {
        asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
    }

    #[inline]
    pub unsafe fn in_u32(port: u16) -> u32 {
        let value: u32;
        asm!(
            "in eax, dx",
            in("dx") port,
            out("eax") value,
            options(nomem, nostack, preserves_flags)
        );
        value
    }

    #[inline]
    pub unsafe fn io_wait() {
        asm!("out 0x80, al", in("al") 0_u8, options(nomem, nostack, preserves_flags));
    }
}

mod serial {
    use super::io;

    const COM1: u16 = 0x3F8;

    const LINE_STATUS: u16 = COM1 + 5;
    const DATA_READY: u8 = 1 << 0;
    const TRANSMIT_EMPTY: u8 = 1 << 5;

    pub(super) unsafe fn init() {
        io::out_u8(COM1 + 1, 0x00); // Disable interrupts
        io::out_u8(COM1 + 3, 0x80); // Enable DLAB
        io::out_u8(COM1, 0x03); // Divisor low (38400 baud)
        io::out_u8(COM1 + 1, 0x00); // Divisor high
        io::out_u8(COM1 + 3, 0x03); // 8 bits, no parity, one stop
        io::out_u8(COM1 + 2, 0xC7); // Enable FIFO, clear, 14-byte threshold
        io::out_u8(COM1 + 4, 0x03); // RTS/DSR set, polled
    }

    pub(super) fn write_bytes(bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                write_byte(b'\r');
            }
            write_byte(byte);
        }
    }

    pub(super) fn write_byte(byte: u8) {
        unsafe {
            while (io::in_u8(LINE_STATUS) & TRANSMIT_EMPTY) == 0 {
                core::hint::spin_loop();
            }
            io::out_u8(COM1, byte);
        }
    }

    /// Waits for the next received byte.
    pub(super) fn read_byte() -> u8 {
        unsafe {
            while (io::in_u8(LINE_STATUS) & DATA_READY) == 0 {
                core::hint::spin_loop();
            }
            io::in_u8(COM1)
        }
    }
}

mod pic {
    use super::io;

    const PIC1_CMD: u16 = 0x20;
    const PIC1_DATA: u16 = 0x21;
    const PIC2_CMD: u16 = 0xA0;
    const PIC2_DATA: u16 = 0xA1;

    const ICW1_INIT: u8 = 0x10;
    const ICW1_ICW4: u8 = 0x01;
    const ICW4_8086: u8 = 0x01;
    const PIC1_OFFSET: u8 = 0x20;
    const PIC2_OFFSET: u8 = 0x28;
    const PIC_EOI: u8 = 0x20;

    /// Masks every line and acknowledges anything latched during firmware
    /// calls.
    pub(super) unsafe fn flush() {
        mask_all();
        io::out_u8(PIC2_CMD, PIC_EOI);
        io::out_u8(PIC1_CMD, PIC_EOI);
    }

    pub(super) unsafe fn mask_all() {
        io::out_u8(PIC1_DATA, 0xFF);
        io::out_u8(PIC2_DATA, 0xFF);
    }

    /// Remaps both controllers above the exception vectors, all lines masked.
    pub(super) unsafe fn init() {
        io::out_u8(PIC1_CMD, ICW1_INIT | ICW1_ICW4);
        io::io_wait();
        io::out_u8(PIC2_CMD, ICW1_INIT | ICW1_ICW4);
        io::io_wait();

        io::out_u8(PIC1_DATA, PIC1_OFFSET);
        io::io_wait();
        io::out_u8(PIC2_DATA, PIC2_OFFSET);
        io::io_wait();

        // Tell Master PIC about the slave at IRQ2, and vice versa.
        io::out_u8(PIC1_DATA, 0x04);
        io::io_wait();
        io::out_u8(PIC2_DATA, 0x02);
        io::io_wait();

        io::out_u8(PIC1_DATA, ICW4_8086);
        io::io_wait();
        io::out_u8(PIC2_DATA, ICW4_8086);
        io::io_wait();

        mask_all();
    }

    pub(super) fn end_of_interrupt(irq: u8) {
        unsafe {
            if irq >= 8 {
                io::out_u8(PIC2_CMD, PIC_EOI);
            }
            io::out_u8(PIC1_CMD, PIC_EOI);
        }
    }

    pub(super) fn unmask_irq(irq: u8) {
        let (port, line) = if irq < 8 {
            (PIC1_DATA, irq)
        } else {
            (PIC2_DATA, irq - 8)
        };
        unsafe {
            let mask = io::in_u8(port) & !(1 << line);
            io::out_u8(port, mask);
        }
    }
}

mod pit {
    use super::io;

    const PIT_FREQUENCY_HZ: u64 = 1_193_182;
    const PIT_CHANNEL0: u16 = 0x40;
    const PIT_COMMAND: u16 = 0x43;

    pub(super) unsafe fn start_periodic(hz: u32) {
        let hz = hz.clamp(19, 1000); // keep divisor within 16-bit range
        let divisor = (PIT_FREQUENCY_HZ / hz as u64) as u16;

        // Channel 0, access low/high, mode 3 (square wave).
        io::out_u8(PIT_COMMAND, 0x36);
        io::out_u8(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        io::out_u8(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
}
