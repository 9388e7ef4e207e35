use bootproto::{MemoryRegion, MemoryRegionKind};
use log::{info, warn};

use super::{acpi, cmos, console, cpu, descriptor, interrupts, paging, pci, pic, pit};
use crate::boot;
use crate::bringup::{FirmwareWindow, InitResult, Platform};
use crate::error::InitError;
use crate::logger;
use crate::memory::{FrameAllocator, MemoryMap, FRAME_SIZE};
use crate::sync::SpinLock;
use crate::time::RtcTime;

const TIMER_HZ: u32 = 100;
// Several timer periods on any processor fast enough to run this kernel.
const TIMER_PATIENCE_CYCLES: u64 = 500_000_000;

// Used when the loader hands over no map: conventional memory plus 64 MiB
// above the ISA hole.
static FALLBACK_MAP: [MemoryRegion; 2] = [
    MemoryRegion {
        base: 0,
        length: 0x9_F000,
        kind: MemoryRegionKind::UsableRam,
    },
    MemoryRegion {
        base: 0x10_0000,
        length: 64 * 1024 * 1024,
        kind: MemoryRegionKind::UsableRam,
    },
];

/// Physical frames handed out after bring-up.
pub static FRAMES: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

/// The PC this kernel runs on.
pub struct Machine {
    features: cpu::CpuFeatures,
    map: Option<MemoryMap>,
    seed: u64,
}

impl Machine {
    pub const fn new() -> Self {
        Self {
            features: cpu::CpuFeatures::empty(),
            map: None,
            seed: 0,
        }
    }

    /// Entropy gathered during bring-up.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for Machine {
    fn init_interrupts(&mut self) -> InitResult {
        unsafe {
            descriptor::init();
            interrupts::init();
        }
        Ok(())
    }

    fn init_cpu_features(&mut self) -> InitResult {
        self.features = cpu::detect();
        if !self.features.contains(cpu::REQUIRED) {
            return Err(InitError::Missing("SSE2-capable processor"));
        }
        unsafe { cpu::enable_simd() };
        info!("cpu: features {:?}", self.features);
        Ok(())
    }

    fn init_memory_map(&mut self) -> InitResult {
        let raw = boot::memory_map();
        let raw = if raw.is_empty() {
            warn!("memory: no firmware map, assuming {} KiB", 0x9_F000 / 1024 + 64 * 1024);
            &FALLBACK_MAP[..]
        } else {
            raw
        };
        let map = MemoryMap::from_regions(raw)?;
        info!(
            "memory: {} region(s), {} MiB usable",
            map.regions().len(),
            map.usable_bytes() / (1024 * 1024)
        );
        self.map = Some(map);
        Ok(())
    }

    fn init_physical_memory(&mut self) -> InitResult {
        let map = self.map.as_ref().ok_or(InitError::Missing("memory map"))?;
        let allocator = FrameAllocator::from_map(map);
        let free = allocator.free_frames();
        if free == 0 {
            return Err(InitError::Missing("free physical memory"));
        }
        *FRAMES.lock() = allocator;
        info!("memory: {} KiB free", free as u64 * FRAME_SIZE / 1024);
        Ok(())
    }

    fn init_random(&mut self) -> InitResult {
        let hardware = if self.features.contains(cpu::CpuFeatures::RDRAND) {
            cpu::rdrand()
        } else {
            None
        };
        self.seed = match hardware {
            Some(value) => value,
            None => {
                warn!("random: no hardware generator, seeding from the timestamp counter");
                cpu::timestamp().rotate_left(17) ^ 0x9E37_79B9_7F4A_7C15
            }
        };
        Ok(())
    }

    fn init_virtual_memory(&mut self) -> InitResult {
        let top = self.map.as_ref().map_or(0, MemoryMap::top_of_usable);
        if top > paging::MAPPED {
            warn!(
                "memory: only the first {} MiB are mapped",
                paging::MAPPED / (1024 * 1024)
            );
        }
        unsafe { paging::init() };
        Ok(())
    }

    fn init_display(&mut self, _firmware: &FirmwareWindow) -> InitResult {
        console::clear_screen();
        Ok(())
    }

    fn init_console(&mut self) -> InitResult {
        if !logger::add_sink(&console::VGA) {
            return Err(InitError::Exhausted("log sinks"));
        }
        Ok(())
    }

    fn read_clock(&mut self, _firmware: &FirmwareWindow) -> Result<RtcTime, InitError> {
        Ok(cmos::read())
    }

    fn flush_irqs(&mut self) -> InitResult {
        unsafe { pic::flush() };
        Ok(())
    }

    fn init_power_tables(&mut self) -> InitResult {
        acpi::init(boot::rsdp()).map(|_| ())
    }

    fn init_interrupt_controller(&mut self) -> InitResult {
        unsafe { pic::init() };
        Ok(())
    }

    fn init_timer(&mut self) -> InitResult {
        unsafe { pit::start_periodic(TIMER_HZ) };
        pic::unmask_irq(0);
        Ok(())
    }

    fn init_bus(&mut self) -> InitResult {
        let functions = pci::scan();
        info!("pci: {} function(s)", functions);
        Ok(())
    }

    fn init_multiprocessor(&mut self) -> Result<usize, InitError> {
        // First window with interrupts open: make sure the timer reaches us.
        let start = cpu::timestamp();
        while super::timer_ticks() == 0 {
            if cpu::timestamp().wrapping_sub(start) > TIMER_PATIENCE_CYCLES {
                warn!("timer: no tick delivered while waiting for it");
                break;
            }
            core::hint::spin_loop();
        }
        // Application processors stay parked; only the boot CPU schedules.
        Ok(1)
    }

    fn init_namespace(&mut self) -> InitResult {
        acpi::load_namespace()
    }

    fn enable_interrupts(&mut self) {
        super::enable_interrupts();
    }

    fn disable_interrupts(&mut self) {
        super::disable_interrupts();
    }
}
