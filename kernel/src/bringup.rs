//! Hardware bring-up: the fixed order in which the boot context initializes
//! the machine before the scheduler exists.
//!
//! The order is load-bearing. Display and clock setup go through firmware
//! real-mode calls, which are only possible before interrupt sources are
//! flushed; [`FirmwareWindow`] makes that boundary a compile-time fact, since
//! only this module can mint one and it is consumed once the clock is read.
//! Processor bring-up and the power-management namespace need interrupts,
//! and everything else runs with them masked.

use core::fmt;

use log::{debug, error, info};

use crate::cmdline::CommandLine;
use crate::error::{BootError, InitError};
use crate::time::{unix_epoch, RtcTime};

/// One initializer in the bring-up sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    InterruptTable,
    CpuFeatures,
    MemoryMap,
    PhysicalMemory,
    Random,
    VirtualMemory,
    Display,
    Console,
    Clock,
    FlushIrqs,
    PowerTables,
    InterruptController,
    Timer,
    Bus,
    Multiprocessor,
    Namespace,
}

impl Stage {
    /// Every stage in execution order.
    pub const SEQUENCE: [Stage; 16] = [
        Stage::InterruptTable,
        Stage::CpuFeatures,
        Stage::MemoryMap,
        Stage::PhysicalMemory,
        Stage::Random,
        Stage::VirtualMemory,
        Stage::Display,
        Stage::Console,
        Stage::Clock,
        Stage::FlushIrqs,
        Stage::PowerTables,
        Stage::InterruptController,
        Stage::Timer,
        Stage::Bus,
        Stage::Multiprocessor,
        Stage::Namespace,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Stage::InterruptTable => "interrupt table",
            Stage::CpuFeatures => "cpu features",
            Stage::MemoryMap => "memory map",
            Stage::PhysicalMemory => "physical memory",
            Stage::Random => "random",
            Stage::VirtualMemory => "virtual memory",
            Stage::Display => "display",
            Stage::Console => "console",
            Stage::Clock => "clock",
            Stage::FlushIrqs => "irq flush",
            Stage::PowerTables => "power tables",
            Stage::InterruptController => "interrupt controller",
            Stage::Timer => "timer",
            Stage::Bus => "bus",
            Stage::Multiprocessor => "multiprocessor",
            Stage::Namespace => "acpi namespace",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Proof that firmware calls are still allowed.
pub struct FirmwareWindow {
    _private: (),
}

impl FirmwareWindow {
    fn close(self) {
        debug!("bringup: firmware window closed");
    }
}

pub type InitResult = Result<(), InitError>;

/// The machine-specific initializers, called by [`run`] in order.
pub trait Platform {
    fn init_interrupts(&mut self) -> InitResult;
    fn init_cpu_features(&mut self) -> InitResult;
    fn init_memory_map(&mut self) -> InitResult;
    fn init_physical_memory(&mut self) -> InitResult;
    fn init_random(&mut self) -> InitResult;
    fn init_virtual_memory(&mut self) -> InitResult;
    fn init_display(&mut self, firmware: &FirmwareWindow) -> InitResult;
    fn init_console(&mut self) -> InitResult;
    fn read_clock(&mut self, firmware: &FirmwareWindow) -> Result<RtcTime, InitError>;
    fn flush_irqs(&mut self) -> InitResult;
    fn init_power_tables(&mut self) -> InitResult;
    fn init_interrupt_controller(&mut self) -> InitResult;
    fn init_timer(&mut self) -> InitResult;
    fn init_bus(&mut self) -> InitResult;
    /// Starts the application processors; returns how many cores are online.
    fn init_multiprocessor(&mut self) -> Result<usize, InitError>;
    fn init_namespace(&mut self) -> InitResult;
    fn enable_interrupts(&mut self);
    fn disable_interrupts(&mut self);
}

/// What bring-up learned about the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bringup {
    pub time: RtcTime,
    pub epoch: u64,
    pub cpus: usize,
    pub namespace: bool,
}

fn stage<T>(stage: Stage, result: Result<T, InitError>) -> Result<T, BootError> {
    match result {
        Ok(value) => {
            debug!("bringup: {} ready", stage);
            Ok(value)
        }
        Err(err) => {
            error!("bringup: {} failed: {}", stage, err);
            Err(BootError::Bringup { stage, error: err })
        }
    }
}

// The stages that run with interrupts enabled. The caller masks them again
// whatever the outcome.
fn interrupt_window<P: Platform + ?Sized>(
    platform: &mut P,
    cmdline: &CommandLine<'_>,
) -> Result<(usize, bool), BootError> {
    let cpus = stage(Stage::Multiprocessor, platform.init_multiprocessor())?;
    info!("bringup: {} processor(s) online", cpus);

    let namespace = cmdline.enabled("acpi");
    if namespace {
        stage(Stage::Namespace, platform.init_namespace())?;
    } else {
        info!("bringup: ACPI namespace disabled on the command line");
    }
    Ok((cpus, namespace))
}

/// Runs every initializer once, in order. The first failure stops the
/// sequence; later stages are never called.
pub fn run<P: Platform + ?Sized>(
    platform: &mut P,
    cmdline: &CommandLine<'_>,
) -> Result<Bringup, BootError> {
    info!("Kernel booted");
    info!("Build: {}", crate::boot::build_id());
    info!("Command line: {}", cmdline.raw());

    stage(Stage::InterruptTable, platform.init_interrupts())?;
    stage(Stage::CpuFeatures, platform.init_cpu_features())?;
    stage(Stage::MemoryMap, platform.init_memory_map())?;
    stage(Stage::PhysicalMemory, platform.init_physical_memory())?;
    stage(Stage::Random, platform.init_random())?;
    stage(Stage::VirtualMemory, platform.init_virtual_memory())?;

    let firmware = FirmwareWindow { _private: () };
    stage(Stage::Display, platform.init_display(&firmware))?;
    stage(Stage::Console, platform.init_console())?;
    let time = stage(Stage::Clock, platform.read_clock(&firmware))?;
    if !time.is_valid() {
        return stage(Stage::Clock, Err(InitError::Invalid("real-time clock reading")));
    }
    firmware.close();

    info!("Current date & time: {}", time);
    let epoch = unix_epoch(&time);
    info!("Current unix epoch: {}", epoch);

    stage(Stage::FlushIrqs, platform.flush_irqs())?;
    stage(Stage::PowerTables, platform.init_power_tables())?;
    stage(Stage::InterruptController, platform.init_interrupt_controller())?;
    stage(Stage::Timer, platform.init_timer())?;
    stage(Stage::Bus, platform.init_bus())?;

    platform.enable_interrupts();
    let window = interrupt_window(platform, cmdline);
    platform.disable_interrupts();
    let (cpus, namespace) = window?;

    Ok(Bringup {
        time,
        epoch,
        cpus,
        namespace,
    })
}
