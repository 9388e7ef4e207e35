//! Processor control. Bare-metal x86_64 builds drive the hardware; any other
//! build gets inert stand-ins so the boot logic runs in hosted tests.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::{disable_interrupts, enable_interrupts, halt, interrupts_enabled, wait_for_interrupt};

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hosted;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use self::hosted::{disable_interrupts, enable_interrupts, halt, interrupts_enabled, wait_for_interrupt};
