//! Hosted builds have no interrupt flag to manage.

pub fn enable_interrupts() {}

pub fn disable_interrupts() {}

/// Always `false`: nothing can interrupt a hosted lock holder.
pub fn interrupts_enabled() -> bool {
    false
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
