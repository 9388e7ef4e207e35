use core::arch::asm;
use core::arch::x86_64::{__cpuid, _rdtsc};

use bitflags::bitflags;

bitflags! {
    /// Features reported by `cpuid` leaf 1.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(super) struct CpuFeatures: u64 {
        const FPU = 1 << 0;
        const TSC = 1 << 4;
        const APIC = 1 << 9;
        const FXSR = 1 << 24;
        const SSE = 1 << 25;
        const SSE2 = 1 << 26;
        // ecx bits, shifted above edx.
        const SSE3 = 1 << 32;
        const SSE4_1 = 1 << (32 + 19);
        const X2APIC = 1 << (32 + 21);
        const RDRAND = 1 << (32 + 30);
    }
}

/// The baseline every x86_64 part provides and the kernel relies on.
pub(super) const REQUIRED: CpuFeatures = CpuFeatures::FPU
    .union(CpuFeatures::FXSR)
    .union(CpuFeatures::SSE)
    .union(CpuFeatures::SSE2);

pub(super) fn detect() -> CpuFeatures {
    // SAFETY: cpuid is always present in long mode.
    let leaf = unsafe { __cpuid(1) };
    CpuFeatures::from_bits_truncate(u64::from(leaf.edx) | (u64::from(leaf.ecx) << 32))
}

/// Turns on the FPU and SSE state so compiled code may use them.
pub(super) unsafe fn enable_simd() {
    let mut cr0: u64;
    asm!("mov {}, cr0", out(reg) cr0, options(nomem, preserves_flags));
    cr0 &= !(1 << 2); // EM
    cr0 |= (1 << 1) | (1 << 5); // MP, NE
    asm!("mov cr0, {}", in(reg) cr0, options(nomem, preserves_flags));

    let mut cr4: u64;
    asm!("mov {}, cr4", out(reg) cr4, options(nomem, preserves_flags));
    cr4 |= (1 << 9) | (1 << 10); // OSFXSR, OSXMMEXCPT
    asm!("mov cr4, {}", in(reg) cr4, options(nomem, preserves_flags));

    asm!("fninit", options(nomem, preserves_flags));
}

pub(super) fn timestamp() -> u64 {
    // SAFETY: rdtsc has no side effects.
    unsafe { _rdtsc() }
}

/// One hardware random value, or `None` if the generator ran dry.
pub(super) fn rdrand() -> Option<u64> {
    for _ in 0..10 {
        let value: u64;
        let ok: u8;
        unsafe {
            asm!(
                "rdrand {0}",
                "setc {1}",
                out(reg) value,
                out(reg_byte) ok,
                options(nomem, nostack)
            );
        }
        if ok != 0 {
            return Some(value);
        }
    }
    None
}
