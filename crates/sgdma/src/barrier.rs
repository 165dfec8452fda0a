//! Memory-ordering and cache-maintenance points for DMA handoff.
//!
//! Descriptor memory is shared with a bus master that does not participate
//! in the CPU's coherency protocol on every platform. Two rules follow:
//! every descriptor write must have reached memory before the doorbell
//! register is written, and every hardware-written status word must be
//! re-fetched from memory before it is inspected.

use core::sync::atomic::{Ordering, fence};

/// Cache line granule assumed for maintenance operations.
pub const CACHE_LINE: usize = 64;

/// Order all prior memory writes before a subsequent doorbell write.
#[inline]
pub fn dma_wmb() {
    fence(Ordering::SeqCst);
    // The fence orders CPU accesses; DSB ensures completion of the
    // writes before the device can observe them via DMA.
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB has no memory or register operands.
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
}

/// Order a status-word read after the hardware write it observes.
#[inline]
pub fn dma_rmb() {
    fence(Ordering::SeqCst);
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB has no memory or register operands.
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
}

/// Write cached descriptor lines back to memory before hardware reads them.
#[cfg(target_arch = "aarch64")]
pub fn flush_range(addr: usize, len: usize) {
    clean_and_invalidate(addr, len);
}

/// Discard cached descriptor lines before reading hardware-written fields.
#[cfg(target_arch = "aarch64")]
pub fn invalidate_range(addr: usize, len: usize) {
    clean_and_invalidate(addr, len);
}

// `dc civac` is the only maintenance op available from EL0, so both
// directions use clean-and-invalidate.
#[cfg(target_arch = "aarch64")]
fn clean_and_invalidate(addr: usize, len: usize) {
    let end = addr + len;
    let mut line = addr & !(CACHE_LINE - 1);
    while line < end {
        // SAFETY: operates on addresses within a mapping owned by the
        // caller; the instruction does not modify data, only cache state.
        unsafe {
            core::arch::asm!("dc civac, {0}", in(reg) line, options(nostack, preserves_flags));
        }
        line += CACHE_LINE;
    }
    // SAFETY: DSB has no memory or register operands.
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
}

/// No cache maintenance required on coherent-I/O architectures.
#[cfg(not(target_arch = "aarch64"))]
pub fn flush_range(_addr: usize, _len: usize) {}

/// No cache maintenance required on coherent-I/O architectures.
#[cfg(not(target_arch = "aarch64"))]
pub fn invalidate_range(_addr: usize, _len: usize) {}
