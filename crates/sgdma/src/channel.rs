//! Per-direction DMA channel control.
//!
//! A channel couples a descriptor ring with the engine's register block
//! for one direction. Register access goes through the [`ChannelIo`]
//! seam so the same control logic drives real MMIO and test doubles;
//! [`MmioChannelIo`] is the volatile-access implementation for a mapped
//! register window.
//!
//! The engine processes the chain between CURDESC and TAILDESC; the
//! TAILDESC write is the doorbell. For 64-bit addresses the MSB half is
//! written first, because hardware begins fetching on the LSB write.

use crate::ring::BdRing;
use crate::{ProtocolError, SetupError};
use bitflags::bitflags;
use core::fmt;
use core::ptr::{read_volatile, write_volatile};
use log::trace;

/// Register offsets within one channel's block.
pub mod regs {
    pub const DMACR: usize = 0x00;
    pub const DMASR: usize = 0x04;
    pub const CURDESC: usize = 0x08;
    pub const CURDESC_MSB: usize = 0x0C;
    pub const TAILDESC: usize = 0x10;
    pub const TAILDESC_MSB: usize = 0x14;

    /// Transmit channel block offset within the engine's register space.
    pub const TX_CHANNEL_BASE: usize = 0x00;
    /// Receive channel block offset within the engine's register space.
    pub const RX_CHANNEL_BASE: usize = 0x30;
}

bitflags! {
    /// Channel control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaCr: u32 {
        const RUN_STOP = 1 << 0;
        const RESET = 1 << 2;
        const KEYHOLE = 1 << 3;
        const CYCLIC = 1 << 4;
        const IOC_IRQ_EN = 1 << 12;
        const DLY_IRQ_EN = 1 << 13;
        const ERR_IRQ_EN = 1 << 14;
    }

    /// Channel status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaSr: u32 {
        const HALTED = 1 << 0;
        const IDLE = 1 << 1;
        const SG_INCLUDED = 1 << 3;
        const DMA_INT_ERR = 1 << 4;
        const DMA_SLV_ERR = 1 << 5;
        const DMA_DEC_ERR = 1 << 6;
        const SG_INT_ERR = 1 << 8;
        const SG_SLV_ERR = 1 << 9;
        const SG_DEC_ERR = 1 << 10;
    }
}

const IRQ_ALL: DmaCr = DmaCr::IOC_IRQ_EN.union(DmaCr::DLY_IRQ_EN).union(DmaCr::ERR_IRQ_EN);
const COALESCE_SHIFT: u32 = 16;
const COALESCE_MASK: u32 = 0xFF << COALESCE_SHIFT;
const DELAY_SHIFT: u32 = 24;
const DELAY_MASK: u32 = 0xFF << DELAY_SHIFT;

/// Bound on the reset-completion spin.
const RESET_POLL_LIMIT: u32 = 10_000;

/// Channel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Memory to stream (transmit).
    Transmit,
    /// Stream to memory (receive).
    Receive,
}

impl Direction {
    /// Offset of this direction's register block within the engine.
    pub const fn channel_base(self) -> usize {
        match self {
            Direction::Transmit => regs::TX_CHANNEL_BASE,
            Direction::Receive => regs::RX_CHANNEL_BASE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Transmit => f.write_str("TX"),
            Direction::Receive => f.write_str("RX"),
        }
    }
}

/// Register access for one channel block.
pub trait ChannelIo {
    fn read_reg(&self, offset: usize) -> u32;
    fn write_reg(&mut self, offset: usize, value: u32);
}

/// Volatile MMIO access at a fixed base address.
pub struct MmioChannelIo {
    base: usize,
}

impl MmioChannelIo {
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped, live channel
    /// register block and remain valid for the lifetime of the value.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl ChannelIo for MmioChannelIo {
    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: constructor contract guarantees a live mapping.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        // SAFETY: constructor contract guarantees a live mapping.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// One DMA channel: direction, register access and its descriptor ring.
pub struct DmaChannel<Io: ChannelIo> {
    dir: Direction,
    io: Io,
    ring: BdRing,
    running: bool,
}

impl<Io: ChannelIo> DmaChannel<Io> {
    pub fn new(dir: Direction, io: Io, ring: BdRing) -> Self {
        Self {
            dir,
            io,
            ring,
            running: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn ring(&self) -> &BdRing {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut BdRing {
        &mut self.ring
    }

    /// Current channel status word.
    pub fn status(&self) -> DmaSr {
        DmaSr::from_bits_truncate(self.io.read_reg(regs::DMASR))
    }

    /// Soft-reset the engine through this channel's control register and
    /// wait, bounded, for the bit to self-clear.
    pub fn reset(&mut self) -> Result<(), SetupError> {
        self.io.write_reg(regs::DMACR, DmaCr::RESET.bits());
        for _ in 0..RESET_POLL_LIMIT {
            if self.io.read_reg(regs::DMACR) & DmaCr::RESET.bits() == 0 {
                self.running = false;
                return Ok(());
            }
        }
        Err(SetupError::ResetFailed)
    }

    /// Mask every interrupt source; completion is detected by polling.
    pub fn disable_interrupts(&mut self) {
        let cr = self.io.read_reg(regs::DMACR);
        self.io.write_reg(regs::DMACR, cr & !IRQ_ALL.bits());
    }

    /// Program completion coalescing: hardware marks descriptors complete
    /// in batches of `threshold`, with `delay` ticks of timeout. With
    /// interrupts masked this only affects polling granularity. Must be
    /// configured before any descriptor is primed.
    pub fn set_coalesce(&mut self, threshold: u8, delay: u8) -> Result<(), ProtocolError> {
        if threshold == 0 {
            return Err(ProtocolError::InvalidState);
        }
        let mut cr = self.io.read_reg(regs::DMACR);
        cr &= !(COALESCE_MASK | DELAY_MASK);
        cr |= (threshold as u32) << COALESCE_SHIFT;
        cr |= (delay as u32) << DELAY_SHIFT;
        self.io.write_reg(regs::DMACR, cr);
        Ok(())
    }

    /// Start the channel: point CURDESC at the ring head, set run/stop,
    /// and kick any descriptors submitted while the channel was halted.
    pub fn start(&mut self) {
        let head = self.ring.head_phys();
        self.io.write_reg(regs::CURDESC_MSB, (head >> 32) as u32);
        self.io.write_reg(regs::CURDESC, head as u32);
        let cr = self.io.read_reg(regs::DMACR);
        self.io.write_reg(regs::DMACR, cr | DmaCr::RUN_STOP.bits());
        self.running = true;
        trace!("{} channel started, head {head:#x}", self.dir);
        if self.ring.has_pending() {
            self.write_tail(self.ring.tail_phys());
        }
    }

    /// Submit an allocated run to hardware and ring the doorbell.
    pub fn submit(&mut self, count: usize, first: usize) -> Result<(), ProtocolError> {
        let tail = self.ring.to_hw(count, first)?;
        trace!("{} submit {count} BDs, tail {tail:#x}", self.dir);
        if self.running {
            self.write_tail(tail);
        }
        Ok(())
    }

    /// Harvest completed descriptors; `(0, _)` when none.
    pub fn poll(&mut self) -> (usize, usize) {
        self.ring.from_hw()
    }

    /// Reclaim a completed run.
    pub fn free(&mut self, count: usize, first: usize) -> Result<(), ProtocolError> {
        self.ring.free(count, first)
    }

    pub fn free_count(&self) -> usize {
        self.ring.free_count()
    }

    fn write_tail(&mut self, phys: u64) {
        self.io.write_reg(regs::TAILDESC_MSB, (phys >> 32) as u32);
        self.io.write_reg(regs::TAILDESC, phys as u32);
    }
}
