//! # sgdma
//!
//! Polled scatter-gather DMA engine for AXI-DMA-compatible controllers.
//!
//! The crate is split along the hardware handoff boundaries:
//! - [`region`] — mapped memory regions and the external provider surface
//! - [`addrspace`] — virtual/physical translation for managed regions
//! - [`bd`] — the hardware buffer-descriptor record
//! - [`ring`] — fixed-capacity descriptor rings with the four-state
//!   Free/Allocated/InHardware/Completed lifecycle
//! - [`channel`] — per-direction channel control over an MMIO register seam
//! - [`hw`] — the static hardware build configuration
//!
//! Everything hardware-visible is accessed volatilely; [`barrier`] provides
//! the ordering and cache-maintenance points the ring relies on.

#![no_std]

pub mod addrspace;
pub mod barrier;
pub mod bd;
pub mod channel;
pub mod hw;
pub mod region;
pub mod ring;

pub use addrspace::AddressSpace;
pub use bd::{Bd, BdStatus, TxControl, BD_MINIMUM_ALIGNMENT};
pub use channel::{ChannelIo, Direction, DmaChannel, MmioChannelIo};
pub use hw::DmaConfig;
pub use region::{Region, RegionMapper, RegionSource};
pub use ring::BdRing;

use sgdma_error::define_dma_error;

define_dma_error! {
    /// Fatal bring-up failures. Nothing has been handed to hardware when
    /// one of these is raised; acquired regions are still released.
    pub enum SetupError(0x01) {
        DeviceOpen = 0x01 => "Failed to open backing device",
        Mapping = 0x02 => "Memory map request failed",
        AddressResolution = 0x03 => "Physical address attribute unavailable",
        RingTooSmall = 0x04 => "Descriptor space cannot hold a single descriptor",
        ResetFailed = 0x05 => "Engine reset did not complete",
        SgDisabled = 0x06 => "Scatter-gather disabled in hardware build",
        InvalidLength = 0x07 => "Payload length outside supported range",
    }
}

define_dma_error! {
    /// Descriptor lifecycle violations. These indicate a software logic
    /// defect and are never retried.
    pub enum ProtocolError(0x02) {
        InvalidState = 0x01 => "Descriptor not in required lifecycle state",
        InsufficientFree = 0x02 => "Not enough free descriptors",
        LengthExceeded = 0x03 => "Transfer length exceeds channel maximum",
        OutOfRange = 0x04 => "Address outside any mapped region",
    }
}
