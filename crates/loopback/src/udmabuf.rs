//! Linux region provider: UIO register windows and u-dma-buf allocations.
//!
//! Each named region is a character device under `/dev` with its physical
//! base published through sysfs. The physical address is read before the
//! mapping is created, so a region is never handed out half-resolved.
//! Devices are opened with `O_SYNC`, which yields uncached mappings; the
//! regions are therefore reported as `cached: false` and the engine skips
//! cache maintenance on them.

use core::ptr::NonNull;
use log::warn;
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use sgdma::SetupError;
use sgdma::channel::{MmioChannelIo, regs};
use sgdma::hw::DmaConfig;
use sgdma::region::{Region, RegionSource};

/// Address translation register in the PCIe bridge block, relative to the
/// register window base.
const BRIDGE_TRANSLATION_OFFSET: usize = 0x20C;

struct Mapping {
    virt: *mut u8,
    len: usize,
    // keeps the device open for the life of the mapping
    _fd: OwnedFd,
}

/// [`RegionSource`] backed by `/dev/uio*` and `/dev/udmabuf*` devices.
#[derive(Default)]
pub struct UdmabufSource {
    mappings: Vec<Mapping>,
}

impl UdmabufSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegionSource for UdmabufSource {
    fn map_region(&mut self, name: &str, len: usize) -> Result<Region, SetupError> {
        let fd = rustix::fs::open(
            format!("/dev/{name}"),
            OFlags::RDWR | OFlags::SYNC,
            Mode::empty(),
        )
        .map_err(|_| SetupError::DeviceOpen)?;

        let phys = read_phys_addr(name)?;

        // SAFETY: anonymous placement, length and offset are valid for
        // the freshly opened device.
        let ptr = unsafe {
            rustix::mm::mmap(
                core::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|_| SetupError::Mapping)?;

        let virt = NonNull::new(ptr.cast::<u8>()).ok_or(SetupError::Mapping)?;
        self.mappings.push(Mapping {
            virt: virt.as_ptr(),
            len,
            _fd: fd,
        });
        Ok(Region {
            virt,
            phys,
            len,
            cached: false,
        })
    }

    fn release(&mut self, region: Region) {
        let Some(pos) = self
            .mappings
            .iter()
            .position(|m| m.virt == region.virt.as_ptr())
        else {
            warn!("release of unknown region at {:#x}", region.virt_addr());
            return;
        };
        let mapping = self.mappings.swap_remove(pos);
        // SAFETY: the pointer and length came from a successful mmap and
        // the mapping is removed from the table before unmapping.
        if let Err(err) = unsafe { rustix::mm::munmap(mapping.virt.cast(), mapping.len) } {
            warn!("munmap of {:#x} failed: {err}", mapping.virt as usize);
        }
    }
}

/// Resolve the bus address of a named device from sysfs.
fn read_phys_addr(name: &str) -> Result<u64, SetupError> {
    let path = if name.starts_with("uio") {
        format!("/sys/class/uio/{name}/maps/map0/addr")
    } else {
        format!("/sys/class/u-dma-buf/{name}/phys_addr")
    };
    let text = std::fs::read_to_string(&path).map_err(|_| SetupError::AddressResolution)?;
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|_| SetupError::AddressResolution)
}

/// Zero the bridge's address translation window so bus addresses pass
/// through unmodified.
pub fn configure_bridge(registers: &Region) {
    let addr = registers.virt_addr() + BRIDGE_TRANSLATION_OFFSET;
    // SAFETY: the offset lies within the mapped register window.
    unsafe { core::ptr::write_volatile(addr as *mut u32, 0) };
}

/// Build the (transmit, receive) register access pair for an engine whose
/// block sits at `hw.reg_offset` within the mapped window.
pub fn channel_ios(registers: &Region, hw: &DmaConfig) -> (MmioChannelIo, MmioChannelIo) {
    let engine = registers.virt_addr() + hw.reg_offset;
    // SAFETY: both channel blocks lie within the mapped register window
    // and the mapping outlives the returned values for the program's run.
    let tx = unsafe { MmioChannelIo::new(engine + regs::TX_CHANNEL_BASE) };
    let rx = unsafe { MmioChannelIo::new(engine + regs::RX_CHANNEL_BASE) };
    (tx, rx)
}
