//! Mapped memory regions and the provider surface behind them.
//!
//! A [`Region`] is one physically contiguous allocation (or MMIO window)
//! mapped into the process. How it is opened and mapped is platform glue
//! behind the [`RegionSource`] trait; the engine only needs the resolved
//! virtual base, the bus-visible physical base and the length. Both bases
//! are resolved once at map time and never change.
//!
//! [`RegionMapper`] provides scoped acquisition: it records every region
//! it hands out and releases all of them when dropped, so teardown runs
//! on success and failure paths alike.

use crate::SetupError;
use core::ptr::NonNull;

/// Upper bound on simultaneously managed regions.
pub const MAX_REGIONS: usize = 8;

/// One mapped memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Process-visible base address.
    pub virt: NonNull<u8>,
    /// Bus-visible base address the controller is programmed with.
    pub phys: u64,
    /// Mapped length in bytes.
    pub len: usize,
    /// Whether CPU caches may hold lines of this mapping.
    pub cached: bool,
}

impl Region {
    /// Virtual base as an integer address.
    pub fn virt_addr(&self) -> usize {
        self.virt.as_ptr() as usize
    }

    /// View a window of the region as bytes.
    ///
    /// # Safety
    ///
    /// `offset + len` must lie within the mapping and the window must not
    /// currently be owned by hardware.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr().add(offset), len) }
    }

    /// View a window of the region as mutable bytes.
    ///
    /// # Safety
    ///
    /// Same as [`Region::bytes`], and no other live reference may alias
    /// the window.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr().add(offset), len) }
    }
}

/// External provider of named regions: device open, map and the
/// out-of-band physical address query.
pub trait RegionSource {
    /// Open and map the named allocation, resolving its physical base.
    fn map_region(&mut self, name: &str, len: usize) -> Result<Region, SetupError>;

    /// Release a mapping previously returned by `map_region`. Must be
    /// safe to call during teardown of a partially completed setup.
    fn release(&mut self, region: Region);
}

/// Owns a [`RegionSource`] plus every region mapped through it and
/// releases them, in reverse map order, on drop.
pub struct RegionMapper<S: RegionSource> {
    source: S,
    regions: [Option<Region>; MAX_REGIONS],
    count: usize,
}

impl<S: RegionSource> RegionMapper<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            regions: [None; MAX_REGIONS],
            count: 0,
        }
    }

    /// Map a named region and record it for teardown.
    pub fn map(&mut self, name: &str, len: usize) -> Result<Region, SetupError> {
        if self.count == MAX_REGIONS {
            return Err(SetupError::Mapping);
        }
        let region = self.source.map_region(name, len)?;
        log::debug!(
            "mapped {name}: virt {:#x} phys {:#x} len {:#x}",
            region.virt_addr(),
            region.phys,
            region.len
        );
        self.regions[self.count] = Some(region);
        self.count += 1;
        Ok(region)
    }
}

impl<S: RegionSource> Drop for RegionMapper<S> {
    fn drop(&mut self) {
        for slot in self.regions[..self.count].iter_mut().rev() {
            if let Some(region) = slot.take() {
                self.source.release(region);
            }
        }
    }
}
