//! Virtual/physical translation table for managed regions.
//!
//! Every address programmed into a descriptor must be a bus-visible
//! physical address; the controller knows nothing of this process's
//! mappings. All translation funnels through this table so the
//! conversion is explicit and checkable, never pointer arithmetic
//! scattered through the transfer path.

use crate::ProtocolError;
use crate::region::{MAX_REGIONS, Region};

#[derive(Debug, Clone, Copy)]
struct Span {
    virt: usize,
    phys: u64,
    len: usize,
}

/// Bidirectional table mapping each managed region's virtual base to its
/// physical base. Fixed capacity; one entry per mapped region.
#[derive(Default)]
pub struct AddressSpace {
    spans: [Option<Span>; MAX_REGIONS],
    count: usize,
}

impl AddressSpace {
    pub const fn new() -> Self {
        Self {
            spans: [None; MAX_REGIONS],
            count: 0,
        }
    }

    /// Record a mapped region in the table.
    pub fn register(&mut self, region: &Region) -> Result<(), ProtocolError> {
        if self.count == MAX_REGIONS {
            return Err(ProtocolError::InvalidState);
        }
        self.spans[self.count] = Some(Span {
            virt: region.virt_addr(),
            phys: region.phys,
            len: region.len,
        });
        self.count += 1;
        Ok(())
    }

    /// Translate a process-visible address into the physical address the
    /// controller must be programmed with.
    pub fn to_phys(&self, virt: usize) -> Result<u64, ProtocolError> {
        for span in self.spans[..self.count].iter().flatten() {
            if virt >= span.virt && virt - span.virt < span.len {
                return Ok(span.phys + (virt - span.virt) as u64);
            }
        }
        Err(ProtocolError::OutOfRange)
    }

    /// Translate a physical address back into the process mapping.
    pub fn to_virt(&self, phys: u64) -> Result<usize, ProtocolError> {
        for span in self.spans[..self.count].iter().flatten() {
            if phys >= span.phys && phys - span.phys < span.len as u64 {
                return Ok(span.virt + (phys - span.phys) as usize);
            }
        }
        Err(ProtocolError::OutOfRange)
    }
}
