//! Fixed-capacity descriptor rings.
//!
//! A ring is a circular sequence of buffer descriptors backed by one
//! contiguous region that is both CPU- and bus-visible. Slots move
//! through four lifecycle states, always in ring order:
//!
//! ```text
//! Free -> Allocated -> InHardware -> Completed -> Free
//! ```
//!
//! The partition is tracked as four head indices plus four counts; the
//! counts sum to the capacity after every operation. There is no
//! out-of-order completion: allocation, submission, completion and
//! reclamation all act on contiguous runs, matching the hardware's
//! in-order processing of the descriptor chain.
//!
//! Slots are addressed by index modulo capacity. Nothing in this module
//! touches device registers; the channel layer programs the doorbell with
//! the tail address [`BdRing::to_hw`] returns.

use crate::barrier::{dma_rmb, dma_wmb, flush_range, invalidate_range};
use crate::bd::{Bd, BdStatus, LENGTH_MASK, TxControl};
use crate::{ProtocolError, SetupError};

/// Descriptor ring over one contiguous physical+virtual region.
pub struct BdRing {
    phys_base: u64,
    virt_base: usize,
    separation: usize,
    capacity: usize,
    max_transfer_len: u32,
    cached: bool,
    templated: bool,
    free_head: usize,
    pre_head: usize,
    hw_head: usize,
    hw_tail: usize,
    post_head: usize,
    free_cnt: usize,
    pre_cnt: usize,
    hw_cnt: usize,
    post_cnt: usize,
}

impl BdRing {
    /// Carve a descriptor ring out of `len` bytes of mapped memory.
    ///
    /// Capacity is `len` divided by the descriptor size rounded up to
    /// `alignment`. Both base addresses must honor that alignment.
    pub fn create(
        phys_base: u64,
        virt_base: usize,
        alignment: usize,
        len: usize,
        max_transfer_len: u32,
        cached: bool,
    ) -> Result<Self, SetupError> {
        let alignment = alignment.max(core::mem::align_of::<Bd>());
        if !alignment.is_power_of_two()
            || phys_base % alignment as u64 != 0
            || virt_base % alignment != 0
        {
            return Err(SetupError::Mapping);
        }
        let separation = core::mem::size_of::<Bd>().next_multiple_of(alignment);
        let capacity = len / separation;
        if capacity == 0 {
            return Err(SetupError::RingTooSmall);
        }
        Ok(Self {
            phys_base,
            virt_base,
            separation,
            capacity,
            max_transfer_len,
            cached,
            templated: false,
            free_head: 0,
            pre_head: 0,
            hw_head: 0,
            hw_tail: 0,
            post_head: 0,
            free_cnt: capacity,
            pre_cnt: 0,
            hw_cnt: 0,
            post_cnt: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots available for allocation.
    pub fn free_count(&self) -> usize {
        self.free_cnt
    }

    /// Slots currently owned by hardware.
    pub fn pending_count(&self) -> usize {
        self.hw_cnt
    }

    /// Completed slots awaiting reclamation.
    pub fn completed_count(&self) -> usize {
        self.post_cnt
    }

    /// Largest transfer one descriptor of this ring may carry.
    pub fn max_transfer_len(&self) -> u32 {
        self.max_transfer_len
    }

    /// Whether any descriptor has been submitted and not yet harvested.
    pub fn has_pending(&self) -> bool {
        self.hw_cnt > 0
    }

    /// Ring-order successor of `index`.
    pub fn next_index(&self, index: usize) -> usize {
        if index + 1 == self.capacity { 0 } else { index + 1 }
    }

    /// Physical address of the descriptor at `index`.
    pub fn bd_phys(&self, index: usize) -> u64 {
        self.phys_base + (index * self.separation) as u64
    }

    /// Physical address hardware should fetch first when started.
    pub fn head_phys(&self) -> u64 {
        self.bd_phys(self.hw_head)
    }

    /// Physical address of the most recently submitted descriptor.
    pub fn tail_phys(&self) -> u64 {
        self.bd_phys(self.hw_tail)
    }

    fn bd_ptr(&self, index: usize) -> *mut Bd {
        (self.virt_base + index * self.separation) as *mut Bd
    }

    fn advance(&self, index: usize, count: usize) -> usize {
        (index + count) % self.capacity
    }

    /// Distance of `index` from `head` in ring order.
    fn offset_from(&self, head: usize, index: usize) -> usize {
        (index + self.capacity - head) % self.capacity
    }

    fn in_allocated(&self, index: usize) -> bool {
        index < self.capacity && self.offset_from(self.pre_head, index) < self.pre_cnt
    }

    fn in_completed(&self, index: usize) -> bool {
        index < self.capacity && self.offset_from(self.post_head, index) < self.post_cnt
    }

    /// Run cache maintenance over a contiguous run, splitting at the
    /// wraparound point.
    fn sync_run(&self, first: usize, count: usize, op: fn(usize, usize)) {
        if !self.cached {
            return;
        }
        let end = first + count;
        if end <= self.capacity {
            op(self.virt_base + first * self.separation, count * self.separation);
        } else {
            op(
                self.virt_base + first * self.separation,
                (self.capacity - first) * self.separation,
            );
            op(self.virt_base, (end - self.capacity) * self.separation);
        }
    }

    /// Stamp every slot with `template` and chain the next pointers,
    /// wrapping the last slot back to the first.
    ///
    /// Must run exactly once, after creation and before any allocation.
    pub fn clone_template(&mut self, template: &Bd) -> Result<(), ProtocolError> {
        if self.templated || self.free_cnt != self.capacity {
            return Err(ProtocolError::InvalidState);
        }
        for index in 0..self.capacity {
            let ptr = self.bd_ptr(index);
            // SAFETY: index is within the ring, whose backing memory the
            // ring exclusively owns until submission.
            unsafe {
                Bd::write_template(ptr, template);
                Bd::set_next(ptr, self.bd_phys(self.next_index(index)));
            }
        }
        self.sync_run(0, self.capacity, flush_range);
        dma_wmb();
        self.templated = true;
        Ok(())
    }

    /// Reserve `count` contiguous free slots, returning the first index.
    ///
    /// Fails without side effects when fewer than `count` slots are free.
    pub fn alloc(&mut self, count: usize) -> Result<usize, ProtocolError> {
        if !self.templated || count == 0 {
            return Err(ProtocolError::InvalidState);
        }
        if count > self.free_cnt {
            return Err(ProtocolError::InsufficientFree);
        }
        let first = self.free_head;
        self.free_head = self.advance(self.free_head, count);
        self.free_cnt -= count;
        self.pre_cnt += count;
        Ok(first)
    }

    /// Program the buffer address of an allocated slot. The address must
    /// already be physical; the controller cannot see this process's
    /// mappings.
    pub fn set_buffer_addr(&mut self, index: usize, phys: u64) -> Result<(), ProtocolError> {
        if !self.in_allocated(index) || phys % 4 != 0 {
            return Err(ProtocolError::InvalidState);
        }
        // SAFETY: in_allocated guarantees a valid, software-owned slot.
        unsafe { Bd::set_buf_addr(self.bd_ptr(index), phys) };
        Ok(())
    }

    /// Set the transfer length of an allocated slot.
    pub fn set_length(&mut self, index: usize, len: u32) -> Result<(), ProtocolError> {
        if !self.in_allocated(index) || len == 0 {
            return Err(ProtocolError::InvalidState);
        }
        if len > self.max_transfer_len {
            return Err(ProtocolError::LengthExceeded);
        }
        let ptr = self.bd_ptr(index);
        // SAFETY: in_allocated guarantees a valid, software-owned slot.
        unsafe {
            let word = (Bd::control(ptr) & !LENGTH_MASK) | (len & LENGTH_MASK);
            Bd::set_control(ptr, word);
        }
        Ok(())
    }

    /// Set the frame-delimiter flags of an allocated slot.
    pub fn set_ctrl(&mut self, index: usize, flags: TxControl) -> Result<(), ProtocolError> {
        if !self.in_allocated(index) {
            return Err(ProtocolError::InvalidState);
        }
        let ptr = self.bd_ptr(index);
        // SAFETY: in_allocated guarantees a valid, software-owned slot.
        unsafe {
            let word = (Bd::control(ptr) & LENGTH_MASK) | flags.bits();
            Bd::set_control(ptr, word);
        }
        Ok(())
    }

    /// Tag an allocated slot with an opaque software identifier.
    pub fn set_id(&mut self, index: usize, id: u64) -> Result<(), ProtocolError> {
        if !self.in_allocated(index) {
            return Err(ProtocolError::InvalidState);
        }
        // SAFETY: in_allocated guarantees a valid, software-owned slot.
        unsafe { Bd::set_id(self.bd_ptr(index), id) };
        Ok(())
    }

    /// Hand a contiguous allocated run over to hardware.
    ///
    /// Runs submit in FIFO order: `first` must be the oldest allocated
    /// slot. Returns the physical address of the run's tail descriptor
    /// for the doorbell write. Descriptor memory is made bus-visible
    /// before this function returns.
    pub fn to_hw(&mut self, count: usize, first: usize) -> Result<u64, ProtocolError> {
        if count == 0 || count > self.pre_cnt || first != self.pre_head {
            return Err(ProtocolError::InvalidState);
        }
        self.sync_run(first, count, flush_range);
        dma_wmb();
        let tail = self.advance(first, count - 1);
        self.pre_head = self.advance(self.pre_head, count);
        self.pre_cnt -= count;
        self.hw_cnt += count;
        self.hw_tail = tail;
        Ok(self.bd_phys(tail))
    }

    /// Harvest the contiguous run of descriptors hardware has completed
    /// since the last call.
    ///
    /// Non-blocking; returns `(0, _)` when nothing new has completed.
    /// Harvested slots move to Completed and stay there until [`free`]d,
    /// so polling an already-drained ring is side-effect free.
    ///
    /// [`free`]: BdRing::free
    pub fn from_hw(&mut self) -> (usize, usize) {
        let first = self.hw_head;
        if self.hw_cnt == 0 {
            return (0, first);
        }
        self.sync_run(self.hw_head, self.hw_cnt, invalidate_range);
        dma_rmb();
        let mut count = 0;
        let mut index = self.hw_head;
        while count < self.hw_cnt {
            // SAFETY: index stays within the submitted run; the status
            // word is the only field hardware writes.
            let status = unsafe { Bd::status(self.bd_ptr(index)) };
            if status & BdStatus::COMPLETE.bits() == 0 {
                break;
            }
            count += 1;
            index = self.next_index(index);
        }
        if count > 0 {
            self.hw_head = index;
            self.hw_cnt -= count;
            self.post_cnt += count;
        }
        (count, first)
    }

    /// Opaque tag of a harvested slot, as set at allocation time.
    pub fn completed_id(&self, index: usize) -> Result<u64, ProtocolError> {
        if !self.in_completed(index) {
            return Err(ProtocolError::InvalidState);
        }
        // SAFETY: the slot is software-owned between harvest and free.
        Ok(unsafe { Bd::id(self.bd_ptr(index)) })
    }

    /// Bytes the controller reported transferring through a harvested
    /// slot.
    pub fn completed_length(&self, index: usize) -> Result<u32, ProtocolError> {
        if !self.in_completed(index) {
            return Err(ProtocolError::InvalidState);
        }
        // SAFETY: the slot is software-owned between harvest and free.
        Ok(unsafe { Bd::status(self.bd_ptr(index)) } & LENGTH_MASK)
    }

    /// Return a contiguous completed run to the free pool.
    ///
    /// Clears each slot's status word so a stale complete bit can never
    /// be harvested again after the slot is re-submitted.
    pub fn free(&mut self, count: usize, first: usize) -> Result<(), ProtocolError> {
        if count == 0 || count > self.post_cnt || first != self.post_head {
            return Err(ProtocolError::InvalidState);
        }
        let mut index = first;
        for _ in 0..count {
            // SAFETY: the run is software-owned between harvest and free.
            unsafe { Bd::set_status(self.bd_ptr(index), 0) };
            index = self.next_index(index);
        }
        self.sync_run(first, count, flush_range);
        self.post_head = index;
        self.post_cnt -= count;
        self.free_cnt += count;
        Ok(())
    }

    #[cfg(test)]
    fn state_counts(&self) -> (usize, usize, usize, usize) {
        (self.free_cnt, self.pre_cnt, self.hw_cnt, self.post_cnt)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    const FAKE_PHYS: u64 = 0x4000_0000;
    const ARENA: usize = 4096;

    #[repr(align(64))]
    struct Arena([u8; ARENA]);

    fn arena() -> Box<Arena> {
        Box::new(Arena([0; ARENA]))
    }

    fn ring_over(arena: &Arena, len: usize) -> BdRing {
        BdRing::create(FAKE_PHYS, arena.0.as_ptr() as usize, 0x40, len, 0x3FFF, false).unwrap()
    }

    fn primed_ring(arena: &Arena, len: usize) -> BdRing {
        let mut ring = ring_over(arena, len);
        ring.clone_template(&Bd::zeroed()).unwrap();
        ring
    }

    /// Stand-in for the controller writing a completion status.
    fn hw_complete(ring: &BdRing, index: usize, len: u32) {
        unsafe { Bd::set_status(ring.bd_ptr(index), BdStatus::COMPLETE.bits() | len) };
    }

    fn assert_sum(ring: &BdRing) {
        let (f, p, h, c) = ring.state_counts();
        assert_eq!(f + p + h + c, ring.capacity());
    }

    #[test]
    fn capacity_comes_from_len_over_separation() {
        let mem = arena();
        assert_eq!(ring_over(&mem, 0x1000).capacity(), 64);
        assert_eq!(ring_over(&mem, 0x100).capacity(), 4);
        assert_eq!(ring_over(&mem, 0x7F).capacity(), 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mem = arena();
        let err = BdRing::create(FAKE_PHYS, mem.0.as_ptr() as usize, 0x40, 0x3F, 0x3FFF, false);
        assert_eq!(err.err(), Some(SetupError::RingTooSmall));
    }

    #[test]
    fn misaligned_bases_are_rejected() {
        let mem = arena();
        let virt = mem.0.as_ptr() as usize;
        let err = BdRing::create(FAKE_PHYS + 4, virt, 0x40, 0x1000, 0x3FFF, false);
        assert_eq!(err.err(), Some(SetupError::Mapping));
        let err = BdRing::create(FAKE_PHYS, virt + 4, 0x40, 0x1000, 0x3FFF, false);
        assert_eq!(err.err(), Some(SetupError::Mapping));
    }

    #[test]
    fn template_links_slots_with_wraparound() {
        let mem = arena();
        let ring = primed_ring(&mem, 0x100);
        for index in 0..ring.capacity() {
            let next = unsafe { Bd::next(ring.bd_ptr(index)) };
            assert_eq!(next, ring.bd_phys(ring.next_index(index)));
        }
        // last slot points back at the first
        let last = unsafe { Bd::next(ring.bd_ptr(3)) };
        assert_eq!(last, ring.bd_phys(0));
    }

    #[test]
    fn template_runs_exactly_once() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        assert_eq!(
            ring.clone_template(&Bd::zeroed()),
            Err(ProtocolError::InvalidState)
        );
    }

    #[test]
    fn alloc_requires_template() {
        let mem = arena();
        let mut ring = ring_over(&mem, 0x100);
        assert_eq!(ring.alloc(1), Err(ProtocolError::InvalidState));
    }

    #[test]
    fn oversized_alloc_fails_without_partial_effect() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        assert_eq!(ring.alloc(5), Err(ProtocolError::InsufficientFree));
        assert_eq!(ring.free_count(), 4);
        assert_eq!(ring.state_counts(), (4, 0, 0, 0));
    }

    #[test]
    fn counts_sum_to_capacity_through_full_lifecycle() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        assert_sum(&ring);

        let first = ring.alloc(3).unwrap();
        assert_sum(&ring);
        let mut index = first;
        for _ in 0..3 {
            ring.set_buffer_addr(index, 0x5000_0000).unwrap();
            ring.set_length(index, 512).unwrap();
            ring.set_ctrl(index, TxControl::SOF | TxControl::EOF).unwrap();
            ring.set_id(index, 0x5000_0000).unwrap();
            index = ring.next_index(index);
        }
        ring.to_hw(3, first).unwrap();
        assert_sum(&ring);
        assert_eq!(ring.state_counts(), (1, 0, 3, 0));

        hw_complete(&ring, 0, 512);
        hw_complete(&ring, 1, 512);
        let (count, head) = ring.from_hw();
        assert_eq!((count, head), (2, 0));
        assert_sum(&ring);
        assert_eq!(ring.state_counts(), (1, 0, 1, 2));

        ring.free(2, head).unwrap();
        assert_sum(&ring);
        assert_eq!(ring.state_counts(), (3, 0, 1, 0));
    }

    #[test]
    fn setters_reject_slots_not_allocated() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        assert_eq!(
            ring.set_buffer_addr(0, 0x5000_0000),
            Err(ProtocolError::InvalidState)
        );
        let first = ring.alloc(1).unwrap();
        ring.set_buffer_addr(first, 0x5000_0000).unwrap();
        // neighbor slot is still free
        assert_eq!(
            ring.set_length(ring.next_index(first), 64),
            Err(ProtocolError::InvalidState)
        );
    }

    #[test]
    fn unaligned_buffer_address_is_rejected() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(1).unwrap();
        assert_eq!(
            ring.set_buffer_addr(first, 0x5000_0001),
            Err(ProtocolError::InvalidState)
        );
    }

    #[test]
    fn length_above_channel_maximum_is_rejected() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(1).unwrap();
        assert_eq!(ring.set_length(first, 0x4000), Err(ProtocolError::LengthExceeded));
        ring.set_length(first, 0x3FFF).unwrap();
    }

    #[test]
    fn submission_must_start_at_oldest_allocated_slot() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(2).unwrap();
        assert_eq!(
            ring.to_hw(1, ring.next_index(first)),
            Err(ProtocolError::InvalidState)
        );
        ring.to_hw(2, first).unwrap();
    }

    #[test]
    fn to_hw_reports_tail_descriptor_address() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(3).unwrap();
        let tail = ring.to_hw(3, first).unwrap();
        assert_eq!(tail, ring.bd_phys(2));
        assert_eq!(ring.tail_phys(), tail);
    }

    #[test]
    fn polling_a_drained_ring_is_idempotent() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(2).unwrap();
        ring.to_hw(2, first).unwrap();

        assert_eq!(ring.from_hw().0, 0);
        hw_complete(&ring, 0, 64);
        hw_complete(&ring, 1, 64);
        assert_eq!(ring.from_hw(), (2, 0));
        // no intervening hardware activity
        assert_eq!(ring.from_hw().0, 0);
        assert_eq!(ring.completed_count(), 2);
    }

    #[test]
    fn partial_completion_harvests_only_the_finished_prefix() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(3).unwrap();
        ring.to_hw(3, first).unwrap();
        hw_complete(&ring, 0, 64);
        // slot 1 still in flight, slot 2 untouched
        assert_eq!(ring.from_hw(), (1, 0));
        hw_complete(&ring, 1, 64);
        hw_complete(&ring, 2, 64);
        assert_eq!(ring.from_hw(), (2, 1));
    }

    #[test]
    fn free_clears_status_so_stale_completions_never_reappear() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(1).unwrap();
        ring.to_hw(1, first).unwrap();
        hw_complete(&ring, first, 64);
        let (count, head) = ring.from_hw();
        ring.free(count, head).unwrap();

        // resubmit the same slot; without hardware action it must not
        // show up as complete
        let again = ring.alloc(1).unwrap();
        ring.to_hw(1, again).unwrap();
        assert_eq!(ring.from_hw().0, 0);
    }

    #[test]
    fn harvested_slots_expose_tag_and_transferred_length() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(1).unwrap();
        ring.set_buffer_addr(first, 0x5000_0000).unwrap();
        ring.set_length(first, 512).unwrap();
        ring.set_id(first, 0x5000_0000).unwrap();
        ring.to_hw(1, first).unwrap();

        // not harvested yet
        assert_eq!(ring.completed_id(first), Err(ProtocolError::InvalidState));

        hw_complete(&ring, first, 480);
        let (count, head) = ring.from_hw();
        assert_eq!(count, 1);
        assert_eq!(ring.completed_id(head).unwrap(), 0x5000_0000);
        assert_eq!(ring.completed_length(head).unwrap(), 480);

        ring.free(1, head).unwrap();
        assert_eq!(ring.completed_length(head), Err(ProtocolError::InvalidState));
    }

    #[test]
    fn free_rejects_runs_not_at_completed_head() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);
        let first = ring.alloc(2).unwrap();
        ring.to_hw(2, first).unwrap();
        hw_complete(&ring, 0, 64);
        hw_complete(&ring, 1, 64);
        let (count, head) = ring.from_hw();
        assert_eq!(count, 2);
        assert_eq!(ring.free(1, ring.next_index(head)), Err(ProtocolError::InvalidState));
        assert_eq!(ring.free(3, head), Err(ProtocolError::InvalidState));
        ring.free(2, head).unwrap();
    }

    #[test]
    fn lifecycle_wraps_cleanly_across_the_ring_boundary() {
        let mem = arena();
        let mut ring = primed_ring(&mem, 0x100);

        // consume three slots, free them, then allocate across the seam
        let first = ring.alloc(3).unwrap();
        ring.to_hw(3, first).unwrap();
        for index in 0..3 {
            hw_complete(&ring, index, 64);
        }
        let (count, head) = ring.from_hw();
        ring.free(count, head).unwrap();

        let wrapped = ring.alloc(3).unwrap();
        assert_eq!(wrapped, 3);
        let tail = ring.to_hw(3, wrapped).unwrap();
        // run is slots 3, 0, 1; tail is slot 1
        assert_eq!(tail, ring.bd_phys(1));
        hw_complete(&ring, 3, 64);
        hw_complete(&ring, 0, 64);
        hw_complete(&ring, 1, 64);
        let (count, head) = ring.from_hw();
        assert_eq!((count, head), (3, 3));
        ring.free(3, head).unwrap();
        assert_eq!(ring.free_count(), 4);
        assert_sum(&ring);
    }
}
