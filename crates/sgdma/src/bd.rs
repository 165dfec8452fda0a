//! Hardware buffer descriptor layout and field access.
//!
//! A descriptor is a 64-byte-aligned record the controller fetches over
//! the bus. The first seven words are hardware-defined: next-descriptor
//! pointer, buffer address, a reserved word, the control word (length plus
//! frame delimiters) and the status word the controller writes back on
//! completion. The trailing words are software-only: five application
//! words and an opaque tag used to associate a descriptor with the buffer
//! it describes.
//!
//! Descriptors live in memory the controller reads and writes directly,
//! so every access here is volatile and goes through a raw pointer; a
//! cached `&mut Bd` would let the compiler elide re-reads of the
//! hardware-written status word.

use bitflags::bitflags;
use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

/// Minimum spacing and alignment the controller requires between
/// descriptors.
pub const BD_MINIMUM_ALIGNMENT: usize = 0x40;

/// Buffer-length field mask shared by the control and status words.
pub const LENGTH_MASK: u32 = 0x03FF_FFFF;

bitflags! {
    /// Transmit control flags. Receive descriptors leave the control
    /// flags clear; the hardware reports frame delimiters in the status
    /// word instead.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxControl: u32 {
        /// Last descriptor of a packet.
        const EOF = 1 << 26;
        /// First descriptor of a packet.
        const SOF = 1 << 27;
    }

    /// Hardware-written completion status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BdStatus: u32 {
        /// End of frame observed on the receive stream.
        const RX_EOF = 1 << 26;
        /// Start of frame observed on the receive stream.
        const RX_SOF = 1 << 27;
        /// Internal DMA error.
        const DMA_INT_ERR = 1 << 28;
        /// Slave response error.
        const DMA_SLV_ERR = 1 << 29;
        /// Address decode error.
        const DMA_DEC_ERR = 1 << 30;
        /// Descriptor has been processed by hardware.
        const COMPLETE = 1 << 31;
    }
}

/// One buffer descriptor.
///
/// Field order and offsets are hardware-defined; do not reorder.
#[repr(C, align(64))]
pub struct Bd {
    next: u32,
    next_msb: u32,
    buf_addr: u32,
    buf_addr_msb: u32,
    reserved: u32,
    control: u32,
    status: u32,
    app: [u32; 5],
    id: u64,
}

const _: () = assert!(size_of::<Bd>() == 64);
const _: () = assert!(align_of::<Bd>() >= BD_MINIMUM_ALIGNMENT);

impl Bd {
    /// All-zero descriptor, used as the ring template.
    pub const fn zeroed() -> Self {
        Self {
            next: 0,
            next_msb: 0,
            buf_addr: 0,
            buf_addr_msb: 0,
            reserved: 0,
            control: 0,
            status: 0,
            app: [0; 5],
            id: 0,
        }
    }

    /// Stamp `template` into the descriptor at `ptr`, word by word.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a writable, aligned descriptor slot.
    pub unsafe fn write_template(ptr: *mut Bd, template: &Bd) {
        let src = template as *const Bd as *const u32;
        let dst = ptr as *mut u32;
        for word in 0..(size_of::<Bd>() / size_of::<u32>()) {
            unsafe { write_volatile(dst.add(word), read_volatile(src.add(word))) };
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to a writable, aligned descriptor slot.
    pub unsafe fn set_next(ptr: *mut Bd, phys: u64) {
        unsafe {
            write_volatile(addr_of_mut!((*ptr).next), phys as u32);
            write_volatile(addr_of_mut!((*ptr).next_msb), (phys >> 32) as u32);
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to a readable, aligned descriptor slot.
    pub unsafe fn next(ptr: *const Bd) -> u64 {
        let lo = unsafe { read_volatile(addr_of!((*ptr).next)) } as u64;
        let hi = unsafe { read_volatile(addr_of!((*ptr).next_msb)) } as u64;
        lo | (hi << 32)
    }

    /// # Safety
    ///
    /// `ptr` must point to a writable, aligned descriptor slot.
    pub unsafe fn set_buf_addr(ptr: *mut Bd, phys: u64) {
        unsafe {
            write_volatile(addr_of_mut!((*ptr).buf_addr), phys as u32);
            write_volatile(addr_of_mut!((*ptr).buf_addr_msb), (phys >> 32) as u32);
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to a readable, aligned descriptor slot.
    pub unsafe fn buf_addr(ptr: *const Bd) -> u64 {
        let lo = unsafe { read_volatile(addr_of!((*ptr).buf_addr)) } as u64;
        let hi = unsafe { read_volatile(addr_of!((*ptr).buf_addr_msb)) } as u64;
        lo | (hi << 32)
    }

    /// # Safety
    ///
    /// `ptr` must point to a readable, aligned descriptor slot.
    pub unsafe fn control(ptr: *const Bd) -> u32 {
        unsafe { read_volatile(addr_of!((*ptr).control)) }
    }

    /// # Safety
    ///
    /// `ptr` must point to a writable, aligned descriptor slot.
    pub unsafe fn set_control(ptr: *mut Bd, word: u32) {
        unsafe { write_volatile(addr_of_mut!((*ptr).control), word) };
    }

    /// Read the hardware-written status word.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a readable, aligned descriptor slot.
    pub unsafe fn status(ptr: *const Bd) -> u32 {
        unsafe { read_volatile(addr_of!((*ptr).status)) }
    }

    /// # Safety
    ///
    /// `ptr` must point to a writable, aligned descriptor slot.
    pub unsafe fn set_status(ptr: *mut Bd, word: u32) {
        unsafe { write_volatile(addr_of_mut!((*ptr).status), word) };
    }

    /// # Safety
    ///
    /// `ptr` must point to a writable, aligned descriptor slot.
    pub unsafe fn set_id(ptr: *mut Bd, id: u64) {
        unsafe { write_volatile(addr_of_mut!((*ptr).id), id) };
    }

    /// # Safety
    ///
    /// `ptr` must point to a readable, aligned descriptor slot.
    pub unsafe fn id(ptr: *const Bd) -> u64 {
        unsafe { read_volatile(addr_of!((*ptr).id)) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn template_stamp_copies_every_word() {
        let mut template = Bd::zeroed();
        template.control = 0x1234;
        template.app = [1, 2, 3, 4, 5];
        let mut slot = Bd::zeroed();
        unsafe { Bd::write_template(&mut slot as *mut Bd, &template) };
        assert_eq!(slot.control, 0x1234);
        assert_eq!(slot.app, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn wide_fields_split_across_words() {
        let mut slot = Bd::zeroed();
        let ptr = &mut slot as *mut Bd;
        unsafe {
            Bd::set_buf_addr(ptr, 0x1_2345_6789);
            Bd::set_next(ptr, 0xABCD_0040);
        }
        assert_eq!(slot.buf_addr, 0x2345_6789);
        assert_eq!(slot.buf_addr_msb, 0x1);
        assert_eq!(unsafe { Bd::buf_addr(ptr) }, 0x1_2345_6789);
        assert_eq!(unsafe { Bd::next(ptr) }, 0xABCD_0040);
    }
}
