//! Simulated DMA engine for end-to-end tests.
//!
//! [`SimBus`] plays both the memory system and the engine: it hands out
//! fake bus addresses for every mapped region and reacts to tail-pointer
//! doorbells by walking the descriptor chain exactly as the hardware
//! would, through bus addresses only. Any process-virtual address that
//! leaks into a descriptor therefore fails loudly instead of silently
//! working because test memory happens to be mapped.
//!
//! A write to the transmit tail pointer processes the submitted chain and
//! routes each completed packet to the oldest posted receive descriptor,
//! mimicking a stream loopback widget. The connection can be severed and
//! single bytes corrupted to exercise the failure paths.

#![allow(clippy::unwrap_used, clippy::panic, dead_code)]

use core::ptr::NonNull;
use sgdma::SetupError;
use sgdma::bd::{BdStatus, LENGTH_MASK, TxControl};
use sgdma::channel::{ChannelIo, DmaCr, regs};
use sgdma::region::{Region, RegionSource};
use std::cell::RefCell;
use std::rc::Rc;

const NEXT: u64 = 0x00;
const BUF_ADDR: u64 = 0x08;
const CONTROL: u64 = 0x14;
const STATUS: u64 = 0x18;

const CHAIN_WALK_LIMIT: usize = 1024;

#[derive(Clone, Copy)]
#[repr(align(64))]
struct Chunk([u8; 64]);

struct Allocation {
    phys: u64,
    len: usize,
    mem: Box<[Chunk]>,
}

#[derive(Default)]
struct ChanRegs {
    regs: [u32; 6],
    running: bool,
}

impl ChanRegs {
    fn pair(&self, lsb: usize) -> u64 {
        u64::from(self.regs[lsb / 4]) | (u64::from(self.regs[lsb / 4 + 1]) << 32)
    }

    fn set_pair(&mut self, lsb: usize, value: u64) {
        self.regs[lsb / 4] = value as u32;
        self.regs[lsb / 4 + 1] = (value >> 32) as u32;
    }
}

struct SimBusInner {
    allocations: Vec<Allocation>,
    next_phys: u64,
    chan: [ChanRegs; 2],
    loopback_connected: bool,
    corrupt_byte: Option<usize>,
    delivered: usize,
    delivered_to: Vec<u64>,
    released: usize,
}

impl SimBusInner {
    fn alloc(&mut self, len: usize) -> (NonNull<u8>, u64) {
        let chunks = len.div_ceil(64);
        let mem = vec![Chunk([0; 64]); chunks].into_boxed_slice();
        let virt = NonNull::new(mem.as_ptr() as *mut u8).unwrap();
        let phys = self.next_phys;
        self.next_phys += (chunks as u64 * 64).next_multiple_of(0x1000);
        self.allocations.push(Allocation {
            phys,
            len: chunks * 64,
            mem,
        });
        (virt, phys)
    }

    /// Resolve a bus address range to host memory. Panics on anything a
    /// real engine would fault on, including virtual addresses smuggled
    /// into a descriptor.
    fn mem_ptr(&mut self, phys: u64, len: usize) -> *mut u8 {
        for alloc in &mut self.allocations {
            if phys >= alloc.phys && phys + len as u64 <= alloc.phys + alloc.len as u64 {
                let offset = (phys - alloc.phys) as usize;
                return unsafe { (alloc.mem.as_mut_ptr() as *mut u8).add(offset) };
            }
        }
        panic!("no allocation backs bus address {phys:#x}");
    }

    fn read_mem32(&mut self, phys: u64) -> u32 {
        let ptr = self.mem_ptr(phys, 4);
        unsafe { ptr.cast::<u32>().read_unaligned() }
    }

    fn write_mem32(&mut self, phys: u64, value: u32) {
        let ptr = self.mem_ptr(phys, 4);
        unsafe { ptr.cast::<u32>().write_unaligned(value) };
    }

    fn read_mem64(&mut self, phys: u64) -> u64 {
        u64::from(self.read_mem32(phys)) | (u64::from(self.read_mem32(phys + 4)) << 32)
    }

    fn copy_out(&mut self, phys: u64, len: usize) -> Vec<u8> {
        let ptr = self.mem_ptr(phys, len);
        unsafe { core::slice::from_raw_parts(ptr, len) }.to_vec()
    }

    fn copy_in(&mut self, phys: u64, bytes: &[u8]) {
        let ptr = self.mem_ptr(phys, bytes.len());
        unsafe { core::slice::from_raw_parts_mut(ptr, bytes.len()) }.copy_from_slice(bytes);
    }

    fn read_reg(&self, chan: usize, offset: usize) -> u32 {
        self.chan[chan].regs[offset / 4]
    }

    fn write_reg(&mut self, chan: usize, offset: usize, value: u32) {
        if offset == regs::DMACR {
            // reset is engine-wide and self-clearing
            if value & DmaCr::RESET.bits() != 0 {
                self.chan = [ChanRegs::default(), ChanRegs::default()];
                return;
            }
            self.chan[chan].running = value & DmaCr::RUN_STOP.bits() != 0;
        }
        self.chan[chan].regs[offset / 4] = value;
        // the LSB tail write is the doorbell
        if offset == regs::TAILDESC && chan == 0 && self.chan[0].running {
            self.process_tx();
        }
    }

    /// Walk the transmit chain from the current to the tail descriptor,
    /// completing each and routing finished packets to the receive side.
    fn process_tx(&mut self) {
        let mut cur = self.chan[0].pair(regs::CURDESC);
        let tail = self.chan[0].pair(regs::TAILDESC);
        let mut packet: Vec<u8> = Vec::new();
        for _ in 0..CHAIN_WALK_LIMIT {
            let ctrl = self.read_mem32(cur + CONTROL);
            let len = (ctrl & LENGTH_MASK) as usize;
            let buf = self.read_mem64(cur + BUF_ADDR);
            let mut bytes = self.copy_out(buf, len);
            packet.append(&mut bytes);
            self.write_mem32(cur + STATUS, BdStatus::COMPLETE.bits() | len as u32);
            if ctrl & TxControl::EOF.bits() != 0 {
                self.deliver(std::mem::take(&mut packet));
            }
            let next = self.read_mem64(cur + NEXT);
            self.chan[0].set_pair(regs::CURDESC, next);
            if cur == tail {
                return;
            }
            cur = next;
        }
        panic!("descriptor chain did not reach the tail");
    }

    fn deliver(&mut self, mut packet: Vec<u8>) {
        if !self.loopback_connected {
            return;
        }
        if let Some(index) = self.corrupt_byte {
            if index < packet.len() {
                packet[index] ^= 0x55;
            }
        }
        let bd = self.chan[1].pair(regs::CURDESC);
        let status = self.read_mem32(bd + STATUS);
        assert_eq!(
            status & BdStatus::COMPLETE.bits(),
            0,
            "receive descriptor reused before reclamation"
        );
        let posted = (self.read_mem32(bd + CONTROL) & LENGTH_MASK) as usize;
        assert!(packet.len() <= posted, "posted receive buffer too small");
        let buf = self.read_mem64(bd + BUF_ADDR);
        self.copy_in(buf, &packet);
        self.write_mem32(
            bd + STATUS,
            BdStatus::COMPLETE.bits()
                | BdStatus::RX_SOF.bits()
                | BdStatus::RX_EOF.bits()
                | packet.len() as u32,
        );
        let next = self.read_mem64(bd + NEXT);
        self.chan[1].set_pair(regs::CURDESC, next);
        self.delivered += 1;
        self.delivered_to.push(buf);
    }
}

/// Handle shared by the region source, both register blocks and the test.
#[derive(Clone)]
pub struct SimBus(Rc<RefCell<SimBusInner>>);

impl SimBus {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimBusInner {
            allocations: Vec::new(),
            next_phys: 0x4000_0000,
            chan: [ChanRegs::default(), ChanRegs::default()],
            loopback_connected: true,
            corrupt_byte: None,
            delivered: 0,
            delivered_to: Vec::new(),
            released: 0,
        })))
    }

    pub fn source(&self) -> SimSource {
        SimSource(self.clone())
    }

    /// Register access for the (transmit, receive) channel blocks.
    pub fn channel_ios(&self) -> (SimChannelIo, SimChannelIo) {
        (
            SimChannelIo {
                bus: self.clone(),
                chan: 0,
            },
            SimChannelIo {
                bus: self.clone(),
                chan: 1,
            },
        )
    }

    pub fn delivered(&self) -> usize {
        self.0.borrow().delivered
    }

    /// Bus address each delivered packet landed at, in delivery order.
    pub fn delivered_to(&self) -> Vec<u64> {
        self.0.borrow().delivered_to.clone()
    }

    pub fn released(&self) -> usize {
        self.0.borrow().released
    }

    /// Sever the stream path; transmissions complete but nothing arrives.
    pub fn set_connected(&self, connected: bool) {
        self.0.borrow_mut().loopback_connected = connected;
    }

    /// Flip one byte of every delivered packet.
    pub fn set_corrupt_byte(&self, index: Option<usize>) {
        self.0.borrow_mut().corrupt_byte = index;
    }
}

/// [`RegionSource`] handing out simulator-backed regions.
pub struct SimSource(SimBus);

impl RegionSource for SimSource {
    fn map_region(&mut self, _name: &str, len: usize) -> Result<Region, SetupError> {
        let (virt, phys) = self.0 .0.borrow_mut().alloc(len);
        Ok(Region {
            virt,
            phys,
            len,
            cached: false,
        })
    }

    fn release(&mut self, _region: Region) {
        self.0 .0.borrow_mut().released += 1;
    }
}

/// [`ChannelIo`] routed to one simulated channel block.
pub struct SimChannelIo {
    bus: SimBus,
    chan: usize,
}

impl ChannelIo for SimChannelIo {
    fn read_reg(&self, offset: usize) -> u32 {
        self.bus.0.borrow().read_reg(self.chan, offset)
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        self.bus.0.borrow_mut().write_reg(self.chan, offset, value);
    }
}
