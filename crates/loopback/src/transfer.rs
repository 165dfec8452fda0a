//! The transfer orchestrator.
//!
//! One [`Loopback`] value owns everything a run touches: the mapped
//! regions, the translation table and both channels. There is no shared
//! module state; teardown is the mapper's drop, which runs on every exit
//! path.
//!
//! A run walks a fixed sequence of phases. Both completion waits use the
//! same bounded policy: poll, sleep, retry, and give up with a timeout
//! after a configured number of attempts, since the hardware can
//! legitimately never complete when no loopback widget is connected.

use crate::config::LoopbackConfig;
use crate::{TransferError, pattern};
use log::{debug, info, warn};
use sgdma::addrspace::AddressSpace;
use sgdma::bd::{BD_MINIMUM_ALIGNMENT, Bd, TxControl};
use sgdma::channel::{ChannelIo, Direction, DmaChannel};
use sgdma::hw::DmaConfig;
use sgdma::region::{Region, RegionMapper, RegionSource};
use sgdma::ring::BdRing;
use sgdma::SetupError;
use std::fmt;
use std::thread;

/// Orchestrator state. `Failed` is reachable from every other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RxPrimed,
    TxSubmitted,
    AwaitingTx,
    AwaitingRx,
    Verified,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::RxPrimed => "rx-primed",
            Phase::TxSubmitted => "tx-submitted",
            Phase::AwaitingTx => "awaiting-tx",
            Phase::AwaitingRx => "awaiting-rx",
            Phase::Verified => "verified",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// End-to-end loopback context.
pub struct Loopback<S: RegionSource, Io: ChannelIo> {
    cfg: LoopbackConfig,
    // held for its drop, which unmaps every region
    _mapper: RegionMapper<S>,
    space: AddressSpace,
    tx: DmaChannel<Io>,
    rx: DmaChannel<Io>,
    source: Region,
    destination: Region,
    phase: Phase,
}

impl<S: RegionSource, Io: ChannelIo> Loopback<S, Io> {
    /// Map every region, build the translation table, create both rings
    /// over the descriptor allocation and reset the engine.
    ///
    /// `make_io` receives the mapped register window and returns the
    /// (transmit, receive) register access pair; platform glue such as
    /// bridge window setup belongs in that closure.
    pub fn bring_up(
        cfg: LoopbackConfig,
        hw: DmaConfig,
        source: S,
        make_io: impl FnOnce(&Region) -> (Io, Io),
    ) -> Result<Self, TransferError> {
        if !hw.has_sg {
            return Err(SetupError::SgDisabled.into());
        }
        // the length flows into descriptor programming and raw window
        // views, so reject impossible values before anything is mapped
        if cfg.max_pkt_len == 0
            || cfg.max_pkt_len > cfg.buffer_len
            || cfg.max_pkt_len > hw.max_transfer_len() as usize
        {
            return Err(SetupError::InvalidLength.into());
        }

        let mut mapper = RegionMapper::new(source);
        let registers = mapper.map(&cfg.registers, cfg.register_window_len)?;
        let descriptors = mapper.map(&cfg.descriptors, cfg.descriptor_len)?;
        let src = mapper.map(&cfg.source, cfg.buffer_len)?;
        let dst = mapper.map(&cfg.destination, cfg.buffer_len)?;

        let mut space = AddressSpace::new();
        space.register(&descriptors)?;
        space.register(&src)?;
        space.register(&dst)?;

        let (tx_io, rx_io) = make_io(&registers);

        // TX ring over the first half of descriptor space, RX over the
        // second; the rings never share descriptor storage.
        if cfg.ring_bytes * 2 > descriptors.len {
            return Err(SetupError::RingTooSmall.into());
        }
        let tx_ring = BdRing::create(
            descriptors.phys,
            descriptors.virt_addr(),
            BD_MINIMUM_ALIGNMENT,
            cfg.ring_bytes,
            hw.max_transfer_len(),
            descriptors.cached,
        )?;
        let rx_ring = BdRing::create(
            descriptors.phys + cfg.ring_bytes as u64,
            descriptors.virt_addr() + cfg.ring_bytes,
            BD_MINIMUM_ALIGNMENT,
            cfg.ring_bytes,
            hw.max_transfer_len(),
            descriptors.cached,
        )?;

        let mut tx = DmaChannel::new(Direction::Transmit, tx_io, tx_ring);
        let rx = DmaChannel::new(Direction::Receive, rx_io, rx_ring);

        // engine-wide soft reset through the TX control register
        tx.reset()?;

        info!(
            "engine {:#06x} up: {} TX BDs, {} RX BDs, pkt {} bytes",
            hw.device_id,
            tx.ring().capacity(),
            rx.ring().capacity(),
            cfg.max_pkt_len
        );

        Ok(Self {
            cfg,
            _mapper: mapper,
            space,
            tx,
            rx,
            source: src,
            destination: dst,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Free descriptors on the receive ring, for re-posting decisions.
    pub fn rx_free_count(&self) -> usize {
        self.rx.free_count()
    }

    pub fn tx_free_count(&self) -> usize {
        self.tx.free_count()
    }

    /// Bring both rings up and run one full transfer cycle.
    pub fn run(&mut self) -> Result<(), TransferError> {
        let result = self.setup().and_then(|()| self.transfer_once());
        match result {
            Ok(()) => {
                self.phase = Phase::Done;
                info!("loopback transfer verified");
                Ok(())
            }
            Err(err) => {
                let at = self.phase;
                self.phase = Phase::Failed;
                warn!("loopback failed during {at}: {err}");
                Err(err)
            }
        }
    }

    fn setup(&mut self) -> Result<(), TransferError> {
        self.prime_rx()?;
        self.setup_tx()?;
        Ok(())
    }

    /// One submit/poll/verify cycle. Rings must already be primed; the
    /// receive ring is re-primed before this returns, so cycles can be
    /// chained.
    pub fn transfer_once(&mut self) -> Result<(), TransferError> {
        self.send_packet()?;
        self.await_tx()?;
        self.await_rx_and_verify()?;
        Ok(())
    }

    /// Attach a distinct buffer window to every postable receive
    /// descriptor and hand them all to hardware. Only valid while no
    /// receive descriptor is posted; later postings go through
    /// [`Self::repost_rx_run`], which keeps window ownership with the
    /// descriptor being recycled.
    fn post_rx_buffers(&mut self) -> Result<usize, TransferError> {
        let postable = self
            .rx
            .free_count()
            .min(self.cfg.buffer_len / self.cfg.max_pkt_len);
        if postable == 0 {
            return Err(sgdma::ProtocolError::InsufficientFree.into());
        }
        let first = self.rx.ring_mut().alloc(postable)?;
        let mut index = first;
        for slot in 0..postable {
            let virt = self.destination.virt_addr() + slot * self.cfg.max_pkt_len;
            let phys = self.space.to_phys(virt)?;
            let ring = self.rx.ring_mut();
            ring.set_buffer_addr(index, phys)?;
            ring.set_length(index, self.cfg.max_pkt_len as u32)?;
            // receive control stays clear; hardware reports SOF/EOF in
            // the status word
            ring.set_ctrl(index, TxControl::empty())?;
            ring.set_id(index, phys)?;
            index = ring.next_index(index);
        }
        self.rx.submit(postable, first)?;
        debug!("posted {postable} RX buffers");
        Ok(postable)
    }

    /// Reclaim a harvested receive run and re-post the same buffer
    /// windows. Each window stays with the run that owned it, so posted
    /// descriptors never alias a window still owned by hardware.
    fn repost_rx_run(&mut self, count: usize, first: usize) -> Result<(), TransferError> {
        let mut windows = Vec::with_capacity(count);
        let mut index = first;
        for _ in 0..count {
            windows.push(self.rx.ring().completed_id(index)?);
            index = self.rx.ring().next_index(index);
        }
        self.rx.free(count, first)?;
        let fresh = self.rx.ring_mut().alloc(count)?;
        let mut index = fresh;
        for phys in windows {
            let ring = self.rx.ring_mut();
            ring.set_buffer_addr(index, phys)?;
            ring.set_length(index, self.cfg.max_pkt_len as u32)?;
            ring.set_ctrl(index, TxControl::empty())?;
            ring.set_id(index, phys)?;
            index = ring.next_index(index);
        }
        self.rx.submit(count, fresh)?;
        debug!("re-posted {count} RX buffers");
        Ok(())
    }

    fn prime_rx(&mut self) -> Result<(), TransferError> {
        self.rx.disable_interrupts();
        self.rx.set_coalesce(self.cfg.coalesce, self.cfg.delay)?;
        self.rx.ring_mut().clone_template(&Bd::zeroed())?;
        // clear the receive window so verification sees transferred data
        // SAFETY: hardware is not started yet; the window is software-owned.
        unsafe { self.destination.bytes_mut(0, self.cfg.max_pkt_len) }.fill(0);
        self.post_rx_buffers()?;
        self.rx.start();
        self.phase = Phase::RxPrimed;
        debug!("phase {}", self.phase);
        Ok(())
    }

    fn setup_tx(&mut self) -> Result<(), TransferError> {
        self.tx.disable_interrupts();
        self.tx.set_coalesce(self.cfg.coalesce, self.cfg.delay)?;
        self.tx.ring_mut().clone_template(&Bd::zeroed())?;
        self.tx.start();
        Ok(())
    }

    fn send_packet(&mut self) -> Result<(), TransferError> {
        // SAFETY: the source window is software-owned until submission.
        let payload = unsafe { self.source.bytes_mut(0, self.cfg.max_pkt_len) };
        pattern::fill(payload, self.cfg.seed);

        let phys = self.space.to_phys(self.source.virt_addr())?;
        let ring = self.tx.ring_mut();
        let first = ring.alloc(1)?;
        ring.set_buffer_addr(first, phys)?;
        ring.set_length(first, self.cfg.max_pkt_len as u32)?;
        // single-descriptor packet carries both frame delimiters
        ring.set_ctrl(first, TxControl::SOF | TxControl::EOF)?;
        ring.set_id(first, phys)?;
        self.tx.submit(1, first)?;
        self.phase = Phase::TxSubmitted;
        debug!("phase {}: {} bytes at {phys:#x}", self.phase, self.cfg.max_pkt_len);
        Ok(())
    }

    fn await_tx(&mut self) -> Result<(), TransferError> {
        self.phase = Phase::AwaitingTx;
        let (count, first) = await_completion(&self.cfg, &mut self.tx)?;
        self.tx.free(count, first)?;
        Ok(())
    }

    fn await_rx_and_verify(&mut self) -> Result<(), TransferError> {
        self.phase = Phase::AwaitingRx;
        let (count, first) = await_completion(&self.cfg, &mut self.rx)?;

        // locate the landed buffer through the descriptor's tag rather
        // than assuming which window the packet arrived in
        let phys = self.rx.ring().completed_id(first)?;
        let received_len = self.rx.ring().completed_length(first)? as usize;
        let virt = self.space.to_virt(phys)?;
        let offset = virt
            .checked_sub(self.destination.virt_addr())
            .filter(|off| off + self.cfg.max_pkt_len <= self.destination.len)
            .ok_or(sgdma::ProtocolError::OutOfRange)?;
        debug!("RX completion: {received_len} bytes at {phys:#x}");

        // SAFETY: the harvested window is software-owned again.
        let received = unsafe { self.destination.bytes(offset, self.cfg.max_pkt_len) };
        pattern::verify(received, self.cfg.seed).map_err(TransferError::DataIntegrity)?;
        self.phase = Phase::Verified;
        debug!("phase {}", self.phase);

        // recycle the descriptors along with their windows
        self.repost_rx_run(count, first)?;
        Ok(())
    }
}

/// Poll one channel to completion under the shared bounded policy.
fn await_completion<Io: ChannelIo>(
    cfg: &LoopbackConfig,
    channel: &mut DmaChannel<Io>,
) -> Result<(usize, usize), TransferError> {
    for _ in 0..cfg.max_poll_attempts {
        let (count, first) = channel.poll();
        if count > 0 {
            return Ok((count, first));
        }
        thread::sleep(cfg.poll_interval);
    }
    warn!(
        "{} completion timed out after {} polls, status {:?}",
        channel.direction(),
        cfg.max_poll_attempts,
        channel.status()
    );
    Err(TransferError::Timeout)
}
