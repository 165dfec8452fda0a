//! Loopback run configuration.
//!
//! Region identities and sizes default to the test platform's device
//! tree: the DMA register window behind a UIO device and three u-dma-buf
//! allocations for descriptor space, source and destination buffers. The
//! descriptor ring byte budget is explicit configuration rather than a
//! value derived from the region size, so the engine can be exercised
//! against rings of varying capacity.

use std::time::Duration;

/// Default payload length: two pages of two channels, minus one word.
pub const MAX_PKT_LEN: usize = 4096 * 2 * 2 - 4;

/// Default first byte of the counter pattern.
pub const TEST_START_VALUE: u8 = 0x0C;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// UIO device exposing the DMA register window.
    pub registers: String,
    /// u-dma-buf allocation holding both descriptor rings.
    pub descriptors: String,
    /// u-dma-buf allocation for the transmit payload.
    pub source: String,
    /// u-dma-buf allocation for the received payload.
    pub destination: String,
    /// Mapped length of the register window.
    pub register_window_len: usize,
    /// Mapped length of the descriptor allocation.
    pub descriptor_len: usize,
    /// Mapped length of each data buffer.
    pub buffer_len: usize,
    /// Bytes of descriptor space given to each channel's ring.
    pub ring_bytes: usize,
    /// Payload length per packet.
    pub max_pkt_len: usize,
    /// First byte of the counter pattern.
    pub seed: u8,
    /// Completion coalescing threshold (descriptors per batch).
    pub coalesce: u8,
    /// Completion coalescing timer delay.
    pub delay: u8,
    /// Sleep between completion polls, on both channels.
    pub poll_interval: Duration,
    /// Polls before a channel is declared hung.
    pub max_poll_attempts: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            registers: "uio0".into(),
            descriptors: "udmabuf2".into(),
            source: "udmabuf0".into(),
            destination: "udmabuf1".into(),
            register_window_len: 8 * 1024 * 1024,
            descriptor_len: 8 * 1024,
            buffer_len: 1024 * 1024,
            ring_bytes: 0x1000,
            max_pkt_len: MAX_PKT_LEN,
            seed: TEST_START_VALUE,
            coalesce: 1,
            delay: 0,
            poll_interval: Duration::from_millis(2),
            max_poll_attempts: 5_000,
        }
    }
}
