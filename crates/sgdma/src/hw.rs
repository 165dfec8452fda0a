//! Static hardware build configuration.
//!
//! Mirrors the generated configuration table of the hardware design:
//! fixed device identity and feature flags, consumed read-only at setup.
//! There is no dynamic capability discovery; the flags are known at
//! build time.

/// Hardware build parameters for one DMA engine instance.
#[derive(Debug, Clone, Copy)]
pub struct DmaConfig {
    /// Device identity of this engine instance.
    pub device_id: u32,
    /// Byte offset of the engine's register block inside the mapped
    /// register window.
    pub reg_offset: usize,
    /// Status/control stream present in the SG engine.
    pub has_stscntrl_strm: bool,
    /// Memory-to-stream (transmit) channel present.
    pub has_mm2s: bool,
    pub mm2s_data_width: u32,
    pub mm2s_burst_size: u32,
    /// Stream-to-memory (receive) channel present.
    pub has_s2mm: bool,
    pub s2mm_data_width: u32,
    pub s2mm_burst_size: u32,
    /// Scatter-gather engine included in the build.
    pub has_sg: bool,
    pub micro_dma: bool,
    /// Width of bus addresses the engine can emit.
    pub addr_width: u32,
    /// Width of the descriptor length field in this build.
    pub sg_length_width: u32,
}

impl DmaConfig {
    /// Largest transfer one descriptor can carry in this build.
    pub const fn max_transfer_len(&self) -> u32 {
        (1 << self.sg_length_width) - 1
    }
}

/// Build parameters of the loopback test platform.
pub const LOOPBACK_PLATFORM: DmaConfig = DmaConfig {
    device_id: 0x4712,
    reg_offset: 0x0004_0000,
    has_stscntrl_strm: false,
    has_mm2s: true,
    mm2s_data_width: 32,
    mm2s_burst_size: 16,
    has_s2mm: true,
    s2mm_data_width: 32,
    s2mm_burst_size: 16,
    has_sg: true,
    micro_dma: false,
    addr_width: 32,
    sg_length_width: 14,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_transfer_len_follows_length_width() {
        assert_eq!(LOOPBACK_PLATFORM.max_transfer_len(), 0x3FFF);
        let wide = DmaConfig {
            sg_length_width: 26,
            ..LOOPBACK_PLATFORM
        };
        assert_eq!(wide.max_transfer_len(), 0x03FF_FFFF);
    }
}
