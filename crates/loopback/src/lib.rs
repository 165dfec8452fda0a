//! End-to-end loopback validation of the scatter-gather DMA path.
//!
//! A deterministic packet is written into a source buffer, pushed through
//! the engine's transmit channel, routed back by a hardware loopback
//! widget into a receive buffer, and verified byte for byte. Completion
//! is detected by polling; no interrupts are used.

pub mod config;
pub mod logger;
pub mod pattern;
pub mod transfer;
pub mod udmabuf;

pub use config::LoopbackConfig;
pub use pattern::Mismatch;
pub use transfer::{Loopback, Phase};

use sgdma::{ProtocolError, SetupError};
use sgdma_error::define_dma_error;

define_dma_error! {
    /// Terminal failure of a loopback run.
    ///
    /// `Setup` aborts before hardware is started; `Protocol` is a
    /// descriptor lifecycle defect in software; `DataIntegrity` means the
    /// transfer completed but the payload was wrong, pointing at the
    /// hardware data path rather than this code; `Timeout` is the one
    /// plausibly transient condition (for example, no loopback widget
    /// connected).
    pub enum TransferError(0x03) {
        Setup(SetupError) = 0x01 => "Device setup failed",
        Protocol(ProtocolError) = 0x02 => "Descriptor lifecycle violated",
        DataIntegrity(Mismatch) = 0x03 => "Received payload mismatched",
        Timeout = 0x04 => "Transfer did not complete",
    }
}

impl From<SetupError> for TransferError {
    fn from(err: SetupError) -> Self {
        TransferError::Setup(err)
    }
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        TransferError::Protocol(err)
    }
}
