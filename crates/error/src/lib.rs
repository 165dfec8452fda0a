//! Driver error handling infrastructure.
//!
//! Provides the `define_dma_error!` macro for consistent error type
//! definitions across the DMA driver crates. Every error carries a
//! subsystem-prefixed numeric code so a failure printed on a serial
//! console can be traced back to its origin without symbols.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_dma_error! {
//!     pub enum RingError(0x02) {
//!         InsufficientFree = 0x02 => "Not enough free descriptors",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner payload implementing `Display`)
//! ```ignore
//! define_dma_error! {
//!     pub enum TransferError(0x03) {
//!         Setup(SetupError) = 0x01 => "Device setup failed",
//!     }
//! }
//! ```

#![no_std]

/// Define a driver error type with a fixed subsystem code.
///
/// Variants are either unit-like or carry one inner value; the inner
/// value must implement `Display` and is appended to the rendered
/// message. The generated type implements `Display`, `Debug` and
/// `core::error::Error`, and exposes `code()` / `describe()` for
/// logging without formatting machinery.
#[macro_export]
macro_rules! define_dma_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier shared by every variant of this type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Subsystem-prefixed numeric code for this error.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_dma_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Static description, independent of any inner payload.
            pub const fn describe(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_dma_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_dma_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_dma_error!(@render self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    (@render $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@render $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}
