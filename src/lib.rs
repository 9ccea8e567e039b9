//! # polled-sdcard
//!
//! > A non-blocking SD card driver for cooperative embedded schedulers
//!
//! This crate drives an SD card over a shared SPI bus from a superloop that
//! calls [`SdCard::tick`] once per scheduler period (typically 1 ms). Nothing
//! in here ever blocks: every wait is a stored state that is re-examined on a
//! later tick, and every wait has a deadline. It is `#![no_std]` and does not
//! use `alloc`.
//!
//! The driver detects card insertion, negotiates the card type (SD v1, SD v2
//! or high-capacity SDHC) and then serves single 512-byte block reads. It
//! shares the bus with other peripherals by explicitly requesting and
//! releasing ownership through a [`BusArbiter`].
//!
//! ## Using the crate
//!
//! ```rust
//! use polled_sdcard::{BlockIdx, BusArbiter, CardState, Indicator, SdCard, TimeSource};
//!
//! fn superloop_step<B, D, L, W, T>(sdcard: &mut SdCard<B, D, L, W, T>, sector: &mut [u8; 512])
//! where
//!     B: BusArbiter,
//!     D: embedded_hal::digital::InputPin,
//!     L: Indicator,
//!     W: embedded_io::Write,
//!     T: TimeSource,
//! {
//!     sdcard.tick();
//!     match sdcard.status() {
//!         CardState::Idle => {
//!             let _ = sdcard.read_block(BlockIdx(0));
//!         }
//!         CardState::DataReady => {
//!             sdcard.read_data(sector).expect("data is ready");
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//! * `embassy-sync-06`: Enabled by default. Lets [`bus::spi::SpiArbiter`]
//!   share an SPI bus held in an `embassy-sync` blocking mutex.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

pub mod blockdevice;
pub mod bus;
pub mod indicator;
pub mod sdcard;
pub mod time;

#[doc(inline)]
pub use blockdevice::{Block, BlockIdx, BLOCK_LEN};

#[doc(inline)]
pub use bus::{BusArbiter, BusFault, BusGrant, MessageToken, Rejected, TransferStatus};

#[doc(inline)]
pub use indicator::{Indicator, LedMode, RequesterId};

#[doc(inline)]
pub use sdcard::{CardFlags, CardState, CardType, Error, ErrorKind, Options, SdCard};

#[doc(inline)]
pub use time::{Deadline, TimeSource};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}
