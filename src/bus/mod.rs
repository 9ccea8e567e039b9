//! Arbitration of a shared serial bus.
//!
//! The SPI bus on the board is a singleton shared by several tasks. Before a
//! task may clock anything over it, it has to ask for exclusive ownership, and
//! it must hand ownership back when it is done. Requests never block: if
//! somebody else holds the bus the request is simply refused.
//!
//! Transfers are fire-and-forget. Submitting one returns a [`MessageToken`]
//! straight away, and the submitter later polls that token until the
//! transfer reports [`TransferStatus::Complete`]. There is no callback, no
//! blocking wait and no cancellation.

pub mod spi;

use core::num::NonZeroU32;

use crate::sdcard::ring::RxBuffer;

/// Proof that the holder currently owns the bus.
///
/// Minted by a [`BusArbiter`] when a request succeeds and consumed when the
/// bus is released, so a released grant cannot be used again.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq)]
pub struct BusGrant {
    owner: u8,
}

impl BusGrant {
    /// Create a grant for the consumer identified by `owner`.
    ///
    /// Only [`BusArbiter`] implementations should call this.
    pub const fn new(owner: u8) -> BusGrant {
        BusGrant { owner }
    }

    /// The consumer this grant was given to.
    pub const fn owner(&self) -> u8 {
        self.owner
    }
}

/// Identifies one in-flight transfer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageToken(NonZeroU32);

impl MessageToken {
    /// Wrap a raw token value. Zero is not a valid token.
    pub const fn new(value: u32) -> Option<MessageToken> {
        match NonZeroU32::new(value) {
            Some(v) => Some(MessageToken(v)),
            None => None,
        }
    }

    /// The raw token value.
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

/// The bus refused to queue a transfer.
///
/// Happens if the submitter does not own the bus, or the transfer does not
/// fit in the bus driver's queue.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rejected;

/// Why a queued transfer did not complete.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusFault {
    /// An operation on the SPI peripheral failed
    Spi,
    /// Setting the chip select line failed
    Cs,
    /// The token does not belong to any transfer this bus knows about
    UnknownToken,
}

/// The state of a queued transfer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Still waiting to go out
    Pending,
    /// Done, and any received bytes are in the receive buffer
    Complete,
    /// Will never complete
    Failed(BusFault),
}

impl TransferStatus {
    /// Convert into the `nb` polling convention.
    pub fn into_nb(self) -> nb::Result<(), BusFault> {
        match self {
            TransferStatus::Pending => Err(nb::Error::WouldBlock),
            TransferStatus::Complete => Ok(()),
            TransferStatus::Failed(fault) => Err(nb::Error::Other(fault)),
        }
    }
}

/// Exclusive, non-blocking access to a shared serial bus.
///
/// Every transfer is full duplex: for each byte clocked out one byte is
/// clocked in, and when the transfer completes the received bytes are
/// appended to the submitter's [`RxBuffer`] (moving its write cursor).
pub trait BusArbiter {
    /// Ask for exclusive ownership of the bus. Returns `None` if somebody else
    /// has it.
    fn request(&mut self) -> Option<BusGrant>;

    /// Give ownership of the bus back.
    fn release(&mut self, grant: BusGrant);

    /// Drive the chip select line of our device active.
    fn assert_select(&mut self, grant: &BusGrant);

    /// Drive the chip select line of our device inactive.
    fn deassert_select(&mut self, grant: &BusGrant);

    /// Queue a transfer that clocks out `len` bytes of `0xFF` and keeps what
    /// comes back.
    fn read_bytes(&mut self, grant: &BusGrant, len: usize) -> Result<MessageToken, Rejected>;

    /// Queue a transfer that clocks out `bytes` and keeps what comes back.
    fn write_bytes(&mut self, grant: &BusGrant, bytes: &[u8]) -> Result<MessageToken, Rejected>;

    /// Check on a queued transfer. Once it reports
    /// [`TransferStatus::Complete`] its received bytes are in `rx`.
    fn poll<const N: usize>(&mut self, token: MessageToken, rx: &mut RxBuffer<N>)
        -> TransferStatus;

    /// Queue a transfer that clocks in a single byte.
    fn read_byte(&mut self, grant: &BusGrant) -> Result<MessageToken, Rejected> {
        self.read_bytes(grant, 1)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
