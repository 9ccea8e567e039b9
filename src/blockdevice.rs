//! Types for identifying and holding blocks on an SD card.
//!
//! Generic code for handling block devices, such as types for identifying
//! a particular block on a block device by its index.

/// A standard 512 byte block (also known as a sector).
///
/// Almost all SD/MMC cards have 512 byte blocks, and standard-capacity cards
/// are forced into 512 byte blocks during initialisation.
///
/// This library does not support devices with a block size other than 512
/// bytes.
pub type Block = [u8; BLOCK_LEN];

/// All our blocks are a fixed length of 512 bytes.
pub const BLOCK_LEN: usize = 512;

/// Sometimes we want `LEN` as a `u32` and the casts don't look nice.
pub const BLOCK_LEN_U32: u32 = 512;

/// The linear numeric address of a block (or sector).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdx(pub u32);

impl BlockIdx {
    /// Convert this block index into the argument a card expects in a
    /// read or write command.
    ///
    /// High-capacity cards are addressed by block number. Standard-capacity
    /// cards are addressed by byte offset, so the index is scaled by the block
    /// length (wrapping, as the card itself cannot address beyond 4 GiB).
    pub const fn card_address(self, high_capacity: bool) -> u32 {
        if high_capacity {
            self.0
        } else {
            self.0.wrapping_mul(BLOCK_LEN_U32)
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
