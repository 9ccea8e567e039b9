//! Constants from the SD Specifications, and the command frames built from
//! them.
//!
//! Constant names follow SdFat (Copyright (c) 2011-2018 Bill Greiman, MIT
//! License).

use byteorder::{BigEndian, ByteOrder};

//==============================================================================

// SD Card Commands

/// Marks a byte as the start of a command travelling from host to card
pub const HOST_COMMAND: u8 = 0x40;
/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SET_BLOCKLEN - set the block length for standard-capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// An R1 with this bit set is not a response at all, just the bus idling
pub const R1_NO_RESPONSE: u8 = 0x80;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// What an idle bus (or a card that is not busy) reads as
pub const IDLE_BYTE: u8 = 0xFF;

//==============================================================================

/// CMD8 voltage supplied argument: 2.7-3.6V
pub const CMD8_VHS: u8 = 0x01;

/// CMD8 check pattern, echoed back by the card
pub const CMD8_CHECK_PATTERN: u8 = 0xAA;

/// ACMD41 argument bit announcing that the host supports high-capacity cards
pub const ACMD41_HCS: u32 = 1 << 30;

/// OCR bit (in the first OCR byte) set by high-capacity cards
pub const OCR_CCS_BIT: u8 = 0x40;

/// Length of the R7 / R3 payload that follows the R1 of CMD8 / CMD58
pub const REGISTER_LEN: usize = 4;

/// Length of the CRC that follows every data block
pub const DATA_CRC_LEN: usize = 2;

//==============================================================================

/// A command, ready to be clocked out to the card.
///
/// Six bytes of command (opcode, big-endian argument, CRC) plus one `0xFF`
/// so the first response byte is clocked in with the same transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; CommandFrame::LEN],
}

impl CommandFrame {
    /// Bytes submitted for every command.
    pub const LEN: usize = 7;

    /// Build the frame for `command` with argument `arg`.
    pub fn new(command: u8, arg: u32) -> CommandFrame {
        let mut bytes = [HOST_COMMAND | command, 0, 0, 0, 0, 0, IDLE_BYTE];
        BigEndian::write_u32(&mut bytes[1..5], arg);
        bytes[5] = crc7(&bytes[0..5]);
        CommandFrame { bytes }
    }

    /// CMD0, GO_IDLE_STATE
    pub fn go_idle() -> CommandFrame {
        CommandFrame::new(CMD0, 0)
    }

    /// CMD8, SEND_IF_COND, asking for 2.7-3.6V with the usual check pattern
    pub fn send_if_cond() -> CommandFrame {
        CommandFrame::new(CMD8, (u32::from(CMD8_VHS) << 8) | u32::from(CMD8_CHECK_PATTERN))
    }

    /// CMD16, SET_BLOCKLEN 512
    pub fn set_block_len() -> CommandFrame {
        CommandFrame::new(CMD16, crate::blockdevice::BLOCK_LEN_U32)
    }

    /// CMD17, READ_SINGLE_BLOCK at the given card address
    pub fn read_single_block(address: u32) -> CommandFrame {
        CommandFrame::new(CMD17, address)
    }

    /// CMD55, APP_CMD
    pub fn app_cmd() -> CommandFrame {
        CommandFrame::new(CMD55, 0)
    }

    /// CMD58, READ_OCR
    pub fn read_ocr() -> CommandFrame {
        CommandFrame::new(CMD58, 0)
    }

    /// ACMD41, SD_SEND_OP_COND, announcing high-capacity support if asked
    pub fn send_op_cond(high_capacity_support: bool) -> CommandFrame {
        let arg = if high_capacity_support { ACMD41_HCS } else { 0 };
        CommandFrame::new(ACMD41, arg)
    }

    /// The command index, without the host marker.
    pub fn command(&self) -> u8 {
        self.bytes[0] & !HOST_COMMAND
    }

    /// The 32-bit argument.
    pub fn argument(&self) -> u32 {
        BigEndian::read_u32(&self.bytes[1..5])
    }

    /// The bytes to clock out.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Perform the 7-bit CRC used on the SD card
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
