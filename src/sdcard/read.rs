//! Serving block reads once the card is identified.

use embedded_hal::digital::InputPin;

use super::proto::{CommandFrame, DATA_CRC_LEN, DATA_START_BLOCK, R1_READY_STATE};
use super::{CardFlags, CardState, Error, ErrorKind, Resume, Response, SdCard, State};
use crate::blockdevice::{Block, BlockIdx, BLOCK_LEN};
use crate::bus::BusArbiter;
use crate::indicator::{Indicator, LedMode};
use crate::time::TimeSource;
use crate::{debug, trace, warn};

impl<BUS, DET, LED, OUT, CLK> SdCard<BUS, DET, LED, OUT, CLK>
where
    BUS: BusArbiter,
    DET: InputPin,
    LED: Indicator,
    OUT: embedded_io::Write,
    CLK: TimeSource,
{
    /// Ask for a block to be read.
    ///
    /// Only accepted while the card is [`CardState::Idle`]. The read then
    /// happens over the following ticks; the status goes to
    /// [`CardState::Reading`] and then [`CardState::DataReady`], at which
    /// point [`SdCard::read_data`] hands over the block.
    pub fn read_block(&mut self, block_idx: BlockIdx) -> Result<(), Error> {
        if self.status != CardState::Idle {
            return Err(Error::BadState(self.status));
        }
        self.address = block_idx.card_address(self.flags.contains(CardFlags::HIGH_CAPACITY));
        debug!("Read {:?} at card address {}", block_idx, self.address);
        self.status = CardState::Reading;
        Ok(())
    }

    /// Ask for a block to be written.
    ///
    /// Writing is not supported, so this always fails.
    pub fn write_block(&mut self, _block_idx: BlockIdx) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Collect the block read by the last [`SdCard::read_block`].
    ///
    /// Only possible once the status is [`CardState::DataReady`]; this puts
    /// the card back to [`CardState::Idle`].
    pub fn read_data(&mut self, destination: &mut Block) -> Result<(), Error> {
        if self.status != CardState::DataReady {
            return Err(Error::BadState(self.status));
        }
        destination.copy_from_slice(&self.rx.as_slice()[..BLOCK_LEN]);
        self.status = CardState::Idle;
        Ok(())
    }

    /// Watch for removal and for new requests.
    pub(super) fn ready_idle(&mut self) {
        if !self.card_present() {
            debug!("Card removed");
            self.indicate(LedMode::Off);
            self.flags.remove(CardFlags::CARD_TYPE);
            self.enter_settle(Resume::NoCard);
            return;
        }
        match self.status {
            CardState::Reading => {
                if self.acquire_bus(Resume::ReadyIdle) {
                    let frame = CommandFrame::read_single_block(self.address);
                    self.issue_command(frame, Response::Cmd17);
                }
            }
            CardState::Writing => {
                warn!("Block writes are not supported");
                self.status = CardState::Idle;
            }
            _ => {}
        }
    }

    pub(super) fn response_cmd17(&mut self, r1: u8) {
        if r1 == R1_READY_STATE {
            self.start_deadline(self.options.start_token_timeout);
            if self.submit(|bus, grant| bus.read_byte(grant)) {
                self.state = State::WaitStartToken;
            }
        } else {
            self.fail_transfer(ErrorKind::BadResponse);
        }
    }

    pub(super) fn wait_start_token(&mut self) {
        match self.poll_transfer() {
            Ok(()) if self.rx.current() == DATA_START_BLOCK => {
                // Land the block at the start of the buffer.
                self.rx.rewind();
                self.start_deadline(self.options.sector_read_timeout);
                if self.submit(|bus, grant| bus.read_bytes(grant, BLOCK_LEN + DATA_CRC_LEN)) {
                    self.state = State::DataTransfer;
                }
            }
            Ok(()) => {
                self.rx.advance(1);
                self.submit(|bus, grant| bus.read_byte(grant));
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail_transfer(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::WaitStartToken) {
            self.fail_transfer(ErrorKind::NoSdToken);
        }
    }

    pub(super) fn data_transfer(&mut self) {
        match self.poll_transfer() {
            Ok(()) => {
                // The CRC is clocked in but not checked.
                self.release_bus();
                self.rx.rewind();
                self.status = CardState::DataReady;
                self.state = State::ReadyIdle;
                trace!("Block read complete");
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::DataTransfer) {
            self.fail(ErrorKind::Timeout);
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
