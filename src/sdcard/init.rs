//! Card detection and identification.
//!
//! Takes a freshly inserted card from power-up to an identified card in SPI
//! mode, working out on the way whether it is a v1 or v2 card and whether it
//! is byte- or block-addressed.

use embedded_hal::digital::InputPin;

use super::proto::{
    CommandFrame, CMD8_CHECK_PATTERN, CMD8_VHS, OCR_CCS_BIT, R1_IDLE_STATE, R1_READY_STATE,
    REGISTER_LEN,
};
use super::{CardFlags, CardState, ErrorKind, Resume, Response, SdCard, State, MSG_READY};
use crate::bus::BusArbiter;
use crate::indicator::{Indicator, LedMode};
use crate::time::{Deadline, TimeSource};
use crate::{debug, trace};

impl<BUS, DET, LED, OUT, CLK> SdCard<BUS, DET, LED, OUT, CLK>
where
    BUS: BusArbiter,
    DET: InputPin,
    LED: Indicator,
    OUT: embedded_io::Write,
    CLK: TimeSource,
{
    /// Wait for a card, then grab the bus and wake it up.
    pub(super) fn no_card(&mut self) {
        if !self.card_present() {
            return;
        }
        if !self.acquire_bus(Resume::NoCard) {
            return;
        }
        debug!("Card inserted, identifying");
        self.flags.remove(CardFlags::CARD_TYPE);
        self.init_deadline = None;
        self.rx.flush();
        self.indicate(LedMode::Blink1Hz);
        // The card wants at least 74 clocks with CS high before CMD0.
        self.deselect();
        let count = self.options.wake_bytes;
        self.start_deadline(self.options.transfer_timeout);
        if self.submit(|bus, grant| bus.read_bytes(grant, count)) {
            self.state = State::WakeUp;
        }
    }

    pub(super) fn wake_up(&mut self) {
        match self.poll_transfer() {
            Ok(()) => {
                self.rx.advance(self.options.wake_bytes);
                self.issue_command(CommandFrame::go_idle(), Response::Cmd0);
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::WakeUp) {
            self.fail(ErrorKind::Timeout);
        }
    }

    pub(super) fn response_cmd0(&mut self, r1: u8) {
        if r1 == R1_IDLE_STATE {
            self.issue_command(CommandFrame::send_if_cond(), Response::Cmd8);
        } else {
            self.fail(ErrorKind::BadResponse);
        }
    }

    pub(super) fn response_cmd8(&mut self, r1: u8) {
        if r1 == R1_IDLE_STATE {
            self.flags.insert(CardFlags::TYPE_V2);
            self.start_deadline(self.options.transfer_timeout);
            if self.submit(|bus, grant| bus.read_bytes(grant, REGISTER_LEN)) {
                self.state = State::ReadCmd8;
            }
        } else {
            debug!("CMD8 not supported (R1 {:x}), assuming a v1 card", r1);
            self.issue_command(CommandFrame::app_cmd(), Response::Cmd55);
        }
    }

    /// Check the R7 echo: voltage accepted in byte 3, check pattern in byte 4.
    pub(super) fn read_cmd8(&mut self) {
        match self.poll_transfer() {
            Ok(()) => {
                let voltage = self.rx.peek(2);
                let pattern = self.rx.peek(3);
                self.rx.advance(REGISTER_LEN);
                if voltage != CMD8_VHS {
                    self.fail(ErrorKind::CardVoltageUnsupported);
                } else if pattern != CMD8_CHECK_PATTERN {
                    self.fail(ErrorKind::BadResponse);
                } else {
                    self.issue_command(CommandFrame::app_cmd(), Response::Cmd55);
                }
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::ReadCmd8) {
            self.fail(ErrorKind::Timeout);
        }
    }

    pub(super) fn response_cmd55(&mut self, r1: u8) {
        if r1 != R1_IDLE_STATE {
            self.fail(ErrorKind::BadResponse);
            return;
        }
        if self.init_deadline.is_none() {
            if let Some(timeout) = self.options.init_timeout {
                self.init_deadline = Some(Deadline::start(self.clock.now_ms(), timeout));
            }
        }
        let hcs = self.flags.contains(CardFlags::TYPE_V2);
        self.issue_command(CommandFrame::send_op_cond(hcs), Response::Acmd41);
    }

    pub(super) fn response_acmd41(&mut self, r1: u8) {
        match r1 {
            R1_READY_STATE if self.flags.contains(CardFlags::TYPE_V2) => {
                self.issue_command(CommandFrame::read_ocr(), Response::Cmd58);
            }
            R1_READY_STATE => {
                self.flags.insert(CardFlags::TYPE_V1);
                self.issue_command(CommandFrame::set_block_len(), Response::Cmd16);
            }
            R1_IDLE_STATE => {
                let now = self.clock.now_ms();
                if self.init_deadline.map_or(false, |d| d.is_up(now)) {
                    self.fail(ErrorKind::Timeout);
                } else {
                    trace!("Card still initialising");
                    self.issue_command(CommandFrame::app_cmd(), Response::Cmd55);
                }
            }
            _ => self.fail(ErrorKind::BadResponse),
        }
    }

    pub(super) fn response_cmd58(&mut self, r1: u8) {
        if r1 == R1_READY_STATE {
            self.start_deadline(self.options.transfer_timeout);
            if self.submit(|bus, grant| bus.read_bytes(grant, REGISTER_LEN)) {
                self.state = State::ReadOcr;
            }
        } else {
            self.fail(ErrorKind::BadResponse);
        }
    }

    pub(super) fn read_ocr(&mut self) {
        match self.poll_transfer() {
            Ok(()) => {
                let ocr = self.rx.current();
                self.rx.advance(REGISTER_LEN);
                if ocr & OCR_CCS_BIT != 0 {
                    self.flags.insert(CardFlags::HIGH_CAPACITY);
                    self.finish_init();
                } else {
                    self.issue_command(CommandFrame::set_block_len(), Response::Cmd16);
                }
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::ReadOcr) {
            self.fail(ErrorKind::Timeout);
        }
    }

    pub(super) fn response_cmd16(&mut self, r1: u8) {
        if r1 == R1_READY_STATE {
            self.finish_init();
        } else {
            self.fail(ErrorKind::BadResponse);
        }
    }

    fn finish_init(&mut self) {
        self.release_bus();
        self.status = CardState::Idle;
        self.indicate(LedMode::On);
        self.print(MSG_READY);
        debug!("Card initialised: {:?}", self.card_type());
        self.state = State::ReadyIdle;
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
