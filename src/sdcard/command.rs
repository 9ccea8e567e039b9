//! Sending a command and collecting its R1 response.
//!
//! Every command goes the same way: wait for the card to stop reading as
//! busy, clock out the frame, then clock in single bytes until something
//! that looks like a response turns up. Where the response goes afterwards
//! is carried along in the state as a [`Response`].

use embedded_hal::digital::InputPin;

use super::proto::{CommandFrame, IDLE_BYTE, R1_NO_RESPONSE};
use super::{ErrorKind, Response, SdCard, State};
use crate::bus::BusArbiter;
use crate::indicator::Indicator;
use crate::time::TimeSource;
use crate::trace;

impl<BUS, DET, LED, OUT, CLK> SdCard<BUS, DET, LED, OUT, CLK>
where
    BUS: BusArbiter,
    DET: InputPin,
    LED: Indicator,
    OUT: embedded_io::Write,
    CLK: TimeSource,
{
    /// Start sending `frame`; its response will be handled as `then`.
    ///
    /// Chip select is toggled, and stays asserted from the first busy poll
    /// onwards. A card only drives its busy signal while it is selected.
    pub(super) fn issue_command(&mut self, frame: CommandFrame, then: Response) {
        trace!("CMD{} arg {:x}", frame.command(), frame.argument());
        self.command = frame;
        self.deselect();
        self.select();
        self.start_deadline(self.options.ready_timeout);
        if self.submit(|bus, grant| bus.read_byte(grant)) {
            self.state = State::WaitReady { then };
        }
    }

    /// Keep reading until the card reads `0xFF`, then send the frame.
    pub(super) fn wait_ready(&mut self, then: Response) {
        match self.poll_transfer() {
            Ok(()) if self.rx.current() == IDLE_BYTE => {
                let frame = self.command;
                if self.submit(|bus, grant| bus.write_bytes(grant, frame.as_bytes())) {
                    // Park on the byte clocked in with the trailing 0xFF.
                    self.rx.advance(CommandFrame::LEN);
                    self.start_deadline(self.options.command_timeout);
                    self.state = State::WaitCommand { then };
                }
            }
            Ok(()) => {
                // still busy
                self.rx.advance(1);
                self.submit(|bus, grant| bus.read_byte(grant));
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::WaitReady { then }) {
            self.fail(ErrorKind::Timeout);
        }
    }

    /// Keep reading until a byte with the top bit clear turns up, or we run
    /// out of retries.
    pub(super) fn wait_command(&mut self, then: Response) {
        match self.poll_transfer() {
            Ok(()) if self.rx.current() & R1_NO_RESPONSE != 0 && self.retries > 0 => {
                self.retries -= 1;
                self.rx.advance(1);
                self.submit(|bus, grant| bus.read_byte(grant));
            }
            Ok(()) => {
                // Either a response, or retries are used up and the response
                // handler gets to reject whatever this is.
                self.retries = self.options.command_retries;
                self.state = State::Response(then);
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(_fault)) => self.fail(ErrorKind::TransferFailed),
        }
        if self.timed_out(State::WaitCommand { then }) {
            self.fail(ErrorKind::Timeout);
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
