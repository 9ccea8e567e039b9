//! A tick-driven SD card driver.
//!
//! Drives an SD card in SPI mode over a shared bus. The driver is a state
//! machine: [`SdCard::tick`] performs one step and returns, so it can be
//! called from a cooperative superloop alongside every other peripheral task.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod proto;
pub mod ring;

mod command;
mod init;
mod read;

// ****************************************************************************
// Imports
// ****************************************************************************

use bitflags::bitflags;
use embedded_hal::digital::InputPin;
use fugit::MillisDurationU32;

use crate::bus::{BusArbiter, BusFault, BusGrant, MessageToken, Rejected};
use crate::indicator::{Indicator, LedMode, RequesterId};
use crate::time::{Deadline, TimeSource};
use crate::{debug, trace, warn};
use proto::CommandFrame;
use ring::RxBuffer;

// ****************************************************************************
// Constants
// ****************************************************************************

/// Capacity of the receive buffer. Must hold a whole block plus its CRC.
pub const RX_BUFFER_LEN: usize = 1024;

const MSG_STARTED: &[u8] = b"SdCard task initialized\r\n";
const MSG_BUS_DENIED: &[u8] = b"SdCard denied bus\r\n";
const MSG_READY: &[u8] = b"SD ready\r\n";
const MSG_ERROR: &[u8] = b"SD error: ";

// ****************************************************************************
// Types and Implementations
// ****************************************************************************

/// Driver for an SD Card on a shared SPI bus.
///
/// Built from a [`BusArbiter`] for the shared bus, the card-detect input
/// pin, a status [`Indicator`], a diagnostic text sink and a [`TimeSource`].
///
/// Nothing happens until [`SdCard::tick`] is called. Call it once per
/// scheduler period; it never blocks. Poll [`SdCard::status`] to find out
/// what the card is doing.
pub struct SdCard<BUS, DET, LED, OUT, CLK>
where
    BUS: BusArbiter,
    DET: InputPin,
    LED: Indicator,
    OUT: embedded_io::Write,
    CLK: TimeSource,
{
    bus: BUS,
    detect: DET,
    indicator: LED,
    debug_out: OUT,
    clock: CLK,
    options: Options,
    state: State,
    status: CardState,
    flags: CardFlags,
    error: Option<ErrorKind>,
    grant: Option<BusGrant>,
    token: Option<MessageToken>,
    rx: RxBuffer<RX_BUFFER_LEN>,
    command: CommandFrame,
    retries: u8,
    deadline: Deadline,
    init_deadline: Option<Deadline>,
    address: u32,
}

impl<BUS, DET, LED, OUT, CLK> SdCard<BUS, DET, LED, OUT, CLK>
where
    BUS: BusArbiter,
    DET: InputPin,
    LED: Indicator,
    OUT: embedded_io::Write,
    CLK: TimeSource,
{
    /// Create a new SD Card driver.
    ///
    /// Uses the default options.
    pub fn new(
        bus: BUS,
        detect: DET,
        indicator: LED,
        debug_out: OUT,
        clock: CLK,
    ) -> SdCard<BUS, DET, LED, OUT, CLK> {
        Self::new_with_options(bus, detect, indicator, debug_out, clock, Options::default())
    }

    /// Create a new SD Card driver with the given options.
    ///
    /// The driver starts out waiting for a card. Call
    /// [`SdCard::initialize`] once at start-up to also reset the status light
    /// and announce the task on the diagnostic output.
    pub fn new_with_options(
        bus: BUS,
        detect: DET,
        indicator: LED,
        debug_out: OUT,
        clock: CLK,
        options: Options,
    ) -> SdCard<BUS, DET, LED, OUT, CLK> {
        let now = clock.now_ms();
        SdCard {
            bus,
            detect,
            indicator,
            debug_out,
            clock,
            retries: options.command_retries,
            deadline: Deadline::start(now, options.settle_time),
            options,
            state: State::NoCard,
            status: CardState::NoCard,
            flags: CardFlags::empty(),
            error: None,
            grant: None,
            token: None,
            rx: RxBuffer::new(),
            command: CommandFrame::go_idle(),
            init_deadline: None,
            address: 0,
        }
    }

    /// Put the driver into its start-up state.
    ///
    /// Clears the receive buffer, switches the status light off, prints a
    /// banner and waits for a card. Any bus ownership held is given back.
    pub fn initialize(&mut self) {
        debug!("SD card task starting with opts: {:?}", self.options);
        self.release_bus();
        self.rx.clear();
        self.flags = CardFlags::empty();
        self.status = CardState::NoCard;
        self.error = None;
        self.retries = self.options.command_retries;
        self.init_deadline = None;
        self.indicate(LedMode::Off);
        self.print(MSG_STARTED);
        self.state = State::NoCard;
    }

    /// Run one step of the state machine.
    ///
    /// Call this once per scheduler period. It always returns promptly.
    pub fn tick(&mut self) {
        match self.state {
            State::NoCard => self.no_card(),
            State::Settle { resume } => self.settle(resume),
            State::WakeUp => self.wake_up(),
            State::WaitReady { then } => self.wait_ready(then),
            State::WaitCommand { then } => self.wait_command(then),
            State::Response(response) => {
                let r1 = self.rx.current();
                self.rx.advance(1);
                trace!("{:?} R1 = {:x}", response, r1);
                match response {
                    Response::Cmd0 => self.response_cmd0(r1),
                    Response::Cmd8 => self.response_cmd8(r1),
                    Response::Cmd55 => self.response_cmd55(r1),
                    Response::Acmd41 => self.response_acmd41(r1),
                    Response::Cmd58 => self.response_cmd58(r1),
                    Response::Cmd16 => self.response_cmd16(r1),
                    Response::Cmd17 => self.response_cmd17(r1),
                }
            }
            State::ReadCmd8 => self.read_cmd8(),
            State::ReadOcr => self.read_ocr(),
            State::ReadyIdle => self.ready_idle(),
            State::WaitStartToken => self.wait_start_token(),
            State::DataTransfer => self.data_transfer(),
        }
    }

    /// What the card is doing.
    pub fn status(&self) -> CardState {
        self.status
    }

    /// Card presence and type flags.
    pub fn flags(&self) -> CardFlags {
        self.flags
    }

    /// The type of the card, if one has been identified.
    pub fn card_type(&self) -> Option<CardType> {
        if self.flags.contains(CardFlags::HIGH_CAPACITY) {
            Some(CardType::SDHC)
        } else if self.flags.contains(CardFlags::TYPE_V2) {
            Some(CardType::SD2)
        } else if self.flags.contains(CardFlags::TYPE_V1) {
            Some(CardType::SD1)
        } else {
            None
        }
    }

    /// The current step of the state machine.
    pub fn state(&self) -> State {
        self.state
    }

    /// The most recent fault, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Get a temporary borrow on the bus arbiter.
    ///
    /// The given closure will be called exactly once, and will be passed a
    /// mutable reference to the arbiter.
    pub fn bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut BUS) -> T,
    {
        func(&mut self.bus)
    }

    /// Check the card-detect line.
    ///
    /// A missing card forces the status to [`CardState::NoCard`].
    fn card_present(&mut self) -> bool {
        let present = match self.detect.is_high() {
            Ok(high) => high != self.options.detect_active_low,
            Err(_e) => {
                warn!("Card detect line unreadable");
                false
            }
        };
        if present {
            self.flags.insert(CardFlags::INSERTED);
        } else {
            self.flags.remove(CardFlags::INSERTED);
            self.status = CardState::NoCard;
        }
        present
    }

    /// Wait out the settle time, then carry on in `resume`.
    fn settle(&mut self, resume: Resume) {
        if !self.deadline_passed() {
            return;
        }
        match resume {
            Resume::NoCard => {
                self.indicate(LedMode::Off);
                self.state = State::NoCard;
            }
            Resume::ReadyIdle => {
                self.indicate(LedMode::On);
                if self.status == CardState::CardError {
                    self.status = CardState::Idle;
                }
                self.state = State::ReadyIdle;
            }
        }
        trace!("Settled, now {:?}", self.state);
    }

    fn enter_settle(&mut self, resume: Resume) {
        self.start_deadline(self.options.settle_time);
        self.state = State::Settle { resume };
    }

    /// Give up on the card: release everything and go back to detection.
    fn fail(&mut self, kind: ErrorKind) {
        warn!("SD error: {:?} in {:?}", kind, self.state);
        self.release_bus();
        self.rx.flush();
        self.retries = self.options.command_retries;
        self.error = Some(kind);
        self.indicate(LedMode::Blink8Hz);
        self.print(MSG_ERROR);
        self.print(kind.message());
        self.status = CardState::NoCard;
        self.enter_settle(Resume::NoCard);
    }

    /// Give up on the current block read, but keep the card.
    fn fail_transfer(&mut self, kind: ErrorKind) {
        warn!("Block read failed: {:?} in {:?}", kind, self.state);
        self.release_bus();
        self.rx.flush();
        self.error = Some(kind);
        self.status = CardState::CardError;
        self.enter_settle(Resume::ReadyIdle);
    }

    fn release_bus(&mut self) {
        if let Some(grant) = self.grant.take() {
            self.bus.deassert_select(&grant);
            self.bus.release(grant);
        }
        self.token = None;
    }

    /// Ask for the bus. On refusal, wait a while and then go back to
    /// `resume`.
    fn acquire_bus(&mut self, resume: Resume) -> bool {
        match self.bus.request() {
            Some(grant) => {
                self.grant = Some(grant);
                true
            }
            None => {
                warn!("Bus busy, retrying later");
                self.print(MSG_BUS_DENIED);
                self.enter_settle(resume);
                false
            }
        }
    }

    /// Queue a transfer with the bus we hold. A refused submission is a
    /// [`ErrorKind::NoToken`] fault.
    fn submit<F>(&mut self, func: F) -> bool
    where
        F: FnOnce(&mut BUS, &BusGrant) -> Result<MessageToken, Rejected>,
    {
        let result = match self.grant.as_ref() {
            Some(grant) => func(&mut self.bus, grant).map_err(|_| ErrorKind::NoToken),
            None => Err(ErrorKind::Unknown),
        };
        match result {
            Ok(token) => {
                self.token = Some(token);
                true
            }
            Err(kind) => {
                self.fail(kind);
                false
            }
        }
    }

    /// Check on the transfer we queued last.
    fn poll_transfer(&mut self) -> nb::Result<(), BusFault> {
        match self.token {
            Some(token) => self.bus.poll(token, &mut self.rx).into_nb(),
            None => Err(nb::Error::Other(BusFault::UnknownToken)),
        }
    }

    fn select(&mut self) {
        if let Some(grant) = self.grant.as_ref() {
            self.bus.assert_select(grant);
        }
    }

    fn deselect(&mut self) {
        if let Some(grant) = self.grant.as_ref() {
            self.bus.deassert_select(grant);
        }
    }

    fn start_deadline(&mut self, timeout: MillisDurationU32) {
        self.deadline = Deadline::start(self.clock.now_ms(), timeout);
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_up(self.clock.now_ms())
    }

    /// Are we still in `waiting`, with its deadline gone?
    fn timed_out(&self, waiting: State) -> bool {
        self.state == waiting && self.deadline_passed()
    }

    fn indicate(&mut self, mode: LedMode) {
        self.indicator.request(self.options.requester, mode);
    }

    /// Best-effort diagnostic output.
    fn print(&mut self, text: &[u8]) {
        if self.debug_out.write_all(text).is_err() {
            trace!("Diagnostic output dropped");
        }
    }
}

/// Options for the driver.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct Options {
    /// How long to wait after an error, a removal or a refused bus request
    /// before trying again.
    pub settle_time: MillisDurationU32,
    /// How long a plain data transfer (wake-up clocks, register reads) may
    /// take.
    pub transfer_timeout: MillisDurationU32,
    /// How long the card may stay busy before accepting a command.
    pub ready_timeout: MillisDurationU32,
    /// How long a command may take to get a response.
    pub command_timeout: MillisDurationU32,
    /// How long to wait for the start-of-block token after a read command.
    pub start_token_timeout: MillisDurationU32,
    /// How long the 512 byte block itself may take to arrive.
    pub sector_read_timeout: MillisDurationU32,
    /// How long the card may keep answering "idle" to ACMD41 before we give
    /// up. The default, `None`, keeps polling for as long as the card keeps
    /// answering.
    pub init_timeout: Option<MillisDurationU32>,
    /// How many extra bytes to clock in looking for a command response.
    pub command_retries: u8,
    /// How many bytes of `0xFF` to clock out to wake the card up.
    pub wake_bytes: usize,
    /// Set if the card-detect line reads low when a card is inserted.
    pub detect_active_low: bool,
    /// Who we are when asking for the status light.
    pub requester: RequesterId,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            settle_time: MillisDurationU32::millis(100),
            transfer_timeout: MillisDurationU32::millis(10),
            ready_timeout: MillisDurationU32::millis(250),
            command_timeout: MillisDurationU32::millis(100),
            start_token_timeout: MillisDurationU32::millis(100),
            sector_read_timeout: MillisDurationU32::millis(100),
            init_timeout: None,
            command_retries: 8,
            wake_bytes: 10,
            detect_active_low: true,
            requester: RequesterId(0),
        }
    }
}

/// The externally visible state of the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardState {
    /// No card is inserted, or it is still being identified
    NoCard,
    /// The last block read failed
    CardError,
    /// Ready for a read or a write to be requested
    Idle,
    /// A block is being read
    Reading,
    /// A block has been read and is waiting to be collected
    DataReady,
    /// A block is being written
    Writing,
}

bitflags! {
    /// What we know about the inserted card.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct CardFlags: u8 {
        /// The card-detect line says a card is present
        const INSERTED = 1 << 0;
        /// A version 1.x card (did not understand CMD8)
        const TYPE_V1 = 1 << 1;
        /// A version 2.x card (answered CMD8)
        const TYPE_V2 = 1 << 2;
        /// A block-addressed, high-capacity card
        const HIGH_CAPACITY = 1 << 3;
        /// Everything learned during identification
        const CARD_TYPE = Self::TYPE_V1.bits() | Self::TYPE_V2.bits() | Self::HIGH_CAPACITY.bits();
    }
}

/// Things that can go wrong while talking to the card.
///
/// These never reach the caller directly. They select the diagnostic message
/// and are available from [`SdCard::last_error`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// Something we have no better name for
    Unknown = 0,
    /// A wait ran past its deadline
    Timeout = 1,
    /// The card cannot run at our supply voltage
    CardVoltageUnsupported = 2,
    /// The card answered, but not what we expected
    BadResponse = 3,
    /// The bus refused to queue a transfer
    NoToken = 4,
    /// The card never sent the start of the data block
    NoSdToken = 5,
    /// The bus gave up on a queued transfer
    TransferFailed = 6,
}

impl ErrorKind {
    /// Diagnostic text for this fault.
    pub const fn message(self) -> &'static [u8] {
        match self {
            ErrorKind::Timeout => b"TIMEOUT\r\n",
            ErrorKind::CardVoltageUnsupported => b"CARD_VOLTAGE\r\n",
            ErrorKind::BadResponse => b"BAD_RESPONSE\r\n",
            ErrorKind::NoToken => b"NO_TOKEN\r\n",
            ErrorKind::NoSdToken => b"NO_SD_TOKEN\r\n",
            ErrorKind::TransferFailed => b"TRANSFER_FAILED\r\n",
            ErrorKind::Unknown => b"UNKNOWN\r\n",
        }
    }
}

impl From<u8> for ErrorKind {
    fn from(code: u8) -> ErrorKind {
        match code {
            1 => ErrorKind::Timeout,
            2 => ErrorKind::CardVoltageUnsupported,
            3 => ErrorKind::BadResponse,
            4 => ErrorKind::NoToken,
            5 => ErrorKind::NoSdToken,
            6 => ErrorKind::TransferFailed,
            _ => ErrorKind::Unknown,
        }
    }
}

/// The ways the public API of [`SdCard`] can refuse a request.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Can't perform this operation with the card in this state
    BadState(CardState),
    /// This driver cannot do that
    Unsupported,
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// An standard-capacity SD Card supporting v1.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD1,
    /// An standard-capacity SD Card supporting v2.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD2,
    /// An high-capacity 'SDHC' Card.
    ///
    /// Uses block-addressing internally to support capacities above 2GiB.
    SDHC,
}

/// The steps of the driver's state machine.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Waiting for a card to be inserted
    NoCard,
    /// Waiting a little before carrying on
    Settle {
        /// Where to go once the wait is over
        resume: Resume,
    },
    /// Clocking out the wake-up bytes
    WakeUp,
    /// Waiting for the card to stop being busy before sending a command
    WaitReady {
        /// Where to go with the response
        then: Response,
    },
    /// Waiting for the command to go out and the response to come back
    WaitCommand {
        /// Where to go with the response
        then: Response,
    },
    /// Handling the R1 response of a command
    Response(Response),
    /// Reading the R7 payload of CMD8
    ReadCmd8,
    /// Reading the OCR payload of CMD58
    ReadOcr,
    /// Card identified and waiting for requests
    ReadyIdle,
    /// Looking for the start of the data block
    WaitStartToken,
    /// Clocking in the data block
    DataTransfer,
}

/// Where a [`State::Settle`] wait goes next.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Start detection again
    NoCard,
    /// Keep the identified card
    ReadyIdle,
}

/// Which command a response belongs to.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Response {
    /// GO_IDLE_STATE
    Cmd0,
    /// SEND_IF_COND
    Cmd8,
    /// APP_CMD, ahead of ACMD41
    Cmd55,
    /// SD_SEND_OP_COND
    Acmd41,
    /// READ_OCR
    Cmd58,
    /// SET_BLOCKLEN
    Cmd16,
    /// READ_SINGLE_BLOCK
    Cmd17,
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
