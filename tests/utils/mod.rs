//! Useful library code for tests
//!
//! A simulated SD card sits behind a simulated shared bus. The card is
//! modelled at the byte level: it parses the command frames clocked out to it
//! and queues its answers, which come back on later bytes of the same (or a
//! following) full-duplex transfer.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::Infallible,
    rc::Rc,
};

use polled_sdcard::{
    bus::BusArbiter, BusGrant, CardState, Indicator, LedMode, MessageToken, Options, Rejected,
    RequesterId, SdCard, TimeSource, TransferStatus,
};
use polled_sdcard::sdcard::{ring::RxBuffer, State};

/// The kinds of card we can pretend to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardKind {
    /// Does not understand CMD8
    V1,
    /// Standard capacity, understands CMD8
    V2,
    /// High capacity
    V2HighCapacity,
}

/// A byte-level model of an SD card in SPI mode.
#[derive(Debug)]
pub struct SimCard {
    pub kind: CardKind,
    /// ACMD41 answers "ready" on this poll (1 = the first one)
    pub ready_after_polls: u32,
    /// Number of `0xFF` bytes the card takes before each R1
    pub r1_delay: usize,
    /// Number of `0xFF` bytes between the CMD17 R1 and the start token
    pub token_delay: usize,
    /// Send the start token at all?
    pub sends_start_token: bool,
    /// Override for the voltage byte echoed in the CMD8 R7
    pub cmd8_voltage: Option<u8>,
    /// Override for the check pattern echoed in the CMD8 R7
    pub cmd8_pattern: Option<u8>,
    /// Override for the R1 to CMD17
    pub cmd17_r1: Option<u8>,
    /// Never drives MISO
    pub silent: bool,
    /// MISO held low, so the card always looks busy
    pub stuck_busy: bool,
    /// Does not answer commands with these indexes
    pub ignores: Vec<u8>,
    /// While selected, the card reads busy for this many bytes before it
    /// will take each command
    pub busy_polls: usize,
    /// Bytes read as busy so far
    pub busy_reads: usize,
    /// Command frames that started while the card was still busy. These are
    /// lost.
    pub frames_while_busy: usize,
    /// Every command received, as (index, argument)
    pub commands: Vec<(u8, u32)>,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    app_cmd: bool,
    polls: u32,
    ready: bool,
    busy_since_command: usize,
}

impl SimCard {
    pub fn new(kind: CardKind) -> SimCard {
        SimCard {
            kind,
            ready_after_polls: 1,
            r1_delay: 0,
            token_delay: 0,
            sends_start_token: true,
            cmd8_voltage: None,
            cmd8_pattern: None,
            cmd17_r1: None,
            silent: false,
            stuck_busy: false,
            ignores: Vec::new(),
            busy_polls: 0,
            busy_reads: 0,
            frames_while_busy: 0,
            commands: Vec::new(),
            out: VecDeque::new(),
            frame: Vec::new(),
            app_cmd: false,
            polls: 0,
            ready: false,
            busy_since_command: 0,
        }
    }

    /// The command indexes received so far, in order.
    pub fn command_indexes(&self) -> Vec<u8> {
        self.commands.iter().map(|(cmd, _arg)| *cmd).collect()
    }

    /// The argument of the most recent command with this index.
    pub fn last_argument(&self, cmd: u8) -> Option<u32> {
        self.commands
            .iter()
            .rev()
            .find(|(c, _)| *c == cmd)
            .map(|(_, arg)| *arg)
    }

    /// Exchange one byte. `selected` is the state of the chip select line.
    pub fn exchange(&mut self, mosi: u8, selected: bool) -> u8 {
        if self.stuck_busy {
            return 0x00;
        }
        if !selected {
            // Deselecting aborts whatever the card was sending.
            self.frame.clear();
            self.out.clear();
            return 0xFF;
        }
        if self.frame.is_empty() && self.out.is_empty() && self.busy_since_command < self.busy_polls {
            self.busy_since_command += 1;
            self.busy_reads += 1;
            if (mosi & 0xC0) == 0x40 {
                self.frames_while_busy += 1;
            }
            return 0x00;
        }
        let miso = self.out.pop_front().unwrap_or(0xFF);
        self.receive(mosi);
        miso
    }

    fn receive(&mut self, mosi: u8) {
        if self.frame.is_empty() && (mosi & 0xC0) != 0x40 {
            // not the start of a command
            return;
        }
        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let cmd = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            self.frame.clear();
            self.commands.push((cmd, arg));
            self.busy_since_command = 0;
            if !self.silent && !self.ignores.contains(&cmd) {
                self.respond(cmd, arg);
            }
        }
    }

    fn respond(&mut self, cmd: u8, arg: u32) {
        let app_cmd = core::mem::replace(&mut self.app_cmd, false);
        let idle = if self.ready { 0x00 } else { 0x01 };
        match (app_cmd, cmd) {
            (_, 0) => {
                self.ready = false;
                self.polls = 0;
                self.r1(0x01);
            }
            (_, 8) if self.kind == CardKind::V1 => self.r1(0x05),
            (_, 8) => {
                self.r1(0x01);
                let voltage = self.cmd8_voltage.unwrap_or((arg >> 8) as u8 & 0x0F);
                let pattern = self.cmd8_pattern.unwrap_or(arg as u8);
                self.out.extend([0x00, 0x00, voltage, pattern]);
            }
            (_, 55) => {
                self.app_cmd = true;
                self.r1(idle);
            }
            (true, 41) => {
                self.polls += 1;
                if self.polls >= self.ready_after_polls {
                    self.ready = true;
                }
                self.r1(if self.ready { 0x00 } else { 0x01 });
            }
            (_, 58) => {
                self.r1(idle);
                let ccs = if self.kind == CardKind::V2HighCapacity { 0x40 } else { 0x00 };
                let busy = if self.ready { 0x80 } else { 0x00 };
                self.out.extend([busy | ccs, 0xFF, 0x80, 0x00]);
            }
            (_, 16) => self.r1(idle),
            (_, 17) => {
                let r1 = self.cmd17_r1.unwrap_or(idle);
                self.r1(r1);
                if r1 != 0x00 {
                    return;
                }
                self.out.extend(std::iter::repeat(0xFF).take(self.token_delay));
                if self.sends_start_token {
                    self.out.push_back(0xFE);
                    self.out.extend(block_pattern(arg));
                    self.out.extend([0x12, 0x34]);
                }
            }
            _ => self.r1(0x05),
        }
    }

    fn r1(&mut self, value: u8) {
        self.out.extend(std::iter::repeat(0xFF).take(self.r1_delay));
        self.out.push_back(value);
    }
}

/// What the simulated card holds at a given card address.
pub fn block_pattern(address: u32) -> [u8; 512] {
    let mut block = [0u8; 512];
    let seed = address.to_le_bytes();
    for (i, b) in block.iter_mut().enumerate() {
        *b = seed[i % 4].wrapping_add((i / 4) as u8);
    }
    block
}

/// Everything the simulated bus knows.
#[derive(Debug)]
pub struct SimBusState {
    pub card: SimCard,
    /// Is the bus currently granted to the driver?
    pub owned: bool,
    /// Is the driver's chip select asserted?
    pub selected: bool,
    /// Refuse this many ownership requests before granting one
    pub deny_requests: usize,
    /// Refuse every transfer submission
    pub reject_submissions: bool,
    /// Transfers never complete
    pub stalled: bool,
    /// Transfers report failure
    pub faulty: bool,
    /// How many polls report `Pending` before a transfer completes
    pub latency: u32,
    pub grants: usize,
    pub releases: usize,
    /// The longest single transfer submitted
    pub longest_transfer: usize,
    pending: Option<(MessageToken, Vec<u8>, bool, u32)>,
    next_token: u32,
}

/// A bus arbiter in front of a [`SimCard`]. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimBus {
    state: Rc<RefCell<SimBusState>>,
}

impl SimBus {
    pub fn new(card: SimCard) -> SimBus {
        SimBus {
            state: Rc::new(RefCell::new(SimBusState {
                card,
                owned: false,
                selected: false,
                deny_requests: 0,
                reject_submissions: false,
                stalled: false,
                faulty: false,
                latency: 1,
                grants: 0,
                releases: 0,
                longest_transfer: 0,
                pending: None,
                next_token: 1,
            })),
        }
    }

    /// Look at, or change, the bus and card.
    pub fn with<R>(&self, func: impl FnOnce(&mut SimBusState) -> R) -> R {
        func(&mut self.state.borrow_mut())
    }

    fn submit(&mut self, grant: &BusGrant, bytes: Vec<u8>) -> Result<MessageToken, Rejected> {
        let mut state = self.state.borrow_mut();
        assert_eq!(grant.owner(), DRIVER_ID);
        if !state.owned || state.reject_submissions {
            return Err(Rejected);
        }
        let token = MessageToken::new(state.next_token).expect("tokens start at one");
        state.next_token += 1;
        state.longest_transfer = state.longest_transfer.max(bytes.len());
        // Chip select is sampled when the transfer is queued.
        let selected = state.selected;
        let latency = state.latency;
        state.pending = Some((token, bytes, selected, latency));
        Ok(token)
    }
}

/// The consumer id the simulated bus hands out.
pub const DRIVER_ID: u8 = 3;

impl BusArbiter for SimBus {
    fn request(&mut self) -> Option<BusGrant> {
        let mut state = self.state.borrow_mut();
        assert!(!state.owned, "asked for the bus twice");
        if state.deny_requests > 0 {
            state.deny_requests -= 1;
            return None;
        }
        state.owned = true;
        state.grants += 1;
        Some(BusGrant::new(DRIVER_ID))
    }

    fn release(&mut self, grant: BusGrant) {
        let mut state = self.state.borrow_mut();
        assert_eq!(grant.owner(), DRIVER_ID);
        assert!(state.owned, "released a bus we did not own");
        state.owned = false;
        state.releases += 1;
        state.pending = None;
    }

    fn assert_select(&mut self, _grant: &BusGrant) {
        self.state.borrow_mut().selected = true;
    }

    fn deassert_select(&mut self, _grant: &BusGrant) {
        self.state.borrow_mut().selected = false;
    }

    fn read_bytes(&mut self, grant: &BusGrant, len: usize) -> Result<MessageToken, Rejected> {
        self.submit(grant, vec![0xFF; len])
    }

    fn write_bytes(&mut self, grant: &BusGrant, bytes: &[u8]) -> Result<MessageToken, Rejected> {
        self.submit(grant, bytes.to_vec())
    }

    fn poll<const N: usize>(&mut self, token: MessageToken, rx: &mut RxBuffer<N>) -> TransferStatus {
        let mut state = self.state.borrow_mut();
        if state.stalled {
            return TransferStatus::Pending;
        }
        if state.faulty {
            return TransferStatus::Failed(polled_sdcard::BusFault::Spi);
        }
        let Some((pending_token, bytes, selected, latency)) = state.pending.take() else {
            return TransferStatus::Failed(polled_sdcard::BusFault::UnknownToken);
        };
        assert_eq!(pending_token, token, "polled a stale token");
        if latency > 0 {
            state.pending = Some((pending_token, bytes, selected, latency - 1));
            return TransferStatus::Pending;
        }
        for mosi in bytes {
            let miso = state.card.exchange(mosi, selected);
            rx.push(miso);
        }
        TransferStatus::Complete
    }
}

/// A millisecond counter we move by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<u32>>);

impl ManualClock {
    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }

    pub fn set(&self, ms: u32) {
        self.0.set(ms);
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> u32 {
        self.0.get()
    }
}

/// An active-low card-detect switch.
#[derive(Debug, Clone)]
pub struct DetectSwitch(Rc<Cell<bool>>);

impl DetectSwitch {
    /// A switch with a card in the slot.
    pub fn inserted() -> DetectSwitch {
        DetectSwitch(Rc::new(Cell::new(true)))
    }

    pub fn set_present(&self, present: bool) {
        self.0.set(present);
    }
}

impl embedded_hal::digital::ErrorType for DetectSwitch {
    type Error = Infallible;
}

impl embedded_hal::digital::InputPin for DetectSwitch {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0.get())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.get())
    }
}

/// Remembers every indicator request.
#[derive(Debug, Clone, Default)]
pub struct LedLog(Rc<RefCell<Vec<(RequesterId, LedMode)>>>);

impl LedLog {
    pub fn last(&self) -> Option<LedMode> {
        self.0.borrow().last().map(|(_, mode)| *mode)
    }

    pub fn modes(&self) -> Vec<LedMode> {
        self.0.borrow().iter().map(|(_, mode)| *mode).collect()
    }

    pub fn requesters(&self) -> Vec<RequesterId> {
        self.0.borrow().iter().map(|(who, _)| *who).collect()
    }
}

impl Indicator for LedLog {
    fn request(&mut self, requester: RequesterId, mode: LedMode) {
        self.0.borrow_mut().push((requester, mode));
    }
}

/// Collects diagnostic text.
#[derive(Debug, Clone, Default)]
pub struct DebugLog(Rc<RefCell<Vec<u8>>>);

impl DebugLog {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl embedded_io::ErrorType for DebugLog {
    type Error = Infallible;
}

impl embedded_io::Write for DebugLog {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

pub type TestCard = SdCard<SimBus, DetectSwitch, LedLog, DebugLog, ManualClock>;

/// A driver wired up to a simulated card, plus handles on everything around
/// it.
pub struct Harness {
    pub sdcard: TestCard,
    pub bus: SimBus,
    pub clock: ManualClock,
    pub detect: DetectSwitch,
    pub leds: LedLog,
    pub out: DebugLog,
}

impl Harness {
    /// A started driver with a card already inserted.
    pub fn new(card: SimCard) -> Harness {
        Harness::with_options(card, Options::default())
    }

    pub fn with_options(card: SimCard, options: Options) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus = SimBus::new(card);
        let clock = ManualClock::default();
        clock.set(1_000);
        let detect = DetectSwitch::inserted();
        let leds = LedLog::default();
        let out = DebugLog::default();
        let mut sdcard = SdCard::new_with_options(
            bus.clone(),
            detect.clone(),
            leds.clone(),
            out.clone(),
            clock.clone(),
            options,
        );
        sdcard.initialize();
        Harness {
            sdcard,
            bus,
            clock,
            detect,
            leds,
            out,
        }
    }

    /// One scheduler period.
    pub fn tick(&mut self) {
        self.clock.advance(1);
        self.sdcard.tick();
    }

    /// Tick until `done` holds, giving up after `limit` ticks. Returns the
    /// number of ticks taken.
    pub fn tick_until(&mut self, limit: u32, done: impl Fn(&TestCard) -> bool) -> Option<u32> {
        for n in 1..=limit {
            self.tick();
            if done(&self.sdcard) {
                return Some(n);
            }
        }
        None
    }

    /// Tick until the card is identified and idle.
    pub fn bring_up(&mut self) {
        let ticks = self.tick_until(500, |c| {
            c.state() == State::ReadyIdle && c.status() == CardState::Idle
        });
        assert!(
            ticks.is_some(),
            "card never came up: {:?} / {:?}, output {:?}",
            self.sdcard.state(),
            self.sdcard.last_error(),
            self.out.text()
        );
    }

    /// Commands the card has seen.
    pub fn commands(&self) -> Vec<u8> {
        self.bus.with(|s| s.card.command_indexes())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
