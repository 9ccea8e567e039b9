//! A [`BusArbiter`] for an `embedded-hal` SPI bus.
//!
//! The SPI bus itself lives in a [`SpiBusState`], which also records who
//! currently owns it. Several [`SpiArbiter`]s, one per device, can share the
//! state through a `RefCell` (single-threaded) or an `embassy-sync` blocking
//! mutex.
//!
//! Transfers are carried out as soon as they are submitted, so by the time
//! the token is polled the result is already waiting. Only the most recent
//! transfer is kept; submitting another one forgets it.

use core::cell::RefCell;

use embedded_hal::{digital::OutputPin, spi::SpiBus};

use super::{BusArbiter, BusFault, BusGrant, MessageToken, Rejected, TransferStatus};
use crate::sdcard::proto::IDLE_BYTE;
use crate::sdcard::ring::RxBuffer;
use crate::{trace, warn};

/// Default size of the largest transfer: one block, its CRC and some slack.
pub const DEFAULT_TRANSFER_LEN: usize = 520;

/// An SPI bus, plus a note of which consumer owns it.
pub struct SpiBusState<BUS> {
    bus: BUS,
    owner: Option<u8>,
}

impl<BUS> SpiBusState<BUS> {
    /// Wrap a bus nobody owns yet.
    pub const fn new(bus: BUS) -> SpiBusState<BUS> {
        SpiBusState { bus, owner: None }
    }

    /// The consumer currently holding the bus.
    pub fn owner(&self) -> Option<u8> {
        self.owner
    }

    /// Get the bus back.
    pub fn free(self) -> BUS {
        self.bus
    }
}

/// Somewhere a [`SpiBusState`] can be shared from.
pub trait SharedBus {
    /// The SPI bus being shared.
    type Bus: SpiBus;

    /// Run `func` with exclusive access to the bus state.
    fn with_bus<R, F>(&self, func: F) -> R
    where
        F: FnOnce(&mut SpiBusState<Self::Bus>) -> R;
}

impl<BUS> SharedBus for RefCell<SpiBusState<BUS>>
where
    BUS: SpiBus,
{
    type Bus = BUS;

    fn with_bus<R, F>(&self, func: F) -> R
    where
        F: FnOnce(&mut SpiBusState<BUS>) -> R,
    {
        func(&mut *self.borrow_mut())
    }
}

#[cfg(feature = "embassy-sync-06")]
mod embassy_sync_06 {
    use core::cell::RefCell;

    use ::embassy_sync_06::blocking_mutex;

    use super::*;

    /// Share the bus according to the `embassy-sync` mutex model.
    /// See [`blocking_mutex::Mutex`] for more details.
    impl<BUS, M> SharedBus for blocking_mutex::Mutex<M, RefCell<SpiBusState<BUS>>>
    where
        BUS: SpiBus,
        M: blocking_mutex::raw::RawMutex,
    {
        type Bus = BUS;

        fn with_bus<R, F>(&self, func: F) -> R
        where
            F: FnOnce(&mut SpiBusState<BUS>) -> R,
        {
            self.lock(|state| func(&mut *state.borrow_mut()))
        }
    }
}

/// One consumer's view of a shared SPI bus, with the chip select line of its
/// device.
///
/// `N` is the longest transfer that will be accepted.
pub struct SpiArbiter<'a, S, CS, const N: usize = DEFAULT_TRANSFER_LEN> {
    shared: &'a S,
    cs: CS,
    id: u8,
    next_token: u32,
    done: Option<(MessageToken, Result<heapless::Vec<u8, N>, BusFault>)>,
}

impl<'a, S, CS, const N: usize> SpiArbiter<'a, S, CS, N>
where
    S: SharedBus,
    CS: OutputPin,
{
    /// Create an arbiter for consumer `id`. Every consumer of the same bus
    /// needs a different `id`.
    pub fn new(shared: &'a S, cs: CS, id: u8) -> SpiArbiter<'a, S, CS, N> {
        SpiArbiter {
            shared,
            cs,
            id,
            next_token: 1,
            done: None,
        }
    }

    /// Do we own the bus right now, through this grant?
    fn owns(&self, grant: &BusGrant) -> bool {
        grant.owner() == self.id && self.shared.with_bus(|state| state.owner == Some(self.id))
    }

    fn mint_token(&mut self) -> MessageToken {
        loop {
            let value = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if let Some(token) = MessageToken::new(value) {
                return token;
            }
        }
    }

    /// Clock `buffer` out, replacing it with what comes back.
    fn submit(
        &mut self,
        grant: &BusGrant,
        mut buffer: heapless::Vec<u8, N>,
    ) -> Result<MessageToken, Rejected> {
        if !self.owns(grant) {
            warn!("Transfer from {} without owning the bus", self.id);
            return Err(Rejected);
        }
        let result = self.shared.with_bus(|state| {
            let xfer_res = state.bus.transfer_in_place(&mut buffer);
            // On failure, it's important to still flush.
            let flush_res = state.bus.flush();
            xfer_res.and(flush_res).map_err(|_| BusFault::Spi)
        });
        let token = self.mint_token();
        trace!("Transfer {} of {} bytes", token.get(), buffer.len());
        self.done = Some((token, result.map(|()| buffer)));
        Ok(token)
    }

    /// Get the chip select pin back.
    pub fn free(self) -> CS {
        self.cs
    }
}

impl<S, CS, const N: usize> BusArbiter for SpiArbiter<'_, S, CS, N>
where
    S: SharedBus,
    CS: OutputPin,
{
    fn request(&mut self) -> Option<BusGrant> {
        let id = self.id;
        self.shared.with_bus(|state| match state.owner {
            None => {
                state.owner = Some(id);
                Some(BusGrant::new(id))
            }
            Some(_) => None,
        })
    }

    fn release(&mut self, grant: BusGrant) {
        if grant.owner() != self.id {
            warn!("Release of a grant that is not ours");
            return;
        }
        let id = self.id;
        self.shared.with_bus(|state| {
            if state.owner == Some(id) {
                state.owner = None;
            }
        });
        self.done = None;
    }

    fn assert_select(&mut self, grant: &BusGrant) {
        if self.owns(grant) && self.cs.set_low().is_err() {
            warn!("Failed to assert chip select");
        }
    }

    /// Raise chip select, then clock one more byte so the card lets go of
    /// MISO before anyone else uses the bus.
    fn deassert_select(&mut self, grant: &BusGrant) {
        if !self.owns(grant) {
            return;
        }
        if self.cs.set_high().is_err() {
            warn!("Failed to deassert chip select");
        }
        let spi_res = self.shared.with_bus(|state| {
            let dummy_res = state.bus.write(&[IDLE_BYTE]);
            let flush_res = state.bus.flush();
            dummy_res.and(flush_res)
        });
        if spi_res.is_err() {
            warn!("Failed to clock trailing byte");
        }
    }

    fn read_bytes(&mut self, grant: &BusGrant, len: usize) -> Result<MessageToken, Rejected> {
        let mut buffer = heapless::Vec::new();
        buffer.resize(len, IDLE_BYTE).map_err(|_| Rejected)?;
        self.submit(grant, buffer)
    }

    fn write_bytes(&mut self, grant: &BusGrant, bytes: &[u8]) -> Result<MessageToken, Rejected> {
        let buffer = heapless::Vec::from_slice(bytes).map_err(|_| Rejected)?;
        self.submit(grant, buffer)
    }

    fn poll<const M: usize>(&mut self, token: MessageToken, rx: &mut RxBuffer<M>) -> TransferStatus {
        match self.done.take() {
            Some((done_token, Ok(buffer))) if done_token == token => {
                rx.extend_from_slice(&buffer);
                TransferStatus::Complete
            }
            Some((done_token, Err(fault))) if done_token == token => TransferStatus::Failed(fault),
            other => {
                self.done = other;
                TransferStatus::Failed(BusFault::UnknownToken)
            }
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
