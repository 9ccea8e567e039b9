//! Status light requests.
//!
//! Boards usually have a handful of LEDs that several tasks want to use. The
//! LED driver arbitrates between them; a task only says which pattern it
//! would like, and who it is.

/// The pattern a status light should show.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedMode {
    /// Light is off
    Off,
    /// Light is on solid
    On,
    /// Slow blink (1 Hz), e.g. "working on it"
    Blink1Hz,
    /// Fast blink (8 Hz), e.g. "something went wrong"
    Blink8Hz,
}

/// Identifies the task making an indicator request.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequesterId(pub u8);

/// Something that can show a pattern on a status light on behalf of a task.
pub trait Indicator {
    /// Ask for `mode` to be shown, on behalf of `requester`.
    fn request(&mut self, requester: RequesterId, mode: LedMode);
}

/// Boards without a status light can pass `()`.
impl Indicator for () {
    fn request(&mut self, _requester: RequesterId, _mode: LedMode) {}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
