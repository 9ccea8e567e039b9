//! Time keeping for non-blocking waits.
//!
//! The driver never sleeps. Instead it captures the current value of a
//! free-running millisecond counter when a wait begins and, on every later
//! tick, asks whether the configured duration has elapsed since then.

use fugit::MillisDurationU32;

/// Something that can tell us the current time.
///
/// Implement this for the system tick counter of your board. The counter
/// must be monotonic and count in milliseconds; it is allowed to wrap around
/// at `u32::MAX`.
pub trait TimeSource {
    /// Returns the current value of the millisecond counter.
    fn now_ms(&self) -> u32;
}

impl<T> TimeSource for &T
where
    T: TimeSource + ?Sized,
{
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// A reference time plus a timeout.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Deadline {
    started_ms: u32,
    timeout_ms: u32,
}

impl Deadline {
    /// Start a new deadline at `now_ms` which expires `timeout` later.
    pub const fn start(now_ms: u32, timeout: MillisDurationU32) -> Deadline {
        Deadline {
            started_ms: now_ms,
            timeout_ms: timeout.ticks(),
        }
    }

    /// Has the timeout elapsed at `now_ms`?
    ///
    /// Uses wrapping arithmetic, so a counter roll-over between the start
    /// and `now_ms` is handled correctly as long as the real elapsed time
    /// fits in a `u32`.
    pub const fn is_up(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.started_ms) >= self.timeout_ms
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
