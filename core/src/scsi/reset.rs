//! Bus reset signalling and cooperative cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::phy::{ScsiPhy, Signal};
use crate::tickable::Ticks;

/// RST has to be seen asserted on two samples this far apart
pub const RST_GLITCH_FILTER_NS: u32 = 500;

/// Bus reset flag, shared between the RST interrupt context and every
/// blocking operation on the bus. Clones refer to the same flag.
#[derive(Clone, Debug, Default)]
pub struct ResetFlag(Arc<AtomicBool>);

impl ResetFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Safe to call from any thread or interrupt context.
    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cancellation context for blocking loops: the reset flag and an optional
/// cycle deadline.
#[derive(Debug)]
pub struct CancelToken<'a> {
    reset: &'a ResetFlag,
    deadline: Option<Ticks>,
}

impl<'a> CancelToken<'a> {
    pub fn new(reset: &'a ResetFlag) -> Self {
        Self {
            reset,
            deadline: None,
        }
    }

    pub fn with_deadline(self, deadline: Option<Ticks>) -> Self {
        Self { deadline, ..self }
    }

    pub fn timed_out(&self, now: Ticks) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    #[inline(always)]
    pub fn is_cancelled(&self, now: Ticks) -> bool {
        self.reset.is_set() || self.timed_out(now)
    }
}

/// RST edge handler. Samples RST twice to filter out glitches and raises
/// the reset flag on a genuine bus reset.
pub fn rst_edge<P: ScsiPhy>(phy: &mut P, flag: &ResetFlag) -> bool {
    let first = phy.read(Signal::Rst);
    phy.delay_ns(RST_GLITCH_FILTER_NS);
    let second = phy.read(Signal::Rst);

    if first && second {
        log::debug!("BUS RESET");
        flag.signal();
        true
    } else {
        false
    }
}
