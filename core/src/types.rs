use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

bitfield! {
    /// Image of the 9-bit SCSI data bus (DB0-DB7 + DBP).
    /// Bits are in software polarity, set = asserted.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DataBus(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        pub data: u8 @ 0..=7,
        pub parity: bool @ 8,
    }
}

/// A sticky latch for hardware conditions reported after the fact,
/// e.g. parity errors during a transfer session.
#[derive(Debug, Default)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }
}
