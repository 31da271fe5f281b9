//! Pin-level capability interface to the SCSI bus

#[cfg(any(test, feature = "simbus"))]
pub mod simbus;

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::scsi::timing::ns_to_cycles;
use crate::tickable::Ticks;
use crate::types::DataBus;

/// SCSI bus control signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::EnumIter)]
pub enum Signal {
    Bsy,
    Sel,
    Msg,
    Cd,
    Io,
    Req,
    Ack,
    Rst,
    Atn,
}

bitfield! {
    /// Image of the SCSI control lines, set = asserted
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ControlLines(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        /// MSG, C/D, I/O as a phase code
        pub phase_code: u8 @ 0..=2,

        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub req: bool @ 3,
        pub ack: bool @ 4,
        pub bsy: bool @ 5,
        pub sel: bool @ 6,
        pub atn: bool @ 7,
        pub rst: bool @ 8,
    }
}

impl ControlLines {
    pub fn signal(&self, signal: Signal) -> bool {
        match signal {
            Signal::Bsy => self.bsy(),
            Signal::Sel => self.sel(),
            Signal::Msg => self.msg(),
            Signal::Cd => self.cd(),
            Signal::Io => self.io(),
            Signal::Req => self.req(),
            Signal::Ack => self.ack(),
            Signal::Rst => self.rst(),
            Signal::Atn => self.atn(),
        }
    }

    pub fn set_signal(&mut self, signal: Signal, asserted: bool) {
        match signal {
            Signal::Bsy => self.set_bsy(asserted),
            Signal::Sel => self.set_sel(asserted),
            Signal::Msg => self.set_msg(asserted),
            Signal::Cd => self.set_cd(asserted),
            Signal::Io => self.set_io(asserted),
            Signal::Req => self.set_req(asserted),
            Signal::Ack => self.set_ack(asserted),
            Signal::Rst => self.set_rst(asserted),
            Signal::Atn => self.set_atn(asserted),
        }
    }
}

/// Access to the SCSI bus pins and the controller cycle counter.
///
/// Signals are in software polarity: `true` means asserted, regardless of the
/// active-low level on the wire. A platform implements this on top of its
/// GPIO block; [`simbus::SimBus`] implements it for testing.
pub trait ScsiPhy {
    /// Controller clock frequency all cycle counts refer to
    fn clk_hz(&self) -> u32;

    /// Free-running controller cycle counter
    fn cycles(&self) -> Ticks;

    /// Busy-waits for the given amount of controller cycles
    fn delay_cycles(&mut self, cycles: u32);

    fn assert(&mut self, signal: Signal);
    fn deassert(&mut self, signal: Signal);

    /// Samples a signal as seen on the bus (wired-OR of all drivers)
    fn read(&mut self, signal: Signal) -> bool;

    /// Drives MSG, C/D and I/O in one store from a 3-bit phase code, so no
    /// intermediate combination is ever visible on the bus.
    fn drive_phase(&mut self, code: u8);

    /// Enables the data bus drivers and outputs `bus`
    fn drive_data(&mut self, bus: DataBus);

    /// Samples the data bus including parity
    fn read_data(&mut self) -> DataBus;

    /// Releases the data bus and REQ
    fn release_data_req(&mut self);

    /// Releases every output this device drives
    fn release_all(&mut self);

    /// Number of ACK assertion edges counted since the last call.
    /// Synchronous ACK pulses can be shorter than a polling loop, so the
    /// platform counts them in hardware.
    fn take_ack_edges(&mut self) -> u32;

    /// Pops a data bus sample latched on an ACK edge (synchronous reads)
    fn take_latched(&mut self) -> Option<DataBus>;

    fn delay_ns(&mut self, ns: u32) {
        let cycles = ns_to_cycles(ns, self.clk_hz());
        self.delay_cycles(cycles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn control_lines_signal_roundtrip() {
        for s in Signal::iter() {
            let mut lines = ControlLines(0);
            lines.set_signal(s, true);
            assert!(lines.signal(s), "{}", <&str>::from(s));
            assert_eq!(lines.0.count_ones(), 1);
            lines.set_signal(s, false);
            assert_eq!(lines.0, 0);
        }
    }

    #[test]
    fn control_lines_phase_code() {
        let mut lines = ControlLines(0);
        lines.set_msg(true);
        lines.set_cd(true);
        assert_eq!(lines.phase_code(), 0b110);
        lines.set_phase_code(0b001);
        assert!(lines.io() && !lines.cd() && !lines.msg());
    }
}
