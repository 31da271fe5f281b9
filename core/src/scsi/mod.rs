//! SCSI bus phase engine, transfer acceleration, timing and negotiation

pub mod accel;
pub mod negotiation;
pub mod parity;
pub mod phase;
pub mod reset;
pub mod timing;

use serde::{Deserialize, Serialize};

use crate::phy::{ScsiPhy, Signal};
use reset::CancelToken;

/// Number of SCSI IDs on a narrow bus
pub const MAX_TARGETS: usize = 8;

/// Highest synchronous offset this device agrees to
pub const MAX_SYNC_OFFSET: u8 = 15;

/// SCSI bus phases
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::IntoStaticStr,
    strum::Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
pub enum BusPhase {
    #[default]
    Free,
    Busy,
    Arbitration,
    Selection,
    Reselection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MessageIn,
    MessageOut,
}

impl BusPhase {
    const IO: u8 = 0b001;
    const CD: u8 = 0b010;
    const MSG: u8 = 0b100;

    /// MSG/C-D/I-O code of an information transfer phase.
    /// The other phases drive none of these lines.
    pub const fn code(self) -> Option<u8> {
        match self {
            Self::DataOut => Some(0),
            Self::DataIn => Some(Self::IO),
            Self::Command => Some(Self::CD),
            Self::Status => Some(Self::CD | Self::IO),
            Self::MessageOut => Some(Self::MSG | Self::CD),
            Self::MessageIn => Some(Self::MSG | Self::CD | Self::IO),
            _ => None,
        }
    }

    /// Decodes MSG/C-D/I-O. The two reserved combinations yield `None`.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code & 0b111 {
            0 => Some(Self::DataOut),
            Self::IO => Some(Self::DataIn),
            Self::CD => Some(Self::Command),
            0b011 => Some(Self::Status),
            0b110 => Some(Self::MessageOut),
            0b111 => Some(Self::MessageIn),
            _ => None,
        }
    }

    pub const fn is_data(self) -> bool {
        matches!(self, Self::DataIn | Self::DataOut)
    }

    /// I/O asserted, target drives the data bus
    pub const fn is_input(self) -> bool {
        matches!(
            self,
            Self::Reselection | Self::DataIn | Self::Status | Self::MessageIn
        )
    }
}

/// Direction of a data transfer, seen from the target
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Target -> Initiator (DATA IN)
    Write,
    /// Initiator -> Target (DATA OUT)
    Read,
}

/// Polls `signal` until it reads `asserted`. A reading has to persist for
/// `glitch` cycles to count. Returns false if cancelled first.
pub(crate) fn wait_signal<P: ScsiPhy>(
    phy: &mut P,
    signal: Signal,
    asserted: bool,
    glitch: u32,
    cancel: &CancelToken,
) -> bool {
    loop {
        if phy.read(signal) == asserted {
            if glitch == 0 {
                return true;
            }
            phy.delay_cycles(glitch);
            if phy.read(signal) == asserted {
                return true;
            }
        }
        if cancel.is_cancelled(phy.cycles()) {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn phase_codes_unique() {
        let codes = BusPhase::iter().filter_map(|p| p.code()).collect::<Vec<_>>();
        assert_eq!(codes.len(), 6);
        for (i, a) in codes.iter().enumerate() {
            assert!(codes[i + 1..].iter().all(|b| a != b));
        }
    }

    #[test]
    fn phase_code_decode() {
        for p in BusPhase::iter() {
            if let Some(code) = p.code() {
                assert_eq!(BusPhase::from_code(code), Some(p));
                assert_eq!(code & BusPhase::IO != 0, p.is_input());
            }
        }
        assert_eq!(BusPhase::from_code(0b100), None);
        assert_eq!(BusPhase::from_code(0b101), None);
    }
}
