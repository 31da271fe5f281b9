//! Synchronous transfer negotiation and the extended message codec

use arrayvec::ArrayVec;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::scsi::MAX_SYNC_OFFSET;
use crate::scsi::timing::{PlatformTimings, SpeedGrade};

/// Slowest period (units of 4 ns) accepted for synchronous transfers
pub const MAX_SYNC_PERIOD: u8 = 80;

/// Message byte introducing an extended message
pub const EXTENDED_MESSAGE: u8 = 0x01;

/// Synchronous transfer agreement with one initiator.
/// An offset of zero means asynchronous transfers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAgreement {
    /// Transfer period, units of 4 ns
    pub period: u8,
    /// Max. REQ pulses outstanding
    pub offset: u8,
}

impl SyncAgreement {
    pub const ASYNC: Self = Self {
        period: 0,
        offset: 0,
    };

    pub const fn is_sync(&self) -> bool {
        self.offset > 0
    }

    /// Rate estimate in kB/s, half the theoretical figure as hosts rarely
    /// keep up with it
    pub const fn rate_kbs(&self) -> u32 {
        if !self.is_sync() || self.period == 0 {
            0
        } else if self.period < 23 {
            20_000 / 2
        } else if self.period <= 25 {
            10_000 / 2
        } else {
            (1_000_000 / (self.period as u32 * 4)) / 2
        }
    }
}

/// Decides the agreement for the period/offset an initiator proposes
#[derive(Clone, Debug)]
pub struct Negotiator {
    max_speed: SpeedGrade,
    preset: Option<PlatformTimings>,
    forced: Option<SyncAgreement>,
}

impl Negotiator {
    pub fn new(max_speed: SpeedGrade, preset: Option<PlatformTimings>) -> Self {
        Self {
            max_speed,
            preset,
            forced: None,
        }
    }

    /// Answers every proposal with `agreement` instead (async hosts that
    /// never negotiate, or debugging)
    pub fn with_forced(self, forced: Option<SyncAgreement>) -> Self {
        Self { forced, ..self }
    }

    /// Fastest period allowed under the speed ceiling. The platform preset
    /// may raise the floor if the hardware cannot reach the nominal rate.
    pub fn min_period(&self) -> Option<u8> {
        let nominal = self.max_speed.min_period()?;
        let measured = self
            .preset
            .as_ref()
            .and_then(|p| p.grade(self.max_speed))
            .map_or(0, |g| g.max_sync);
        Some(nominal.max(measured))
    }

    /// Computes the agreement. Never fails, infeasible proposals are
    /// answered slower or asynchronous.
    pub fn negotiate(&self, period: u8, offset: u8) -> SyncAgreement {
        if let Some(forced) = self.forced {
            return forced;
        }
        let Some(floor) = self.min_period() else {
            return SyncAgreement::ASYNC;
        };
        if period == 0 || offset == 0 || period > MAX_SYNC_PERIOD {
            return SyncAgreement::ASYNC;
        }

        SyncAgreement {
            period: period.max(floor),
            offset: offset.min(MAX_SYNC_OFFSET),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
enum ExtendedMessageCode {
    ModifyDataPointer = 0x00,
    SynchronousDataTransfer = 0x01,
    WideDataTransfer = 0x03,
}

/// Extended messages relevant to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedMessage {
    /// SDTR
    Sync(SyncAgreement),
    /// WDTR, bus width is 8 << exponent bits
    Wide { exponent: u8 },
    /// Recognized but not supported, to be answered with MESSAGE REJECT
    Unsupported(u8),
}

impl ExtendedMessage {
    /// Parses the bytes following the extended message byte
    /// (length, code, arguments).
    pub fn parse(body: &[u8]) -> Option<Self> {
        let (&len, rest) = body.split_first()?;
        let rest = rest.get(..usize::from(len))?;
        let (&code, args) = rest.split_first()?;

        match ExtendedMessageCode::from_u8(code) {
            Some(ExtendedMessageCode::SynchronousDataTransfer) => {
                let [period, offset]: [u8; 2] = args.try_into().ok()?;
                Some(Self::Sync(SyncAgreement { period, offset }))
            }
            Some(ExtendedMessageCode::WideDataTransfer) => {
                let [exponent]: [u8; 1] = args.try_into().ok()?;
                Some(Self::Wide { exponent })
            }
            Some(ExtendedMessageCode::ModifyDataPointer) | None => Some(Self::Unsupported(code)),
        }
    }

    /// Builds the complete message including the extended message byte
    pub fn encode(&self) -> ArrayVec<u8, 5> {
        let mut out = ArrayVec::new();
        out.push(EXTENDED_MESSAGE);
        match *self {
            Self::Sync(agreement) => {
                out.push(3);
                out.push(Self::code(ExtendedMessageCode::SynchronousDataTransfer));
                out.push(agreement.period);
                out.push(agreement.offset);
            }
            Self::Wide { exponent } => {
                out.push(2);
                out.push(Self::code(ExtendedMessageCode::WideDataTransfer));
                out.push(exponent);
            }
            Self::Unsupported(code) => {
                out.push(1);
                out.push(code);
            }
        }
        out
    }

    fn code(code: ExtendedMessageCode) -> u8 {
        code.to_u8().unwrap_or_default()
    }
}
