//! Handshake timing tables and clock conversion
//!
//! The constant tables are expressed in cycles of a 108 MHz reference clock
//! and rescaled to the actual controller clock. Sync timings on PIO-class
//! controllers come from per-clock presets instead, as the hardware rise and
//! fall times have been measured per clock.

use serde::{Deserialize, Serialize};

use crate::scsi::TransferDirection;
use crate::scsi::negotiation::SyncAgreement;

/// Clock the constant tables are expressed in
pub const REFERENCE_CLK_HZ: u32 = 108_000_000;

/// Fixed handshake overhead of the reference hardware, in reference cycles
const HW_OVERHEAD: u32 = 2;

const FAST5_DESKEW: u32 = 6;
const FAST5_HOLD: u32 = 6;
const FAST10_DESKEW: u32 = 2;
const FAST10_HOLD: u32 = 3;
const FAST10_WRITE_ASSERT: u32 = 3;
const FAST10_READ_ASSERT: u32 = 5;
const FAST20_DESKEW: u32 = 1;
const FAST20_HOLD: u32 = 2;
const FAST20_ASSERT: u32 = 2;

/// SCSI bus speed grades
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::EnumString,
    strum::Display,
    strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum SpeedGrade {
    /// Asynchronous, 1.5 MB/s
    #[strum(serialize = "async_15")]
    #[serde(rename = "async_15")]
    Async15,
    /// Asynchronous, 3.3 MB/s
    #[strum(serialize = "async_33")]
    #[serde(rename = "async_33")]
    Async33,
    /// Asynchronous, 5 MB/s
    #[default]
    #[strum(serialize = "async_50")]
    #[serde(rename = "async_50")]
    Async50,
    /// Synchronous 5 MB/s (SCSI-2)
    #[strum(serialize = "sync_5")]
    #[serde(rename = "sync_5")]
    Sync5,
    /// Synchronous 10 MB/s (Fast-10)
    #[strum(serialize = "sync_10")]
    #[serde(rename = "sync_10")]
    Sync10,
    /// Synchronous 20 MB/s (Fast-20)
    #[strum(serialize = "sync_20")]
    #[serde(rename = "sync_20")]
    Sync20,
}

impl SpeedGrade {
    pub const fn is_sync(self) -> bool {
        matches!(self, Self::Sync5 | Self::Sync10 | Self::Sync20)
    }

    /// Fastest transfer period (units of 4 ns) of a sync grade
    pub const fn min_period(self) -> Option<u8> {
        match self {
            Self::Sync20 => Some(12),
            Self::Sync10 => Some(25),
            Self::Sync5 => Some(50),
            _ => None,
        }
    }

    /// Sync grade a negotiated period falls into
    pub const fn for_period(period: u8) -> Self {
        if period < 25 {
            Self::Sync20
        } else if period < 50 {
            Self::Sync10
        } else {
            Self::Sync5
        }
    }

    /// Nominal transfer rate in kB/s
    pub const fn nominal_kbs(self) -> u32 {
        match self {
            Self::Async15 => 1500,
            Self::Async33 => 3300,
            Self::Async50 | Self::Sync5 => 5000,
            Self::Sync10 => 10000,
            Self::Sync20 => 20000,
        }
    }
}

/// Handshake timing for one speed grade, in controller cycles
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingProfile {
    /// Data valid to REQ assertion, and REQ pulse width in sync mode
    pub assert: u32,
    /// Settle time observed before sampling the bus
    pub deskew: u32,
    /// Minimum time a signal is held after the other side reacted
    pub hold: u32,
    /// Time a received edge must persist to count
    pub glitch: u32,
}

/// Async rows at the reference clock: 1.5 MB/s, 3.3 MB/s, 5 MB/s
const ASYNC_TIMINGS: [TimingProfile; 3] = [
    TimingProfile {
        assert: 28,
        deskew: 18,
        hold: 7,
        glitch: 15,
    },
    TimingProfile {
        assert: 13,
        deskew: 6,
        hold: 6,
        glitch: 13,
    },
    TimingProfile {
        assert: 9,
        deskew: 6,
        hold: 6,
        glitch: 6,
    },
];

impl TimingProfile {
    /// Async handshake timing at the reference clock. Sync grades used
    /// asynchronously get the fastest async row.
    pub const fn asynchronous(grade: SpeedGrade) -> Self {
        match grade {
            SpeedGrade::Async15 => ASYNC_TIMINGS[0],
            SpeedGrade::Async33 => ASYNC_TIMINGS[1],
            _ => ASYNC_TIMINGS[2],
        }
    }

    /// Sync handshake timing at the reference clock for a negotiated period
    pub fn synchronous(period: u8, direction: TransferDirection) -> Self {
        let glitch = if period < 35 {
            1
        } else if period < 45 {
            2
        } else {
            5
        };

        if period < 23 {
            Self {
                assert: FAST20_ASSERT,
                deskew: FAST20_DESKEW,
                hold: FAST20_HOLD,
                glitch,
            }
        } else if period <= 25 {
            Self {
                assert: match direction {
                    TransferDirection::Write => FAST10_WRITE_ASSERT,
                    TransferDirection::Read => FAST10_READ_ASSERT,
                },
                deskew: FAST10_DESKEW,
                hold: FAST10_HOLD,
                glitch,
            }
        } else {
            let deskew = if period < 35 { 2 } else { FAST5_DESKEW };
            let hold = if period < 35 { 4 } else { FAST5_HOLD };
            let assert = match direction {
                TransferDirection::Write => {
                    sync_assertion(period, deskew, REFERENCE_CLK_HZ)
                }
                TransferDirection::Read => sync_assertion(period, 0, REFERENCE_CLK_HZ),
            };
            Self {
                assert,
                deskew,
                hold,
                glitch,
            }
        }
    }

    /// Converts reference clock cycles to `clk_hz` cycles, rounding up
    pub fn rescale(self, clk_hz: u32) -> Self {
        let scale = |c: u32| {
            ((u64::from(c) * u64::from(clk_hz)).div_ceil(u64::from(REFERENCE_CLK_HZ))) as u32
        };
        Self {
            assert: scale(self.assert),
            deskew: scale(self.deskew),
            hold: scale(self.hold),
            glitch: scale(self.glitch),
        }
    }
}

/// Nanoseconds to controller cycles, rounding up
pub const fn ns_to_cycles(ns: u32, clk_hz: u32) -> u32 {
    ((ns as u64 * clk_hz as u64).div_ceil(1_000_000_000)) as u32
}

/// Length of a transfer period (units of 4 ns) in controller cycles, rounded
pub const fn period_clks(period: u8, clk_hz: u32) -> u32 {
    ((period as u64 * 4 * clk_hz as u64 + 500_000_000) / 1_000_000_000) as u32
}

/// REQ assertion length for a sync period. The rest of the period goes to
/// deskew, the hardware overhead and the negation half.
pub const fn sync_assertion(period: u8, deskew: u32, clk_hz: u32) -> u32 {
    (period_clks(period, clk_hz)
        .saturating_sub(deskew)
        .saturating_sub(HW_OVERHEAD)
        + 1)
        / 2
}

/// PIO delays for one sync grade, in controller cycles on top of the one
/// cycle each instruction takes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncGradeTiming {
    /// Data setup before REQ
    pub delay0: u8,
    /// REQ pulse width
    pub delay1: u8,
    /// Added to the rounded period length
    pub total_delay_adjust: i8,
    /// Fastest period (units of 4 ns) this grade is allowed to run at
    pub max_sync: u8,
}

/// Timing preset for one controller clock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTimings {
    pub clk_hz: u32,
    /// REQ to data delay for async transfers
    pub req_delay: u8,
    pub clk_period_ps: u32,
    pub scsi_20: SyncGradeTiming,
    pub scsi_10: SyncGradeTiming,
    pub scsi_5: SyncGradeTiming,
}

/// Measured presets for the supported controller clocks
pub const PLATFORM_PRESETS: [PlatformTimings; 5] = [
    PlatformTimings {
        clk_hz: 125_000_000,
        req_delay: 7,
        clk_period_ps: 8000,
        scsi_20: SyncGradeTiming {
            delay0: 4,
            delay1: 6,
            total_delay_adjust: -1,
            max_sync: 25,
        },
        scsi_10: SyncGradeTiming {
            delay0: 4,
            delay1: 6,
            total_delay_adjust: -1,
            max_sync: 25,
        },
        scsi_5: SyncGradeTiming {
            delay0: 9,
            delay1: 14,
            total_delay_adjust: -1,
            max_sync: 50,
        },
    },
    PlatformTimings {
        clk_hz: 133_000_000,
        req_delay: 7,
        clk_period_ps: 7519,
        scsi_20: SyncGradeTiming {
            delay0: 4,
            delay1: 6,
            total_delay_adjust: -1,
            max_sync: 25,
        },
        scsi_10: SyncGradeTiming {
            delay0: 4,
            delay1: 6,
            total_delay_adjust: -1,
            max_sync: 25,
        },
        scsi_5: SyncGradeTiming {
            delay0: 9,
            delay1: 14,
            total_delay_adjust: -1,
            max_sync: 50,
        },
    },
    PlatformTimings {
        clk_hz: 135_428_571,
        req_delay: 7,
        clk_period_ps: 7384,
        scsi_20: SyncGradeTiming {
            delay0: 4,
            delay1: 6,
            total_delay_adjust: -1,
            max_sync: 25,
        },
        scsi_10: SyncGradeTiming {
            delay0: 4,
            delay1: 6,
            total_delay_adjust: -1,
            max_sync: 25,
        },
        scsi_5: SyncGradeTiming {
            delay0: 9,
            delay1: 14,
            total_delay_adjust: -1,
            max_sync: 50,
        },
    },
    PlatformTimings {
        clk_hz: 150_000_000,
        req_delay: 9,
        clk_period_ps: 6667,
        scsi_20: SyncGradeTiming {
            delay0: 2,
            delay1: 3,
            total_delay_adjust: 0,
            max_sync: 18,
        },
        scsi_10: SyncGradeTiming {
            delay0: 3,
            delay1: 4,
            total_delay_adjust: 0,
            max_sync: 25,
        },
        scsi_5: SyncGradeTiming {
            // delay1 is capped by the 4-bit PIO delay field
            delay0: 9,
            delay1: 15,
            total_delay_adjust: 0,
            max_sync: 50,
        },
    },
    PlatformTimings {
        clk_hz: 250_000_000,
        req_delay: 14,
        clk_period_ps: 4000,
        scsi_20: SyncGradeTiming {
            delay0: 2,
            delay1: 4,
            total_delay_adjust: 1,
            max_sync: 12,
        },
        scsi_10: SyncGradeTiming {
            delay0: 5,
            delay1: 8,
            total_delay_adjust: 1,
            max_sync: 25,
        },
        scsi_5: SyncGradeTiming {
            delay0: 15,
            delay1: 15,
            total_delay_adjust: 1,
            max_sync: 50,
        },
    },
];

/// Maximum of the 4-bit PIO instruction delay field
const PIO_MAX_DELAY: i32 = 15;

impl PlatformTimings {
    /// Preset for a controller clock, matched to the kHz
    pub fn for_clock(clk_hz: u32) -> Option<Self> {
        PLATFORM_PRESETS
            .iter()
            .find(|p| p.clk_hz / 1000 == clk_hz / 1000)
            .copied()
    }

    pub fn grade(&self, grade: SpeedGrade) -> Option<&SyncGradeTiming> {
        match grade {
            SpeedGrade::Sync20 => Some(&self.scsi_20),
            SpeedGrade::Sync10 => Some(&self.scsi_10),
            SpeedGrade::Sync5 => Some(&self.scsi_5),
            _ => None,
        }
    }

    pub fn grade_mut(&mut self, grade: SpeedGrade) -> Option<&mut SyncGradeTiming> {
        match grade {
            SpeedGrade::Sync20 => Some(&mut self.scsi_20),
            SpeedGrade::Sync10 => Some(&mut self.scsi_10),
            SpeedGrade::Sync5 => Some(&mut self.scsi_5),
            _ => None,
        }
    }

    /// Length of a transfer period in cycles, rounded up.
    /// None if the clock period is zero.
    pub fn period_cycles(&self, period: u8) -> Option<i32> {
        let ps = u32::from(period) * 4 * 1000;
        (ps + self.clk_period_ps / 2 + 1)
            .checked_div(self.clk_period_ps)
            .map(|c| c as i32)
    }

    /// PIO delays (setup, pulse, negation) for sync writes at `period`
    pub fn sync_write_delays(&self, period: u8) -> Option<(u8, u8, u8)> {
        let grade = SpeedGrade::for_period(period);
        let g = match grade {
            SpeedGrade::Sync20 => &self.scsi_20,
            SpeedGrade::Sync10 => &self.scsi_10,
            _ => &self.scsi_5,
        };
        let total = self.period_cycles(period)? + i32::from(g.total_delay_adjust);
        // Slow SCSI needs the negation period well above 90 ns
        let floor = if grade == SpeedGrade::Sync5 { 2 } else { 0 };
        let delay2 = (total - i32::from(g.delay0) - i32::from(g.delay1) - 3)
            .clamp(floor, PIO_MAX_DELAY);
        Some((g.delay0, g.delay1, delay2 as u8))
    }

    /// Sync handshake timing derived from the PIO delays. Each delay gains
    /// the instruction cycle.
    pub fn sync_profile(&self, period: u8) -> Option<TimingProfile> {
        let (delay0, delay1, delay2) = self.sync_write_delays(period)?;
        Some(TimingProfile {
            assert: u32::from(delay1) + 1,
            deskew: u32::from(delay0) + 1,
            hold: u32::from(delay2) + 1,
            glitch: 1,
        })
    }
}

/// Timing inputs of a bus instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingConfig {
    pub clk_hz: u32,
    /// Async row used when no sync agreement is active
    pub async_grade: SpeedGrade,
    pub preset: Option<PlatformTimings>,
}

impl TimingConfig {
    /// Selects the handshake timing for a transfer under `agreement`
    pub fn profile(&self, agreement: SyncAgreement, direction: TransferDirection) -> TimingProfile {
        if !agreement.is_sync() {
            let mut profile = TimingProfile::asynchronous(self.async_grade).rescale(self.clk_hz);
            if let Some(preset) = &self.preset {
                profile.assert = profile.assert.max(u32::from(preset.req_delay));
            }
            profile
        } else if let Some(profile) = self
            .preset
            .as_ref()
            .and_then(|p| p.sync_profile(agreement.period))
        {
            profile
        } else {
            TimingProfile::synchronous(agreement.period, direction).rescale(self.clk_hz)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn grade_parse() {
        assert_eq!(SpeedGrade::from_str("sync_10").unwrap(), SpeedGrade::Sync10);
        assert_eq!(SpeedGrade::from_str("SYNC_20").unwrap(), SpeedGrade::Sync20);
        assert_eq!(SpeedGrade::from_str("Async_33").unwrap(), SpeedGrade::Async33);
        assert!(SpeedGrade::from_str("sync_40").is_err());
        for g in SpeedGrade::iter() {
            assert_eq!(SpeedGrade::from_str(&g.to_string()).unwrap(), g);
        }
    }

    #[test]
    fn grade_ordering() {
        let grades = SpeedGrade::iter().collect::<Vec<_>>();
        assert!(grades.windows(2).all(|w| w[0] < w[1]));
        assert!(grades.windows(2).all(|w| w[0].nominal_kbs() <= w[1].nominal_kbs()));
        assert!(!SpeedGrade::Async50.is_sync());
        assert!(SpeedGrade::Sync5.is_sync());
    }

    #[test]
    fn ns_conversion() {
        assert_eq!(ns_to_cycles(0, 150_000_000), 0);
        assert_eq!(ns_to_cycles(1000, 150_000_000), 150);
        // 400 ns at 108 MHz = 43.2 cycles
        assert_eq!(ns_to_cycles(400, REFERENCE_CLK_HZ), 44);
        assert_eq!(ns_to_cycles(100_000, 250_000_000), 25_000);
    }

    #[test]
    fn period_clks_reference() {
        assert_eq!(period_clks(12, REFERENCE_CLK_HZ), 5);
        assert_eq!(period_clks(25, REFERENCE_CLK_HZ), 11);
        assert_eq!(period_clks(50, REFERENCE_CLK_HZ), 22);
        assert_eq!(period_clks(80, REFERENCE_CLK_HZ), 35);
        assert_eq!(period_clks(25, 250_000_000), 25);
    }

    #[test]
    fn sync_profile_reference() {
        let p = TimingProfile::synchronous(12, TransferDirection::Write);
        assert_eq!((p.assert, p.deskew, p.hold, p.glitch), (2, 1, 2, 1));

        let w = TimingProfile::synchronous(25, TransferDirection::Write);
        let r = TimingProfile::synchronous(25, TransferDirection::Read);
        assert_eq!((w.assert, w.deskew, w.hold), (3, 2, 3));
        assert_eq!(r.assert, 5);

        // 200 ns: 22 cycles, (22 - 6 - 2 + 1) / 2
        let p = TimingProfile::synchronous(50, TransferDirection::Write);
        assert_eq!((p.assert, p.deskew, p.hold, p.glitch), (7, 6, 6, 5));
        let p = TimingProfile::synchronous(50, TransferDirection::Read);
        assert_eq!(p.assert, 10);

        let p = TimingProfile::synchronous(30, TransferDirection::Write);
        assert_eq!((p.deskew, p.hold, p.glitch), (2, 4, 1));
    }

    #[test]
    fn rescale() {
        let p = TimingProfile::asynchronous(SpeedGrade::Async50);
        assert_eq!(p.rescale(REFERENCE_CLK_HZ), p);
        let p2 = p.rescale(2 * REFERENCE_CLK_HZ);
        assert_eq!(p2.assert, 18);
        assert_eq!(p2.deskew, 12);
        // Never rounds down to zero
        let p = TimingProfile::synchronous(12, TransferDirection::Write).rescale(50_000_000);
        assert!(p.deskew >= 1 && p.glitch >= 1);
    }

    #[test]
    fn async_rows() {
        let slow = TimingProfile::asynchronous(SpeedGrade::Async15);
        let fast = TimingProfile::asynchronous(SpeedGrade::Async50);
        assert_eq!(slow.assert, 28);
        assert!(slow.assert > fast.assert && slow.glitch > fast.glitch);
        assert_eq!(TimingProfile::asynchronous(SpeedGrade::Sync10), fast);
    }

    #[test]
    fn presets() {
        let p = PlatformTimings::for_clock(150_000_000).unwrap();
        assert_eq!(p.req_delay, 9);
        assert_eq!(p.scsi_20.max_sync, 18);
        let p = PlatformTimings::for_clock(135_428_571).unwrap();
        assert_eq!(p.clk_period_ps, 7384);
        assert!(PlatformTimings::for_clock(108_000_000).is_none());
        for p in PLATFORM_PRESETS {
            assert_eq!(p.grade(SpeedGrade::Sync5).unwrap().max_sync, 50);
            assert!(p.grade(SpeedGrade::Async50).is_none());
        }
    }

    #[test]
    fn pio_delays() {
        let p = PlatformTimings::for_clock(125_000_000).unwrap();
        // 100 ns at 8 ns/cycle: 13 cycles, adjust -1
        assert_eq!(p.period_cycles(25), Some(13));
        assert_eq!(p.sync_write_delays(25), Some((4, 6, 0)));
        // 200 ns: 25 cycles, 24 - 9 - 14 - 3 < 2
        assert_eq!(p.sync_write_delays(50), Some((9, 14, 2)));

        let p = PlatformTimings::for_clock(250_000_000).unwrap();
        // 48 ns at 4 ns/cycle: 12 cycles, adjust +1
        assert_eq!(p.sync_write_delays(12), Some((2, 4, 4)));
        // Clamped to the delay field
        assert_eq!(p.sync_write_delays(80).unwrap().2, 15);
    }

    #[test]
    fn zero_clock_period_falls_back() {
        let mut preset = PlatformTimings::for_clock(150_000_000).unwrap();
        preset.clk_period_ps = 0;
        assert_eq!(preset.period_cycles(25), None);
        assert_eq!(preset.sync_profile(25), None);

        let cfg = TimingConfig {
            clk_hz: 150_000_000,
            async_grade: SpeedGrade::Async50,
            preset: Some(preset),
        };
        let agreement = SyncAgreement {
            period: 25,
            offset: 8,
        };
        assert_eq!(
            cfg.profile(agreement, TransferDirection::Write),
            TimingProfile::synchronous(25, TransferDirection::Write).rescale(150_000_000)
        );
    }

    #[test]
    fn config_profile_selection() {
        let cfg = TimingConfig {
            clk_hz: REFERENCE_CLK_HZ,
            async_grade: SpeedGrade::Async33,
            preset: None,
        };
        assert_eq!(
            cfg.profile(SyncAgreement::ASYNC, TransferDirection::Write),
            TimingProfile::asynchronous(SpeedGrade::Async33)
        );
        let sync = SyncAgreement {
            period: 25,
            offset: 8,
        };
        assert_eq!(
            cfg.profile(sync, TransferDirection::Read),
            TimingProfile::synchronous(25, TransferDirection::Read)
        );

        let cfg = TimingConfig {
            clk_hz: 150_000_000,
            async_grade: SpeedGrade::Async50,
            preset: PlatformTimings::for_clock(150_000_000),
        };
        let p = cfg.profile(sync, TransferDirection::Write);
        assert_eq!((p.deskew, p.assert), (4, 5));
        assert!(cfg.profile(SyncAgreement::ASYNC, TransferDirection::Write).assert >= 9);
    }
}
