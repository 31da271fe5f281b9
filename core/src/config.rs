//! Bus PHY settings

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scsi::negotiation::{MAX_SYNC_PERIOD, Negotiator, SyncAgreement};
use crate::scsi::timing::{PlatformTimings, SpeedGrade, SyncGradeTiming, TimingConfig};
use crate::scsi::{MAX_SYNC_OFFSET, MAX_TARGETS};
use crate::tickable::Ticks;

/// Highest supported controller clock
pub const MAX_CLK_HZ: u32 = 250_000_000;

/// Initiator protocol level
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
pub enum CompatMode {
    /// SCSI-1 hosts need longer bus settle delays
    Scsi1,
    #[default]
    Scsi2,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Controller clock {0} Hz not supported")]
    Clock(u32),
    #[error("Invalid SCSI ID {0}")]
    TargetId(u8),
    #[error("No SCSI IDs configured")]
    NoTargets,
    #[error("Invalid synchronous offset {0}")]
    Offset(u8),
    #[error("Invalid synchronous period {0}")]
    Period(u8),
    #[error("Clock period override must be non-zero")]
    ClockPeriod,
}

/// Per-grade overrides of the platform timing preset
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CustomTimings {
    pub req_delay: Option<u8>,
    pub clk_period_ps: Option<u32>,
    pub scsi_20: Option<SyncGradeTiming>,
    pub scsi_10: Option<SyncGradeTiming>,
    pub scsi_5: Option<SyncGradeTiming>,
}

impl CustomTimings {
    fn apply(&self, mut preset: PlatformTimings) -> PlatformTimings {
        if let Some(v) = self.req_delay {
            preset.req_delay = v;
        }
        if let Some(v) = self.clk_period_ps {
            preset.clk_period_ps = v;
        }
        for (grade, custom) in [
            (SpeedGrade::Sync20, self.scsi_20),
            (SpeedGrade::Sync10, self.scsi_10),
            (SpeedGrade::Sync5, self.scsi_5),
        ] {
            if let (Some(custom), Some(timing)) = (custom, preset.grade_mut(grade)) {
                *timing = custom;
            }
        }
        preset
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PhyConfig {
    /// Controller clock, selects the timing preset
    pub clk_hz: u32,
    /// Fastest speed grade offered in negotiation
    pub max_speed: SpeedGrade,
    /// Timing used for asynchronous transfers
    pub async_speed: SpeedGrade,
    /// Check parity on received bytes
    pub parity: bool,
    pub compat: CompatMode,
    /// SCSI IDs answered to in selection
    pub target_ids: Vec<u8>,
    /// Watchdog for blocking transfers in milliseconds, 0 to disable
    pub transfer_timeout_ms: u32,
    pub custom_timings: Option<CustomTimings>,
    /// Agreement used regardless of what the initiator proposes
    pub force_sync: Option<SyncAgreement>,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            clk_hz: 125_000_000,
            max_speed: SpeedGrade::Sync10,
            async_speed: SpeedGrade::Async50,
            parity: true,
            compat: CompatMode::Scsi2,
            target_ids: vec![0],
            transfer_timeout_ms: 5000,
            custom_timings: None,
            force_sync: None,
        }
    }
}

impl PhyConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clk_hz == 0 || self.clk_hz > MAX_CLK_HZ {
            return Err(ConfigError::Clock(self.clk_hz));
        }
        if self.target_ids.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if let Some(&id) = self.target_ids.iter().find(|&&id| usize::from(id) >= MAX_TARGETS) {
            return Err(ConfigError::TargetId(id));
        }
        if let Some(forced) = self.force_sync {
            if forced.offset > MAX_SYNC_OFFSET {
                return Err(ConfigError::Offset(forced.offset));
            }
            if forced.is_sync() && (forced.period == 0 || forced.period > MAX_SYNC_PERIOD) {
                return Err(ConfigError::Period(forced.period));
            }
        }
        if self
            .custom_timings
            .as_ref()
            .is_some_and(|c| c.clk_period_ps == Some(0))
        {
            return Err(ConfigError::ClockPeriod);
        }
        Ok(())
    }

    /// Timing preset for the clock with custom overrides applied
    pub fn platform_timings(&self) -> Option<PlatformTimings> {
        let preset = PlatformTimings::for_clock(self.clk_hz);
        match (&self.custom_timings, preset) {
            (Some(custom), Some(preset)) => Some(custom.apply(preset)),
            (Some(_), None) => {
                log::warn!(
                    "No timing preset for {} Hz, custom timings ignored",
                    self.clk_hz
                );
                None
            }
            (None, preset) => preset,
        }
    }

    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            clk_hz: self.clk_hz,
            async_grade: self.async_speed,
            preset: self.platform_timings(),
        }
    }

    pub fn negotiator(&self) -> Negotiator {
        Negotiator::new(self.max_speed, self.platform_timings()).with_forced(self.force_sync)
    }

    /// Transfer watchdog in controller cycles
    pub fn timeout_cycles(&self) -> Option<Ticks> {
        if self.transfer_timeout_ms == 0 {
            None
        } else {
            Some(Ticks::from(self.transfer_timeout_ms) * Ticks::from(self.clk_hz) / 1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_valid() {
        let cfg = PhyConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.platform_timings().is_some());
        assert_eq!(cfg.timeout_cycles(), Some(625_000_000));
    }

    #[test]
    fn partial_json() {
        let cfg = PhyConfig::from_json(r#"{ "clk_hz": 150000000, "max_speed": "sync_20" }"#)
            .unwrap();
        assert_eq!(cfg.clk_hz, 150_000_000);
        assert_eq!(cfg.max_speed, SpeedGrade::Sync20);
        assert_eq!(cfg.target_ids, vec![0]);
        assert!(cfg.parity);
        assert_eq!(cfg.negotiator().min_period(), Some(18));
    }

    #[test]
    fn roundtrip() {
        let cfg = PhyConfig {
            compat: CompatMode::Scsi1,
            force_sync: Some(SyncAgreement {
                period: 50,
                offset: 8,
            }),
            ..Default::default()
        };
        assert_eq!(PhyConfig::from_json(&cfg.to_json().unwrap()).unwrap(), cfg);
    }

    #[test]
    fn rejects_invalid() {
        let cfg = PhyConfig {
            clk_hz: 300_000_000,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Clock(300_000_000)));

        let cfg = PhyConfig {
            target_ids: vec![1, 8],
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::TargetId(8)));

        let cfg = PhyConfig {
            force_sync: Some(SyncAgreement {
                period: 25,
                offset: 16,
            }),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Offset(16)));

        assert!(PhyConfig::from_json(r#"{ "target_ids": [] }"#).is_err());
        assert!(PhyConfig::from_json(r#"{ "max_speed": "sync_40" }"#).is_err());
    }

    #[test]
    fn custom_timings() {
        let cfg = PhyConfig::from_json(
            r#"{
                "clk_hz": 150000000,
                "max_speed": "sync_20",
                "custom_timings": {
                    "req_delay": 11,
                    "scsi_20": { "delay0": 3, "delay1": 4, "total_delay_adjust": 1, "max_sync": 20 }
                }
            }"#,
        )
        .unwrap();
        let t = cfg.platform_timings().unwrap();
        assert_eq!(t.req_delay, 11);
        assert_eq!(t.scsi_20.max_sync, 20);
        assert_eq!(t.scsi_10, PlatformTimings::for_clock(150_000_000).unwrap().scsi_10);
        assert_eq!(cfg.negotiator().negotiate(12, 8).period, 20);
    }

    #[test]
    fn zero_clock_period_rejected() {
        let json = r#"{ "clk_hz": 150000000, "custom_timings": { "clk_period_ps": 0 } }"#;
        assert!(PhyConfig::from_json(json).is_err());

        let cfg = PhyConfig {
            clk_hz: 150_000_000,
            custom_timings: Some(CustomTimings {
                clk_period_ps: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ClockPeriod));
        // Still no panic if it gets used regardless
        let sync = SyncAgreement {
            period: 25,
            offset: 8,
        };
        let p = cfg
            .timing()
            .profile(sync, crate::scsi::TransferDirection::Write);
        assert!(p.assert >= 1);
    }

    #[test]
    fn custom_timings_need_preset() {
        let cfg = PhyConfig {
            clk_hz: 100_000_000,
            custom_timings: Some(CustomTimings::default()),
            ..Default::default()
        };
        assert!(cfg.platform_timings().is_none());
        assert_eq!(cfg.timing().clk_hz, 100_000_000);
    }

    #[test]
    fn no_timeout() {
        let cfg = PhyConfig {
            transfer_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.timeout_cycles(), None);
    }

    #[test]
    fn load_file() {
        let path = std::env::temp_dir().join(format!("scsiphy_cfg_{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "target_ids": [2, 3], "parity": false }"#).unwrap();
        let cfg = PhyConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.target_ids, vec![2, 3]);
        assert!(!cfg.parity);

        assert!(PhyConfig::load(Path::new("/nonexistent/scsiphy.json")).is_err());
    }
}
