use std::fmt;

use scsiphy_core::scsi::negotiation::SyncAgreement;
use scsiphy_core::tickable::Ticks;
use serde::Serialize;

#[derive(Serialize, Debug, Default)]
pub struct SessionReport {
    pub target_id: u8,
    pub agreement: SyncAgreement,
    /// Host speed estimate for the agreement
    pub rate_estimate_kbs: u32,
    pub bytes_expected: usize,
    pub bytes_received: usize,
    pub data_ok: bool,
    pub parity_errors: usize,
    /// Length of the DATA IN phase
    pub data_cycles: Ticks,
    pub throughput_kbs: u64,
    pub max_outstanding: usize,
    pub aborted_requests: usize,
    pub reset: bool,
    pub total_cycles: Ticks,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Target ID:        {}", self.target_id)?;
        if self.agreement.is_sync() {
            writeln!(
                f,
                "Agreement:        sync, period {} ({} ns) offset {} (~{} kB/s)",
                self.agreement.period,
                u32::from(self.agreement.period) * 4,
                self.agreement.offset,
                self.rate_estimate_kbs
            )?;
        } else {
            writeln!(f, "Agreement:        async")?;
        }
        writeln!(
            f,
            "Data:             {}/{} bytes, {}",
            self.bytes_received,
            self.bytes_expected,
            if self.data_ok { "verified" } else { "MISMATCH" }
        )?;
        writeln!(f, "Parity errors:    {}", self.parity_errors)?;
        writeln!(
            f,
            "Data phase:       {} cycles, {} kB/s",
            self.data_cycles, self.throughput_kbs
        )?;
        writeln!(f, "Max. outstanding: {}", self.max_outstanding)?;
        writeln!(f, "Aborted requests: {}", self.aborted_requests)?;
        writeln!(f, "Bus reset:        {}", if self.reset { "yes" } else { "no" })?;
        write!(f, "Total:            {} cycles", self.total_cycles)
    }
}
