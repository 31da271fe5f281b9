//! Target-side bus phase engine

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::config::{CompatMode, ConfigError, PhyConfig};
use crate::phy::{ScsiPhy, Signal};
use crate::scsi::accel::{
    AccelState, ReadCompletion, TransferAccelerator, TransferEngine, TransferId, TransferRequest,
};
use crate::scsi::negotiation::{ExtendedMessage, Negotiator, SyncAgreement};
use crate::scsi::parity::{parity_ok, with_parity};
use crate::scsi::reset::{self, CancelToken, ResetFlag};
use crate::scsi::timing::ns_to_cycles;
use crate::scsi::{BusPhase, MAX_TARGETS, wait_signal};
use crate::types::LatchingEvent;

/// Per-byte logging of command, status and message bytes
const PHASE_TRACE: bool = false;

/// Bus settle delay after changing the phase lines
const BUS_SETTLE_NS: u32 = 400;
/// Added when I/O changes direction
const DATA_RELEASE_NS: u32 = 400;
/// Some SCSI-1 hosts need a lot longer to settle
const SCSI1_SETTLE_NS: u32 = 100_000;
/// SCSI-1 hosts need time between command and data phases
const SCSI1_DATA_DELAY_NS: u32 = 400_000;
/// Data bus setup before REQ, and ACK to sample
const BYTE_SETUP_NS: u32 = 100;
/// Reset is checked at least this often during long delays
const DELAY_SLICE_NS: u32 = 1000;

/// An initiator selected us
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub target_id: u8,
    /// SCSI-1 initiators may select without putting their own ID on the bus
    pub initiator_id: Option<u8>,
    /// Initiator asserted ATN, a message out phase is requested
    pub atn: bool,
}

/// Sequences bus phases for one bus and owns everything on it: the pins, the
/// transfer accelerator, the reset flag and the per-target agreements.
pub struct PhaseEngine<P: ScsiPhy, E: TransferEngine<P>> {
    phy: P,
    accel: TransferAccelerator<P, E>,
    reset: ResetFlag,
    phase: BusPhase,
    negotiator: Negotiator,
    agreements: [SyncAgreement; MAX_TARGETS],
    target_ids: ArrayVec<u8, MAX_TARGETS>,
    selection: Option<Selection>,
    /// Nexus to restore on reselection
    last_selection: Option<Selection>,
    compat: CompatMode,
    /// Protocol level of the current initiator
    session_compat: CompatMode,
    parity_check: bool,
    parity_error: LatchingEvent,
}

impl<P: ScsiPhy, E: TransferEngine<P>> PhaseEngine<P, E> {
    pub fn new(mut phy: P, engine: E, config: &PhyConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut target_ids = ArrayVec::new();
        for &id in &config.target_ids {
            if !target_ids.contains(&id) {
                // IDs are validated, at most MAX_TARGETS unique ones
                let _ = target_ids.try_push(id);
            }
        }

        phy.release_all();

        Ok(Self {
            phy,
            accel: TransferAccelerator::new(engine, config.timing())
                .with_timeout(config.timeout_cycles()),
            reset: ResetFlag::new(),
            phase: BusPhase::Free,
            negotiator: config.negotiator(),
            agreements: [SyncAgreement::ASYNC; MAX_TARGETS],
            target_ids,
            selection: None,
            last_selection: None,
            compat: config.compat,
            session_compat: config.compat,
            parity_check: config.parity,
            parity_error: LatchingEvent::default(),
        })
    }

    /// Handle for the RST interrupt context
    pub fn reset_flag(&self) -> ResetFlag {
        self.reset.clone()
    }

    pub fn is_reset(&self) -> bool {
        self.reset.is_set()
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn accel(&self) -> &TransferAccelerator<P, E> {
        &self.accel
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn compat(&self) -> CompatMode {
        self.session_compat
    }

    pub fn agreement(&self, target_id: u8) -> SyncAgreement {
        self.agreements
            .get(usize::from(target_id))
            .copied()
            .unwrap_or_default()
    }

    fn current_agreement(&self) -> SyncAgreement {
        self.selection
            .map_or(SyncAgreement::ASYNC, |s| self.agreement(s.target_id))
    }

    /// Body of the RST edge interrupt, for platforms that poll RST
    pub fn on_rst_edge(&mut self) -> bool {
        reset::rst_edge(&mut self.phy, &self.reset)
    }

    /// Completes handling of a bus reset. Returns true if one was pending.
    pub fn handle_reset(&mut self) -> bool {
        if !self.reset.is_set() {
            return false;
        }
        log::debug!("Handling bus reset in phase {}", self.phase);
        self.enter_bus_free();
        self.reset.clear();
        true
    }

    /// Cancellable delay, false if the bus was reset meanwhile
    fn delay_ns(&mut self, ns: u32) -> bool {
        let clk_hz = self.phy.clk_hz();
        let slice = ns_to_cycles(DELAY_SLICE_NS, clk_hz).max(1);
        let mut remaining = ns_to_cycles(ns, clk_hz);
        while remaining > 0 {
            if self.reset.is_set() {
                return false;
            }
            let step = remaining.min(slice);
            self.phy.delay_cycles(step);
            remaining -= step;
        }
        !self.reset.is_set()
    }

    /// Checks for selection by an initiator and responds to it.
    pub fn check_selection(&mut self) -> Option<Selection> {
        if self.reset.is_set() {
            self.enter_bus_free();
            return None;
        }
        if self.phase != BusPhase::Free {
            return None;
        }
        if !self.phy.read(Signal::Sel) || self.phy.read(Signal::Bsy) {
            return None;
        }
        let ids = self.phy.read_data().data();
        let target_id = *self
            .target_ids
            .iter()
            .find(|&&id| ids & (1 << id) != 0)?;

        let atn = self.phy.read(Signal::Atn);
        self.phy.assert(Signal::Bsy);
        self.phase = BusPhase::Selection;

        // Initiator releases SEL once it sees BSY
        let cancel = CancelToken::new(&self.reset);
        if !wait_signal(&mut self.phy, Signal::Sel, false, 0, &cancel) {
            self.enter_bus_free();
            return None;
        }

        if !atn && self.session_compat != CompatMode::Scsi1 {
            log::debug!("Selected without ATN, assuming SCSI-1 initiator");
            self.session_compat = CompatMode::Scsi1;
        }
        self.agreements[usize::from(target_id)] = SyncAgreement::ASYNC;
        let others = ids & !(1 << target_id);
        let initiator_id = (others != 0).then(|| (u8::BITS - 1 - others.leading_zeros()) as u8);
        let selection = Selection {
            target_id,
            initiator_id,
            atn,
        };
        self.selection = Some(selection);
        self.last_selection = Some(selection);
        log::debug!("Selected as ID {} by {:02X}", target_id, ids);
        Some(selection)
    }

    /// Drives the lines for `phase` and returns the settle delay in ns the
    /// caller has to observe before the first handshake.
    pub fn enter_phase_immediate(&mut self, phase: BusPhase) -> u32 {
        if self.reset.is_set() {
            self.enter_bus_free();
            return 0;
        }
        if phase == self.phase {
            return 0;
        }
        if phase == BusPhase::Free {
            self.enter_bus_free();
            return 0;
        }

        // No phase change while ACK is asserted (SPI-3 10.7.1)
        let cancel = CancelToken::new(&self.reset);
        if !wait_signal(&mut self.phy, Signal::Ack, false, 0, &cancel) {
            self.enter_bus_free();
            return 0;
        }
        if self.session_compat == CompatMode::Scsi1
            && phase.is_data()
            && !self.delay_ns(SCSI1_DATA_DELAY_NS)
        {
            self.enter_bus_free();
            return 0;
        }

        let old = self.phase;
        self.phase = phase;
        log::trace!("Bus phase {} -> {}", old, phase);

        let agreement = if phase.is_data() {
            self.current_agreement()
        } else {
            SyncAgreement::ASYNC
        };
        if let Err(e) = self.accel.set_sync_mode(agreement.offset, agreement.period) {
            log::error!("{}, resetting bus", e);
            self.reset.signal();
            self.enter_bus_free();
            return 0;
        }

        if phase == BusPhase::Reselection {
            return self.drive_reselection();
        }
        let Some(code) = phase.code() else {
            // Someone else owns the bus
            self.phy.release_all();
            return 0;
        };
        if old == BusPhase::Reselection {
            self.phy.release_data_req();
            self.phy.deassert(Signal::Sel);
        }
        self.phy.drive_phase(code);
        self.phy.assert(Signal::Bsy);

        let mut delay = BUS_SETTLE_NS;
        if old.is_input() != phase.is_input() {
            delay += DATA_RELEASE_NS;
        }
        if self.session_compat == CompatMode::Scsi1 {
            delay += SCSI1_SETTLE_NS;
        }
        delay
    }

    /// Reconnects to the initiator of the last selection: both IDs on the
    /// data bus with SEL, BSY and I/O asserted. SEL is released on the next
    /// phase change.
    fn drive_reselection(&mut self) -> u32 {
        let Some(nexus) = self.last_selection else {
            log::warn!("Reselection without a previous selection");
            self.phy.release_all();
            return 0;
        };
        let ids = (1u8 << nexus.target_id) | nexus.initiator_id.map_or(0, |id| 1 << id);
        self.phy.drive_data(with_parity(ids));
        self.phy.assert(Signal::Io);
        self.phy.assert(Signal::Sel);
        self.phy.assert(Signal::Bsy);
        self.selection = Some(nexus);
        self.session_compat = if nexus.atn {
            self.compat
        } else {
            CompatMode::Scsi1
        };
        log::debug!("Reselecting {:02X}", ids);
        BUS_SETTLE_NS
    }

    /// Changes to `phase` and waits for the bus to settle. A bus reset
    /// before or during the change ends up in bus free instead.
    pub fn enter_phase(&mut self, phase: BusPhase) {
        let delay = self.enter_phase_immediate(phase);
        if delay > 0 && !self.delay_ns(delay) {
            self.enter_bus_free();
        }
    }

    /// Releases the bus. On a pending reset, in-flight transfers and all
    /// agreements are dropped as well.
    pub fn enter_bus_free(&mut self) {
        let resetting = self.reset.is_set();
        if resetting || self.accel.state() != AccelState::Idle {
            self.accel.abort(&mut self.phy);
        }
        if resetting {
            self.agreements = [SyncAgreement::ASYNC; MAX_TARGETS];
            self.last_selection = None;
            if let Err(e) = self.accel.set_sync_mode(0, 0) {
                log::error!("{} after abort", e);
            }
        }
        if self.phase != BusPhase::Free {
            log::trace!("Bus phase {} -> {}", self.phase, BusPhase::Free);
        }
        self.phase = BusPhase::Free;
        self.selection = None;
        self.session_compat = self.compat;
        self.phy.release_all();
    }

    /// Single byte handshake towards the initiator
    pub fn write_byte(&mut self, value: u8) {
        if self.reset.is_set() {
            return;
        }
        if PHASE_TRACE {
            log::trace!("{} out {:02X}", self.phase, value);
        }
        let cancel = CancelToken::new(&self.reset);
        self.phy.drive_data(with_parity(value));
        self.phy.delay_ns(BYTE_SETUP_NS);
        self.phy.assert(Signal::Req);
        let acked = wait_signal(&mut self.phy, Signal::Ack, true, 0, &cancel);
        self.phy.release_data_req();
        if acked {
            wait_signal(&mut self.phy, Signal::Ack, false, 0, &cancel);
        }
    }

    /// Single byte handshake from the initiator. Parity errors are latched,
    /// see [`Self::take_parity_error`].
    pub fn read_byte(&mut self) -> u8 {
        if self.reset.is_set() {
            return 0;
        }
        let cancel = CancelToken::new(&self.reset);
        self.phy.assert(Signal::Req);
        if !wait_signal(&mut self.phy, Signal::Ack, true, 0, &cancel) {
            self.phy.deassert(Signal::Req);
            return 0;
        }
        self.phy.delay_ns(BYTE_SETUP_NS);
        let bus = self.phy.read_data();
        self.phy.deassert(Signal::Req);
        wait_signal(&mut self.phy, Signal::Ack, false, 0, &cancel);

        if self.parity_check && !parity_ok(bus) {
            log::warn!("Parity error in {}: {:03X}", self.phase, bus.0);
            self.parity_error.set();
        }
        if PHASE_TRACE {
            log::trace!("{} in {:02X}", self.phase, bus.data());
        }
        bus.data()
    }

    /// Parity error seen by [`Self::read_byte`] since the last call
    pub fn take_parity_error(&mut self) -> bool {
        self.parity_error.get_clear()
    }

    pub fn start_write(&mut self, data: Vec<u8>) -> TransferId {
        self.accel.start_write(&mut self.phy, data, &self.reset)
    }

    pub fn is_write_finished(&mut self, id: Option<TransferId>) -> bool {
        self.accel.is_write_finished(&mut self.phy, &self.reset, id)
    }

    pub fn finish_write(&mut self) -> Vec<TransferRequest> {
        self.accel.finish_write(&mut self.phy, &self.reset)
    }

    pub fn start_read(&mut self, buffer: Vec<u8>) -> TransferId {
        self.accel.start_read(&mut self.phy, buffer, &self.reset)
    }

    pub fn is_read_finished(&mut self, id: Option<TransferId>) -> bool {
        self.accel.is_read_finished(&mut self.phy, &self.reset, id)
    }

    pub fn finish_read(&mut self) -> ReadCompletion {
        self.accel.finish_read(&mut self.phy, &self.reset)
    }

    /// Writes `data` and waits for completion
    pub fn write(&mut self, data: Vec<u8>) {
        self.start_write(data);
        self.finish_write();
    }

    /// Reads `len` bytes. Returns the data and whether a parity error
    /// occurred. Check [`Self::is_reset`] for aborted transfers.
    pub fn read(&mut self, len: usize) -> (Vec<u8>, bool) {
        let id = self.start_read(vec![0; len]);
        let done = self.finish_read();
        let data = done
            .requests
            .into_iter()
            .find(|r| r.id() == id)
            .map(TransferRequest::into_buffer)
            .unwrap_or_default();
        (data, done.parity_error)
    }

    /// Decides the agreement for a proposal of the selecting initiator
    pub fn negotiate_sync(&mut self, period: u8, offset: u8) -> SyncAgreement {
        let agreement = self.negotiator.negotiate(period, offset);
        if let Some(sel) = self.selection {
            self.agreements[usize::from(sel.target_id)] = agreement;
        }
        log::debug!(
            "Sync negotiation: period {} offset {} -> period {} offset {} (~{} kB/s)",
            period,
            offset,
            agreement.period,
            agreement.offset,
            agreement.rate_kbs()
        );
        agreement
    }

    /// Handles an extended message received in MESSAGE OUT, given the
    /// bytes after the extended message byte. Returns the reply for
    /// MESSAGE IN, or None if the message is to be rejected.
    pub fn handle_extended_message(&mut self, body: &[u8]) -> Option<ExtendedMessage> {
        match ExtendedMessage::parse(body)? {
            ExtendedMessage::Sync(proposal) => Some(ExtendedMessage::Sync(
                self.negotiate_sync(proposal.period, proposal.offset),
            )),
            ExtendedMessage::Wide { exponent } => {
                // Narrow bus only. WDTR also resets the sync agreement.
                log::debug!("WDTR exponent {}, answering 8-bit", exponent);
                if let Some(sel) = self.selection {
                    self.agreements[usize::from(sel.target_id)] = SyncAgreement::ASYNC;
                }
                Some(ExtendedMessage::Wide { exponent: 0 })
            }
            ExtendedMessage::Unsupported(code) => {
                log::debug!("Unsupported extended message {:02X}", code);
                None
            }
        }
    }
}
