//! Transfer accelerator: moves DATA phase bytes between memory buffers and
//! the bus under REQ/ACK handshake control.
//!
//! Requests are owned by the accelerator from `start_*` until they are
//! handed back by `finish_*` (or [`TransferAccelerator::reclaim`]), so a
//! buffer can never be touched while the hardware still streams it.

use std::collections::VecDeque;
use std::marker::PhantomData;

use thiserror::Error;

use crate::phy::{ScsiPhy, Signal};
use crate::scsi::negotiation::SyncAgreement;
use crate::scsi::parity::{parity_ok, with_parity};
use crate::scsi::reset::{CancelToken, ResetFlag};
use crate::scsi::timing::{TimingConfig, TimingProfile};
use crate::scsi::{TransferDirection, wait_signal};
use crate::tickable::Ticks;
use crate::types::{DataBus, LatchingEvent};

/// Per-byte transfer logging
const ACCEL_TRACE: bool = false;

/// Requests in flight on the hardware, the active one plus one queued
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

pub type TransferId = u32;

/// A buffer handed to the accelerator
#[derive(Debug)]
pub struct TransferRequest {
    id: TransferId,
    direction: TransferDirection,
    buffer: Vec<u8>,
    /// Bytes clocked over the bus
    done: usize,
    parity_error: bool,
    aborted: bool,
}

impl TransferRequest {
    fn new(id: TransferId, direction: TransferDirection, buffer: Vec<u8>) -> Self {
        Self {
            id,
            direction,
            buffer,
            done: 0,
            parity_error: false,
            aborted: false,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes moved over the bus. Not reliable for aborted requests.
    pub fn transferred(&self) -> usize {
        self.done
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn parity_error(&self) -> bool {
        self.parity_error
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Outcome of a read session
#[derive(Debug)]
pub struct ReadCompletion {
    pub requests: Vec<TransferRequest>,
    /// A parity error occurred anywhere in the session
    pub parity_error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum AccelState {
    Idle,
    Write,
    /// All write data consumed, acknowledgements may be outstanding
    WriteDone,
    Read,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccelError {
    #[error("Cannot change handshake mode while busy ({0:?})")]
    Busy(AccelState),
}

/// Handshake parameters loaded into the engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeMode {
    /// Max. REQ pulses outstanding, 0 for async
    pub offset: u8,
    pub profile: TimingProfile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Busy,
    Complete,
}

/// Bulk mover hardware: a DMA channel or PIO state machine pair.
pub trait TransferEngine<P: ScsiPhy> {
    /// Requests the hardware can hold, including the active one
    fn queue_depth(&self) -> usize {
        DEFAULT_QUEUE_DEPTH
    }

    /// Loads handshake parameters, only called while idle
    fn configure(&mut self, mode: HandshakeMode);

    /// Hands a request to the hardware
    fn submit(&mut self, phy: &mut P, req: &TransferRequest);

    /// Advances the oldest submitted request without blocking on the bus
    fn poll(&mut self, phy: &mut P, req: &mut TransferRequest) -> StepStatus;

    /// Waits for acknowledgements still outstanding after the last byte
    fn drain(&mut self, phy: &mut P, cancel: &CancelToken) -> bool;

    /// Stops the hardware and lets go of the data bus and REQ
    fn stop(&mut self, phy: &mut P);

    /// Runs `req` to completion. Returns false if cancelled first.
    fn await_request(&mut self, phy: &mut P, req: &mut TransferRequest, cancel: &CancelToken) -> bool {
        loop {
            if cancel.is_cancelled(phy.cycles()) {
                return false;
            }
            if self.poll(phy, req) == StepStatus::Complete {
                return true;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteStep {
    Setup,
    WaitAck,
    WaitRelease,
}

/// Software handshake engine working directly on the bus pins. Mirrors what
/// the PIO programs do: one byte per REQ/ACK cycle in async mode, REQ pulses
/// paced by the ACK count in sync mode.
#[derive(Debug)]
pub struct PioEngine {
    mode: HandshakeMode,
    parity_check: bool,
    active: Option<TransferId>,
    step: ByteStep,
    /// REQ pulses issued for the active request
    issued: usize,
    /// Sync REQ pulses not acknowledged yet
    outstanding: u32,
}

impl PioEngine {
    pub fn new(parity_check: bool) -> Self {
        Self {
            mode: HandshakeMode::default(),
            parity_check,
            active: None,
            step: ByteStep::Setup,
            issued: 0,
            outstanding: 0,
        }
    }

    fn sample<P: ScsiPhy>(&self, phy: &mut P, signal: Signal, asserted: bool) -> bool {
        if phy.read(signal) != asserted {
            return false;
        }
        let glitch = self.mode.profile.glitch;
        if glitch == 0 {
            return true;
        }
        phy.delay_cycles(glitch);
        phy.read(signal) == asserted
    }

    fn store(&self, req: &mut TransferRequest, idx: usize, bus: DataBus) {
        if self.parity_check && !parity_ok(bus) {
            if !req.parity_error {
                log::warn!("Parity error in request {} at byte {}", req.id, idx);
            }
            req.parity_error = true;
        }
        req.buffer[idx] = bus.data();
    }

    fn collect_acks<P: ScsiPhy>(&mut self, phy: &mut P) {
        let acks = phy.take_ack_edges();
        self.outstanding = self.outstanding.saturating_sub(acks);
    }

    fn req_pulse<P: ScsiPhy>(&mut self, phy: &mut P) {
        let p = self.mode.profile;
        phy.assert(Signal::Req);
        phy.delay_cycles(p.assert);
        phy.deassert(Signal::Req);
        phy.delay_cycles(p.hold);
        self.issued += 1;
        self.outstanding += 1;
    }

    fn poll_async_write<P: ScsiPhy>(&mut self, phy: &mut P, req: &mut TransferRequest) {
        let p = self.mode.profile;
        match self.step {
            ByteStep::Setup => {
                let byte = req.buffer[req.done];
                if ACCEL_TRACE {
                    log::trace!("Write {:02X}", byte);
                }
                phy.drive_data(with_parity(byte));
                phy.delay_cycles(p.assert);
                phy.assert(Signal::Req);
                self.step = ByteStep::WaitAck;
            }
            ByteStep::WaitAck => {
                if self.sample(phy, Signal::Ack, true) {
                    phy.delay_cycles(p.hold);
                    phy.release_data_req();
                    self.step = ByteStep::WaitRelease;
                }
            }
            ByteStep::WaitRelease => {
                if self.sample(phy, Signal::Ack, false) {
                    req.done += 1;
                    self.step = ByteStep::Setup;
                }
            }
        }
    }

    fn poll_async_read<P: ScsiPhy>(&mut self, phy: &mut P, req: &mut TransferRequest) {
        match self.step {
            ByteStep::Setup => {
                phy.assert(Signal::Req);
                self.step = ByteStep::WaitAck;
            }
            ByteStep::WaitAck => {
                if self.sample(phy, Signal::Ack, true) {
                    phy.delay_cycles(self.mode.profile.deskew);
                    let bus = phy.read_data();
                    if ACCEL_TRACE {
                        log::trace!("Read {:02X}", bus.data());
                    }
                    self.store(req, req.done, bus);
                    phy.deassert(Signal::Req);
                    self.step = ByteStep::WaitRelease;
                }
            }
            ByteStep::WaitRelease => {
                if self.sample(phy, Signal::Ack, false) {
                    req.done += 1;
                    self.step = ByteStep::Setup;
                }
            }
        }
    }

    fn poll_sync_write<P: ScsiPhy>(&mut self, phy: &mut P, req: &mut TransferRequest) {
        self.collect_acks(phy);
        if self.outstanding >= u32::from(self.mode.offset) {
            phy.delay_cycles(1);
            return;
        }
        let byte = req.buffer[self.issued];
        phy.drive_data(with_parity(byte));
        phy.delay_cycles(self.mode.profile.deskew);
        self.req_pulse(phy);
        req.done = self.issued;
    }

    fn poll_sync_read<P: ScsiPhy>(&mut self, phy: &mut P, req: &mut TransferRequest) {
        let mut progress = false;
        while self.outstanding > 0 {
            let Some(bus) = phy.take_latched() else {
                break;
            };
            self.store(req, req.done, bus);
            req.done += 1;
            self.outstanding -= 1;
            progress = true;
        }
        // Latched samples carry the ACK count
        phy.take_ack_edges();

        if self.issued < req.len() && self.outstanding < u32::from(self.mode.offset) {
            self.req_pulse(phy);
            progress = true;
        }
        if !progress {
            phy.delay_cycles(1);
        }
    }
}

impl<P: ScsiPhy> TransferEngine<P> for PioEngine {
    fn configure(&mut self, mode: HandshakeMode) {
        self.mode = mode;
    }

    fn submit(&mut self, _phy: &mut P, req: &TransferRequest) {
        if ACCEL_TRACE {
            log::trace!(
                "Submit {} {} bytes {}",
                req.id,
                req.len(),
                <&str>::from(req.direction)
            );
        }
    }

    fn poll(&mut self, phy: &mut P, req: &mut TransferRequest) -> StepStatus {
        if self.active != Some(req.id) {
            self.active = Some(req.id);
            self.issued = 0;
            self.step = ByteStep::Setup;
        }

        let sync = self.mode.offset > 0;
        match req.direction {
            TransferDirection::Write if sync => {
                if self.issued < req.len() {
                    self.poll_sync_write(phy, req);
                }
                if self.issued == req.len() {
                    req.done = req.len();
                    return StepStatus::Complete;
                }
            }
            TransferDirection::Read if sync => {
                if req.done < req.len() {
                    self.poll_sync_read(phy, req);
                }
                if req.done == req.len() {
                    return StepStatus::Complete;
                }
            }
            TransferDirection::Write => {
                if req.done < req.len() {
                    self.poll_async_write(phy, req);
                }
                if req.done == req.len() {
                    return StepStatus::Complete;
                }
            }
            TransferDirection::Read => {
                if req.done < req.len() {
                    self.poll_async_read(phy, req);
                }
                if req.done == req.len() {
                    return StepStatus::Complete;
                }
            }
        }
        StepStatus::Busy
    }

    fn drain(&mut self, phy: &mut P, cancel: &CancelToken) -> bool {
        loop {
            self.collect_acks(phy);
            if self.outstanding == 0 {
                break;
            }
            if cancel.is_cancelled(phy.cycles()) {
                return false;
            }
            phy.delay_cycles(1);
        }
        wait_signal(phy, Signal::Ack, false, 0, cancel)
    }

    fn stop(&mut self, phy: &mut P) {
        phy.release_data_req();
        phy.take_ack_edges();
        while phy.take_latched().is_some() {}
        self.active = None;
        self.step = ByteStep::Setup;
        self.issued = 0;
        self.outstanding = 0;
    }
}

/// Queues transfer requests onto a [`TransferEngine`] and tracks the
/// transfer session state.
pub struct TransferAccelerator<P: ScsiPhy, E: TransferEngine<P>> {
    engine: E,
    state: AccelState,
    timing: TimingConfig,
    agreement: SyncAgreement,
    /// Write and read profiles for the current agreement
    profiles: [TimingProfile; 2],
    queue: VecDeque<TransferRequest>,
    retired: VecDeque<TransferRequest>,
    parity: LatchingEvent,
    next_id: TransferId,
    /// Watchdog for the blocking finish calls
    timeout: Option<Ticks>,
    _phy: PhantomData<P>,
}

impl<P: ScsiPhy, E: TransferEngine<P>> TransferAccelerator<P, E> {
    pub fn new(engine: E, timing: TimingConfig) -> Self {
        let agreement = SyncAgreement::ASYNC;
        Self {
            engine,
            state: AccelState::Idle,
            timing,
            agreement,
            profiles: [
                timing.profile(agreement, TransferDirection::Write),
                timing.profile(agreement, TransferDirection::Read),
            ],
            queue: VecDeque::new(),
            retired: VecDeque::new(),
            parity: LatchingEvent::default(),
            next_id: 1,
            timeout: None,
            _phy: PhantomData,
        }
    }

    pub fn with_timeout(self, timeout: Option<Ticks>) -> Self {
        Self { timeout, ..self }
    }

    pub fn state(&self) -> AccelState {
        self.state
    }

    pub fn sync_mode(&self) -> SyncAgreement {
        self.agreement
    }

    pub fn profile(&self, direction: TransferDirection) -> TimingProfile {
        match direction {
            TransferDirection::Write => self.profiles[0],
            TransferDirection::Read => self.profiles[1],
        }
    }

    /// Selects async (offset 0) or sync handshaking for the next transfers.
    /// Refused while a transfer session is active.
    pub fn set_sync_mode(&mut self, offset: u8, period: u8) -> Result<(), AccelError> {
        if self.state != AccelState::Idle {
            return Err(AccelError::Busy(self.state));
        }
        let agreement = if offset == 0 {
            SyncAgreement::ASYNC
        } else {
            SyncAgreement { period, offset }
        };
        if agreement != self.agreement {
            self.agreement = agreement;
            self.profiles = [
                self.timing.profile(agreement, TransferDirection::Write),
                self.timing.profile(agreement, TransferDirection::Read),
            ];
            log::debug!(
                "Transfer mode offset {} period {}: {:?}",
                offset,
                period,
                self.profiles[0]
            );
        }
        Ok(())
    }

    fn alloc_id(&mut self) -> TransferId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Queues `data` for DATA IN. Blocks only while the hardware queue is
    /// full.
    pub fn start_write(&mut self, phy: &mut P, data: Vec<u8>, reset: &ResetFlag) -> TransferId {
        if self.state == AccelState::Read {
            log::warn!("Write started during read session");
            self.finish(phy, reset);
        }
        let id = self.alloc_id();
        self.enqueue(phy, TransferRequest::new(id, TransferDirection::Write, data), reset);
        id
    }

    /// Queues `buffer` to be filled during DATA OUT. The whole buffer length
    /// is transferred.
    pub fn start_read(&mut self, phy: &mut P, buffer: Vec<u8>, reset: &ResetFlag) -> TransferId {
        if matches!(self.state, AccelState::Write | AccelState::WriteDone) {
            log::warn!("Read started during write session");
            self.finish(phy, reset);
        }
        let id = self.alloc_id();
        self.enqueue(phy, TransferRequest::new(id, TransferDirection::Read, buffer), reset);
        id
    }

    fn enqueue(&mut self, phy: &mut P, mut req: TransferRequest, reset: &ResetFlag) {
        let cancel = CancelToken::new(reset);
        while self.queue.len() >= self.engine.queue_depth() && !cancel.is_cancelled(phy.cycles()) {
            self.step(phy);
        }
        if reset.is_set() {
            if self.state != AccelState::Idle {
                self.abort(phy);
            }
            req.aborted = true;
            self.retired.push_back(req);
            return;
        }

        if self.state == AccelState::Idle {
            let profile = self.profile(req.direction);
            self.engine.configure(HandshakeMode {
                offset: self.agreement.offset,
                profile,
            });
            // New session
            self.parity.get_clear();
        }
        self.state = match req.direction {
            TransferDirection::Write => AccelState::Write,
            TransferDirection::Read => AccelState::Read,
        };
        self.engine.submit(phy, &req);
        self.queue.push_back(req);
    }

    fn retire_front(&mut self) {
        let Some(req) = self.queue.pop_front() else {
            return;
        };
        if req.parity_error {
            self.parity.set();
        }
        self.retired.push_back(req);
        if self.queue.is_empty() && self.state == AccelState::Write {
            self.state = AccelState::WriteDone;
        }
    }

    fn step(&mut self, phy: &mut P) {
        let Some(req) = self.queue.front_mut() else {
            return;
        };
        if self.engine.poll(phy, req) == StepStatus::Complete {
            self.retire_front();
        }
    }

    /// Gives the hardware one step. On reset, aborts the session.
    pub fn service(&mut self, phy: &mut P, reset: &ResetFlag) {
        if reset.is_set() {
            if self.state != AccelState::Idle {
                self.abort(phy);
            }
            return;
        }
        self.step(phy);
    }

    fn is_finished(
        &mut self,
        phy: &mut P,
        reset: &ResetFlag,
        direction: TransferDirection,
        id: Option<TransferId>,
    ) -> bool {
        self.service(phy, reset);
        match id {
            Some(id) => !self.queue.iter().any(|r| r.id == id),
            None => !self.queue.iter().any(|r| r.direction == direction),
        }
    }

    /// True once request `id` (or all writes) have been consumed
    pub fn is_write_finished(&mut self, phy: &mut P, reset: &ResetFlag, id: Option<TransferId>) -> bool {
        self.is_finished(phy, reset, TransferDirection::Write, id)
    }

    /// True once request `id` (or all reads) have been filled
    pub fn is_read_finished(&mut self, phy: &mut P, reset: &ResetFlag, id: Option<TransferId>) -> bool {
        self.is_finished(phy, reset, TransferDirection::Read, id)
    }

    /// Takes back a finished request before the session ends
    pub fn reclaim(&mut self, id: TransferId) -> Option<TransferRequest> {
        let idx = self.retired.iter().position(|r| r.id == id)?;
        self.retired.remove(idx)
    }

    /// Completes the session, aborting it on reset or timeout
    fn finish(&mut self, phy: &mut P, reset: &ResetFlag) {
        if self.state == AccelState::Idle {
            return;
        }
        let deadline = self.timeout.map(|t| phy.cycles() + t);
        let cancel = CancelToken::new(reset).with_deadline(deadline);

        let mut completed = true;
        while let Some(req) = self.queue.front_mut() {
            if !self.engine.await_request(phy, req, &cancel) {
                completed = false;
                break;
            }
            self.retire_front();
        }
        if completed {
            completed = self.engine.drain(phy, &cancel);
        }

        if completed {
            self.engine.stop(phy);
            self.state = AccelState::Idle;
        } else {
            if !reset.is_set() && cancel.timed_out(phy.cycles()) {
                log::error!(
                    "Transfer timeout in state {}, {} requests pending",
                    <&str>::from(self.state),
                    self.queue.len()
                );
                reset.signal();
            }
            self.abort(phy);
        }
    }

    /// Blocks until all writes are on the bus and acknowledged, or the bus
    /// is reset. Hands back the finished requests.
    pub fn finish_write(&mut self, phy: &mut P, reset: &ResetFlag) -> Vec<TransferRequest> {
        if self.state == AccelState::Read {
            log::warn!("finish_write during read session");
        }
        self.finish(phy, reset);
        self.retired.drain(..).collect()
    }

    /// Blocks until all read buffers are filled, or the bus is reset
    pub fn finish_read(&mut self, phy: &mut P, reset: &ResetFlag) -> ReadCompletion {
        if matches!(self.state, AccelState::Write | AccelState::WriteDone) {
            log::warn!("finish_read during write session");
        }
        self.finish(phy, reset);
        ReadCompletion {
            requests: self.retired.drain(..).collect(),
            parity_error: self.parity.get_clear(),
        }
    }

    /// Stops the hardware and gives up all queued requests
    pub fn abort(&mut self, phy: &mut P) {
        if !self.queue.is_empty() {
            log::debug!("Aborting {} transfer requests", self.queue.len());
        }
        self.engine.stop(phy);
        for mut req in self.queue.drain(..) {
            req.aborted = true;
            self.retired.push_back(req);
        }
        self.state = AccelState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::simbus::SimBus;
    use crate::scsi::BusPhase;
    use crate::scsi::timing::{PlatformTimings, SpeedGrade};
    use std::time::Duration;

    const CLK: u32 = 150_000_000;

    type Accel = TransferAccelerator<SimBus, PioEngine>;

    fn setup(phase: BusPhase, latency: Ticks) -> (SimBus, Accel, ResetFlag) {
        let mut bus = SimBus::new(CLK).with_ack_latency(latency);
        bus.assert(Signal::Bsy);
        bus.drive_phase(phase.code().unwrap());
        let timing = TimingConfig {
            clk_hz: CLK,
            async_grade: SpeedGrade::Async50,
            preset: PlatformTimings::for_clock(CLK),
        };
        let reset = ResetFlag::new();
        bus.attach_reset_irq(reset.clone());
        (bus, Accel::new(PioEngine::new(true), timing), reset)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    #[test]
    fn async_write() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 4);
        let data = pattern(64, 1);
        let id = accel.start_write(&mut bus, data.clone(), &reset);
        assert_eq!(accel.state(), AccelState::Write);

        let done = accel.finish_write(&mut bus, &reset);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id(), id);
        assert!(!done[0].is_aborted());
        assert_eq!(done[0].transferred(), 64);
        assert_eq!(bus.received(), data.as_slice());
        assert_eq!(bus.parity_errors(), 0);
        assert_eq!(accel.state(), AccelState::Idle);
        assert!(!bus.lines().req());
        assert!(!bus.data_driven());
    }

    #[test]
    fn fifo_ordering() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 2);
        let bufs = [pattern(40, 1), pattern(17, 2), pattern(33, 3), pattern(5, 4)];
        let ids = bufs
            .iter()
            .map(|b| accel.start_write(&mut bus, b.clone(), &reset))
            .collect::<Vec<_>>();

        let done = accel.finish_write(&mut bus, &reset);
        assert_eq!(done.iter().map(|r| r.id()).collect::<Vec<_>>(), ids);
        assert_eq!(bus.received(), bufs.concat().as_slice());
    }

    #[test]
    fn finished_by_id() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 2);
        let a = accel.start_write(&mut bus, pattern(16, 0), &reset);
        let b = accel.start_write(&mut bus, pattern(16, 1), &reset);
        assert!(!accel.is_write_finished(&mut bus, &reset, None));
        while !accel.is_write_finished(&mut bus, &reset, Some(a)) {}
        assert!(!accel.is_write_finished(&mut bus, &reset, Some(b)));
        assert_eq!(accel.reclaim(a).unwrap().into_buffer(), pattern(16, 0));
        assert!(accel.reclaim(a).is_none());

        let done = accel.finish_write(&mut bus, &reset);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id(), b);
        assert_eq!(bus.received().len(), 32);
    }

    #[test]
    fn empty_write() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 2);
        accel.start_write(&mut bus, vec![], &reset);
        let done = accel.finish_write(&mut bus, &reset);
        assert_eq!(done.len(), 1);
        assert!(!done[0].is_aborted());
        assert!(bus.received().is_empty());
    }

    #[test]
    fn sync_write() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 40);
        accel.set_sync_mode(8, 25).unwrap();
        bus.set_sync_offset(8);
        let data = pattern(512, 9);
        accel.start_write(&mut bus, data[..256].to_vec(), &reset);
        accel.start_write(&mut bus, data[256..].to_vec(), &reset);

        let done = accel.finish_write(&mut bus, &reset);
        assert!(done.iter().all(|r| !r.is_aborted()));
        assert_eq!(bus.received(), data.as_slice());
        assert!(bus.max_outstanding() > 1);
        assert!(bus.max_outstanding() <= 8);
    }

    #[test]
    fn async_read() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataOut, 3);
        let data = pattern(32, 5);
        bus.queue_initiator_bytes(&data);
        accel.start_read(&mut bus, vec![0; 32], &reset);

        let done = accel.finish_read(&mut bus, &reset);
        assert!(!done.parity_error);
        assert_eq!(done.requests.len(), 1);
        assert_eq!(done.requests[0].buffer(), data.as_slice());
    }

    #[test]
    fn sync_read() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataOut, 30);
        accel.set_sync_mode(4, 50).unwrap();
        bus.set_sync_offset(4);
        let data = pattern(100, 3);
        bus.queue_initiator_bytes(&data);
        accel.start_read(&mut bus, vec![0; 60], &reset);
        accel.start_read(&mut bus, vec![0; 40], &reset);

        let done = accel.finish_read(&mut bus, &reset);
        assert!(!done.parity_error);
        let got = done
            .requests
            .into_iter()
            .flat_map(|r| r.into_buffer())
            .collect::<Vec<_>>();
        assert_eq!(got, data);
        assert!(bus.max_outstanding() <= 4);
    }

    #[test]
    fn parity_sticky_per_session() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataOut, 3);
        bus.queue_initiator_bytes(&pattern(32, 0));
        bus.corrupt_parity(3);
        accel.start_read(&mut bus, vec![0; 16], &reset);
        accel.start_read(&mut bus, vec![0; 16], &reset);
        let done = accel.finish_read(&mut bus, &reset);
        assert!(done.parity_error);
        assert!(done.requests[0].parity_error());
        assert!(!done.requests[1].parity_error());

        bus.queue_initiator_bytes(&pattern(16, 0));
        accel.start_read(&mut bus, vec![0; 16], &reset);
        assert!(!accel.finish_read(&mut bus, &reset).parity_error);
    }

    #[test]
    fn parity_check_disabled() {
        let (mut bus, _, reset) = setup(BusPhase::DataOut, 3);
        let mut accel = Accel::new(
            PioEngine::new(false),
            TimingConfig {
                clk_hz: CLK,
                async_grade: SpeedGrade::Async50,
                preset: None,
            },
        );
        bus.queue_initiator_bytes(&pattern(8, 0));
        bus.corrupt_parity(0);
        accel.start_read(&mut bus, vec![0; 8], &reset);
        assert!(!accel.finish_read(&mut bus, &reset).parity_error);
    }

    #[test]
    fn mode_change_refused_while_busy() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 2);
        accel.start_write(&mut bus, pattern(8, 0), &reset);
        assert_eq!(
            accel.set_sync_mode(8, 25),
            Err(AccelError::Busy(AccelState::Write))
        );
        accel.finish_write(&mut bus, &reset);
        assert!(accel.set_sync_mode(8, 25).is_ok());
        assert_eq!(accel.sync_mode().offset, 8);
        assert!(accel.set_sync_mode(0, 25).is_ok());
        assert_eq!(accel.sync_mode(), SyncAgreement::ASYNC);
    }

    #[test]
    fn reset_aborts_write() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 4);
        bus.schedule_reset(2000);
        let id = accel.start_write(&mut bus, pattern(512, 0), &reset);

        let done = accel.finish_write(&mut bus, &reset);
        assert!(reset.is_set());
        assert_eq!(done.len(), 1);
        assert!(done[0].is_aborted());
        assert!(bus.received().len() < 512);
        // Bounded by a handshake step, independent of the bytes left
        assert!(bus.cycles() < 2000 + 100);
        assert!(accel.is_write_finished(&mut bus, &reset, Some(id)));
        assert!(accel.is_write_finished(&mut bus, &reset, None));
        assert_eq!(accel.state(), AccelState::Idle);
        assert!(!bus.lines().req());
    }

    #[test]
    fn reset_aborts_sync_read() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataOut, 20);
        accel.set_sync_mode(8, 25).unwrap();
        bus.set_sync_offset(8);
        bus.queue_initiator_bytes(&pattern(4096, 0));
        bus.schedule_reset(2000);
        let id = accel.start_read(&mut bus, vec![0; 4096], &reset);

        let done = accel.finish_read(&mut bus, &reset);
        assert!(reset.is_set());
        assert_eq!(done.requests.len(), 1);
        assert!(done.requests[0].is_aborted());
        assert!(done.requests[0].transferred() < 4096);
        assert!(bus.cycles() < 2000 + 100);
        assert!(accel.is_read_finished(&mut bus, &reset, Some(id)));
        assert_eq!(accel.state(), AccelState::Idle);
        assert!(!bus.lines().req());
    }

    #[test]
    fn sync_read_parity() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataOut, 30);
        accel.set_sync_mode(4, 50).unwrap();
        bus.set_sync_offset(4);
        bus.queue_initiator_bytes(&pattern(48, 0));
        bus.corrupt_parity(20);
        accel.start_read(&mut bus, vec![0; 16], &reset);
        accel.start_read(&mut bus, vec![0; 32], &reset);

        let done = accel.finish_read(&mut bus, &reset);
        assert!(done.parity_error);
        assert!(!done.requests[0].parity_error());
        assert!(done.requests[1].parity_error());
        assert!(done.requests.iter().all(|r| !r.is_aborted()));
    }

    #[test]
    fn reset_before_start() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 4);
        reset.signal();
        accel.start_write(&mut bus, pattern(512, 0), &reset);
        let done = accel.finish_write(&mut bus, &reset);
        assert!(done[0].is_aborted());
        assert!(bus.received().is_empty());
    }

    #[test]
    fn reset_during_backpressure() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 4);
        bus.set_stalled(true);
        accel.start_write(&mut bus, pattern(8, 0), &reset);
        accel.start_write(&mut bus, pattern(8, 1), &reset);
        bus.schedule_reset(bus.cycles() + 500);
        // Queue full, waits for a slot until the reset
        accel.start_write(&mut bus, pattern(8, 2), &reset);
        assert_eq!(accel.state(), AccelState::Idle);
        let done = accel.finish_write(&mut bus, &reset);
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|r| r.is_aborted()));
    }

    #[test]
    fn watchdog() {
        let (mut bus, accel, reset) = setup(BusPhase::DataIn, 4);
        let mut accel = accel.with_timeout(Some(10_000));
        bus.set_stalled(true);
        accel.start_write(&mut bus, pattern(64, 0), &reset);
        let start = bus.cycles();
        let done = accel.finish_write(&mut bus, &reset);
        assert!(reset.is_set());
        assert!(done[0].is_aborted());
        assert!(bus.cycles() >= start + 10_000);
    }

    #[test]
    fn reset_from_other_thread() {
        let (mut bus, mut accel, reset) = setup(BusPhase::DataIn, 4);
        bus.set_stalled(true);
        accel.start_write(&mut bus, pattern(512, 0), &reset);

        let remote = reset.clone();
        let irq = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.signal();
        });
        let done = accel.finish_write(&mut bus, &reset);
        irq.join().unwrap();
        assert!(done[0].is_aborted());
        assert_eq!(accel.state(), AccelState::Idle);
    }
}
