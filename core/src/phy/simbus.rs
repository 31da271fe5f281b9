//! Deterministic simulated SCSI bus with a scripted initiator on the other end

use std::collections::VecDeque;

use crate::phy::{ControlLines, ScsiPhy, Signal};
use crate::scsi::BusPhase;
use crate::scsi::parity::{parity_ok, with_parity};
use crate::scsi::reset::ResetFlag;
use crate::scsi::timing::ns_to_cycles;
use crate::tickable::{Tickable, Ticks};
use crate::types::DataBus;

/// Length of a bus reset asserted by the initiator
const RST_PULSE_NS: u32 = 25_000;

/// SCSI ID the simulated initiator selects from
pub const INITIATOR_ID: u8 = 7;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub cycle: Ticks,
    /// Lines driven by the device under test
    pub lines: ControlLines,
}

/// Simulated bus. The device under test drives it through [`ScsiPhy`], the
/// initiator side is scripted: it answers REQ with ACK after a fixed latency,
/// supplies queued bytes in DATA OUT style phases and collects bytes in
/// DATA IN style phases. Time only advances through reads and delays.
pub struct SimBus {
    clk_hz: u32,
    cycles: Ticks,

    /// Driven by the device under test
    out: ControlLines,
    data_out: Option<DataBus>,
    phase_driven: bool,

    /// Driven by the initiator
    peer: ControlLines,
    peer_data: Option<DataBus>,

    ack_latency: Ticks,
    stalled: bool,
    sync_offset: u8,

    req_edge: Ticks,
    req_fall: Ticks,
    bsy_edge: Option<Ticks>,
    rst_until: Ticks,

    /// Sync REQ pulses not acknowledged yet, with the data at the REQ edge
    pending: VecDeque<(Ticks, DataBus)>,
    max_outstanding: usize,
    ack_edges: u32,
    latched: VecDeque<DataBus>,

    to_send: VecDeque<u8>,
    sent: usize,
    corrupt_at: Option<usize>,
    received: Vec<u8>,
    parity_errors: usize,

    reset_at: Option<Ticks>,
    reset_irq: Option<ResetFlag>,

    trace: Vec<TraceEntry>,
    trace_enabled: bool,
}

impl SimBus {
    pub fn new(clk_hz: u32) -> Self {
        Self {
            clk_hz,
            cycles: 0,
            out: ControlLines(0),
            data_out: None,
            phase_driven: false,
            peer: ControlLines(0),
            peer_data: None,
            ack_latency: 4,
            stalled: false,
            sync_offset: 0,
            req_edge: 0,
            req_fall: 0,
            bsy_edge: None,
            rst_until: 0,
            pending: VecDeque::new(),
            max_outstanding: 0,
            ack_edges: 0,
            latched: VecDeque::new(),
            to_send: VecDeque::new(),
            sent: 0,
            corrupt_at: None,
            received: vec![],
            parity_errors: 0,
            reset_at: None,
            reset_irq: None,
            trace: vec![],
            trace_enabled: false,
        }
    }

    /// Cycles between a REQ edge and the initiator's ACK
    pub fn with_ack_latency(self, ack_latency: Ticks) -> Self {
        Self {
            ack_latency,
            ..self
        }
    }

    /// Offset the initiator agreed to; DATA phases run synchronously if set
    pub fn set_sync_offset(&mut self, offset: u8) {
        self.sync_offset = offset;
    }

    /// Initiator stops responding to REQ
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// Bytes the initiator sends in initiator -> target phases
    pub fn queue_initiator_bytes(&mut self, bytes: &[u8]) {
        self.to_send.extend(bytes);
    }

    /// Sends the n-th queued byte (counting from the start) with bad parity
    pub fn corrupt_parity(&mut self, nth: usize) {
        self.corrupt_at = Some(nth);
    }

    /// Bytes received by the initiator so far
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    /// Bytes received by the initiator with bad parity
    pub fn parity_errors(&self) -> usize {
        self.parity_errors
    }

    /// Highest number of sync REQ pulses seen outstanding at once
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Starts selection of `target_id`. The initiator releases SEL once the
    /// target responds with BSY.
    pub fn begin_selection(&mut self, target_id: u8, atn: bool) {
        self.peer.set_sel(true);
        self.peer.set_bsy(false);
        self.peer.set_atn(atn);
        self.peer_data = Some(DataBus((1 << target_id) | (1 << INITIATOR_ID)));
        self.bsy_edge = None;
    }

    pub fn set_atn(&mut self, atn: bool) {
        self.peer.set_atn(atn);
    }

    /// Initiator pulls RST at the given cycle and raises the attached
    /// reset flag, as the RST interrupt would.
    pub fn schedule_reset(&mut self, at: Ticks) {
        self.reset_at = Some(at);
    }

    pub fn attach_reset_irq(&mut self, flag: ResetFlag) {
        self.reset_irq = Some(flag);
    }

    /// Asserts RST for `cycles` from now, without raising the interrupt
    pub fn pulse_rst(&mut self, cycles: Ticks) {
        self.peer.set_rst(true);
        self.rst_until = self.cycles + cycles;
    }

    /// Lines driven by the device under test
    pub fn lines(&self) -> ControlLines {
        self.out
    }

    pub fn data_driven(&self) -> bool {
        self.data_out.is_some()
    }

    /// Phase announced by the device under test, if any
    pub fn phase(&self) -> Option<BusPhase> {
        if self.phase_driven {
            BusPhase::from_code(self.out.phase_code())
        } else {
            None
        }
    }

    pub fn reset_trace(&mut self) {
        self.trace.clear();
        self.trace_enabled = true;
    }

    pub fn get_trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    fn record(&mut self) {
        if self.trace_enabled {
            self.trace.push(TraceEntry {
                cycle: self.cycles,
                lines: self.out,
            });
        }
    }

    fn sync_active(&self) -> bool {
        self.sync_offset > 0 && self.phase().is_some_and(BusPhase::is_data)
    }

    fn next_send(&mut self) -> Option<DataBus> {
        let byte = self.to_send.pop_front()?;
        let mut bus = with_parity(byte);
        if self.corrupt_at == Some(self.sent) {
            bus.set_parity(!bus.parity());
        }
        self.sent += 1;
        Some(bus)
    }

    fn receive(&mut self, bus: DataBus) {
        if !parity_ok(bus) {
            self.parity_errors += 1;
        }
        self.received.push(bus.data());
    }

    /// Nothing can happen until the device under test acts
    fn quiet(&self) -> bool {
        self.reset_at.is_none()
            && !self.peer.rst()
            && !self.out.req()
            && !self.peer.ack()
            && self.pending.is_empty()
            && !(self.peer.sel() && self.out.bsy())
    }

    fn advance(&mut self, ticks: Ticks) {
        let end = self.cycles + ticks;
        while self.cycles < end {
            if self.quiet() {
                self.cycles = end;
                break;
            }
            self.cycles += 1;
            self.step();
        }
    }

    fn step(&mut self) {
        if self.reset_at.is_some_and(|at| self.cycles >= at) {
            self.reset_at = None;
            self.pulse_rst(u64::from(ns_to_cycles(RST_PULSE_NS, self.clk_hz)));
            if let Some(irq) = &self.reset_irq {
                irq.signal();
            }
        }
        if self.peer.rst() {
            // Everyone lets go during reset
            self.peer = ControlLines(0).with_rst(self.cycles < self.rst_until);
            self.peer_data = None;
            self.pending.clear();
            return;
        }
        if self.stalled {
            return;
        }

        if self.peer.sel() && self.out.bsy() {
            let edge = *self.bsy_edge.get_or_insert(self.cycles);
            if self.cycles >= edge + self.ack_latency {
                self.peer.set_sel(false);
                self.peer_data = None;
            }
        }

        if self.sync_active() {
            while let Some(&(edge, bus)) = self.pending.front() {
                if edge + self.ack_latency > self.cycles {
                    break;
                }
                if self.out.io() {
                    self.receive(bus);
                } else {
                    let Some(bus) = self.next_send() else {
                        break;
                    };
                    self.latched.push_back(bus);
                }
                self.pending.pop_front();
                self.ack_edges += 1;
            }
            return;
        }

        if !self.peer.ack() && self.out.req() && self.cycles >= self.req_edge + self.ack_latency {
            if self.out.io() {
                let bus = self.data_out.unwrap_or_default();
                self.receive(bus);
            } else {
                let Some(bus) = self.next_send() else {
                    return;
                };
                self.peer_data = Some(bus);
            }
            self.peer.set_ack(true);
            self.ack_edges += 1;
        } else if self.peer.ack()
            && !self.out.req()
            && self.cycles >= self.req_fall + self.ack_latency
        {
            self.peer.set_ack(false);
        }
    }
}

impl ScsiPhy for SimBus {
    fn clk_hz(&self) -> u32 {
        self.clk_hz
    }

    fn cycles(&self) -> Ticks {
        self.cycles
    }

    fn delay_cycles(&mut self, cycles: u32) {
        self.advance(cycles.into());
    }

    fn assert(&mut self, signal: Signal) {
        if self.out.signal(signal) {
            return;
        }
        self.out.set_signal(signal, true);
        match signal {
            Signal::Req if self.sync_active() => {
                let bus = self.data_out.unwrap_or_default();
                self.pending.push_back((self.cycles, bus));
                self.max_outstanding = self.max_outstanding.max(self.pending.len());
            }
            Signal::Req => self.req_edge = self.cycles,
            _ => (),
        }
        self.record();
    }

    fn deassert(&mut self, signal: Signal) {
        if !self.out.signal(signal) {
            return;
        }
        self.out.set_signal(signal, false);
        if signal == Signal::Req {
            self.req_fall = self.cycles;
        }
        self.record();
    }

    fn read(&mut self, signal: Signal) -> bool {
        self.advance(1);
        ControlLines(self.out.0 | self.peer.0).signal(signal)
    }

    fn drive_phase(&mut self, code: u8) {
        self.out.set_phase_code(code);
        self.phase_driven = true;
        self.record();
    }

    fn drive_data(&mut self, bus: DataBus) {
        self.data_out = Some(bus);
    }

    fn read_data(&mut self) -> DataBus {
        self.advance(1);
        self.data_out.or(self.peer_data).unwrap_or_default()
    }

    fn release_data_req(&mut self) {
        self.data_out = None;
        self.deassert(Signal::Req);
    }

    fn release_all(&mut self) {
        if self.out.req() {
            self.req_fall = self.cycles;
        }
        self.out = ControlLines(0);
        self.data_out = None;
        self.phase_driven = false;
        self.record();
    }

    fn take_ack_edges(&mut self) -> u32 {
        std::mem::take(&mut self.ack_edges)
    }

    fn take_latched(&mut self) -> Option<DataBus> {
        self.latched.pop_front()
    }
}

impl Tickable for SimBus {
    fn tick(&mut self, ticks: Ticks) -> Ticks {
        self.advance(ticks);
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> SimBus {
        SimBus::new(150_000_000).with_ack_latency(3)
    }

    #[test]
    fn async_receive() {
        let mut b = bus();
        b.assert(Signal::Bsy);
        b.drive_phase(BusPhase::DataIn.code().unwrap());
        b.drive_data(with_parity(0xA5));
        b.assert(Signal::Req);
        while !b.read(Signal::Ack) {}
        b.release_data_req();
        while b.read(Signal::Ack) {}
        assert_eq!(b.received(), &[0xA5]);
        assert_eq!(b.parity_errors(), 0);
    }

    #[test]
    fn async_send() {
        let mut b = bus();
        b.queue_initiator_bytes(&[0x12]);
        b.drive_phase(BusPhase::DataOut.code().unwrap());
        b.assert(Signal::Req);
        while !b.read(Signal::Ack) {}
        assert_eq!(b.read_data().data(), 0x12);
        b.deassert(Signal::Req);
        while b.read(Signal::Ack) {}
        assert!(b.received().is_empty());
    }

    #[test]
    fn no_data_no_ack() {
        let mut b = bus();
        b.drive_phase(BusPhase::DataOut.code().unwrap());
        b.assert(Signal::Req);
        b.tick(1000);
        assert!(!b.read(Signal::Ack));
    }

    #[test]
    fn stalled() {
        let mut b = bus();
        b.set_stalled(true);
        b.drive_phase(BusPhase::DataIn.code().unwrap());
        b.assert(Signal::Req);
        b.tick(1000);
        assert!(!b.read(Signal::Ack));
    }

    #[test]
    fn sync_pulses() {
        let mut b = bus();
        b.set_sync_offset(4);
        b.drive_phase(BusPhase::DataIn.code().unwrap());
        for i in 0..3 {
            b.drive_data(with_parity(i));
            b.assert(Signal::Req);
            b.deassert(Signal::Req);
        }
        assert_eq!(b.max_outstanding(), 3);
        b.tick(10);
        assert_eq!(b.take_ack_edges(), 3);
        assert_eq!(b.take_ack_edges(), 0);
        assert_eq!(b.received(), &[0, 1, 2]);
    }

    #[test]
    fn selection() {
        let mut b = bus();
        b.begin_selection(3, true);
        assert!(b.read(Signal::Sel));
        assert!(!b.read(Signal::Bsy));
        assert_eq!(b.read_data().data(), 0x88);
        b.assert(Signal::Bsy);
        b.tick(10);
        assert!(!b.read(Signal::Sel));
        assert!(b.read(Signal::Atn));
    }

    #[test]
    fn scheduled_reset() {
        let mut b = bus();
        let flag = ResetFlag::new();
        b.attach_reset_irq(flag.clone());
        b.schedule_reset(100);
        b.tick(99);
        assert!(!flag.is_set());
        b.tick(2);
        assert!(flag.is_set());
        assert!(b.read(Signal::Rst));
        b.tick(ns_to_cycles(RST_PULSE_NS, 150_000_000).into());
        assert!(!b.read(Signal::Rst));
    }

    #[test]
    fn trace() {
        let mut b = bus();
        b.reset_trace();
        b.drive_phase(BusPhase::Status.code().unwrap());
        b.release_all();
        let t = b.get_trace();
        assert_eq!(t.len(), 2);
        assert_eq!(BusPhase::from_code(t[0].lines.phase_code()), Some(BusPhase::Status));
        assert_eq!(t[1].lines, ControlLines(0));
    }
}
