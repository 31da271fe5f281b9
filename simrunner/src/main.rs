//! Runs a complete simulated bus session against the PHY core: selection,
//! sync negotiation, a READ command with its DATA IN phase, status and
//! command complete.

mod report;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use itertools::Itertools;
use log::*;
use strum::IntoEnumIterator;

use scsiphy_core::config::PhyConfig;
use scsiphy_core::phy::simbus::SimBus;
use scsiphy_core::phy::ScsiPhy;
use scsiphy_core::scsi::accel::PioEngine;
use scsiphy_core::scsi::negotiation::{ExtendedMessage, SyncAgreement, EXTENDED_MESSAGE};
use scsiphy_core::scsi::phase::PhaseEngine;
use scsiphy_core::scsi::timing::SpeedGrade;
use scsiphy_core::scsi::BusPhase;
use scsiphy_core::tickable::Ticks;

use crate::report::SessionReport;

const BLOCK_SIZE: usize = 512;
const MSG_COMMAND_COMPLETE: u8 = 0x00;
const MSG_REJECT: u8 = 0x07;
const MSG_IDENTIFY: u8 = 0x80;
const STATUS_GOOD: u8 = 0x00;
const CMD_READ_10: u8 = 0x28;

type Engine = PhaseEngine<SimBus, PioEngine>;

#[derive(Parser)]
struct Args {
    /// Settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transfer period proposed by the initiator (units of 4 ns), 0 for async
    #[arg(long, default_value_t = 25)]
    period: u8,

    /// Synchronous offset proposed by the initiator
    #[arg(long, default_value_t = 8)]
    offset: u8,

    /// Number of 512 byte blocks read
    #[arg(long, default_value_t = 8)]
    blocks: usize,

    /// Initiator ACK latency in controller cycles
    #[arg(long, default_value_t = 20)]
    latency: Ticks,

    /// Initiator resets the bus at this cycle
    #[arg(long)]
    reset_at: Option<Ticks>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Print the effective settings and exit
    #[arg(long)]
    dump_config: bool,

    /// List speed grades and exit
    #[arg(long)]
    list_grades: bool,
}

fn block_pattern(lba: usize) -> impl Iterator<Item = u8> {
    (0..BLOCK_SIZE).map(move |i| (i ^ (lba * 37)) as u8)
}

/// Ends the session if the bus was reset
macro_rules! check_reset {
    ($engine:expr, $report:expr) => {
        if $engine.is_reset() {
            warn!("Bus reset in phase {}", $engine.phase());
            $report.reset = true;
            $engine.handle_reset();
            $report.total_cycles = $engine.phy().cycles();
            return Ok($report);
        }
    };
}

/// MESSAGE OUT with IDENTIFY and optionally SDTR, answered in MESSAGE IN.
/// Returns the agreement the initiator received. A bus reset ends the
/// exchange early with an async agreement, the caller checks for it.
fn message_out(engine: &mut Engine, period: u8, offset: u8) -> Result<SyncAgreement> {
    let sdtr = period > 0 && offset > 0;
    engine.phy_mut().queue_initiator_bytes(&[MSG_IDENTIFY]);
    if sdtr {
        let proposal = ExtendedMessage::Sync(SyncAgreement { period, offset });
        engine.phy_mut().queue_initiator_bytes(&proposal.encode());
    }

    engine.enter_phase(BusPhase::MessageOut);
    let identify = engine.read_byte();
    if engine.is_reset() {
        return Ok(SyncAgreement::ASYNC);
    }
    if identify & MSG_IDENTIFY == 0 {
        bail!("Expected IDENTIFY, got {:02X}", identify);
    }
    if !sdtr {
        return Ok(SyncAgreement::ASYNC);
    }

    let ext = engine.read_byte();
    let len = engine.read_byte();
    let mut body = vec![len];
    body.extend((0..len).map(|_| engine.read_byte()));
    if engine.is_reset() {
        return Ok(SyncAgreement::ASYNC);
    }
    if ext != EXTENDED_MESSAGE {
        bail!("Expected extended message, got {:02X}", ext);
    }
    debug!("Extended message: {:02X}", body.iter().format(" "));

    engine.enter_phase(BusPhase::MessageIn);
    match engine.handle_extended_message(&body) {
        Some(reply) => engine.write(reply.encode().to_vec()),
        None => engine.write_byte(MSG_REJECT),
    }

    // Initiator side of the exchange
    let reply = engine.phy_mut().take_received();
    if engine.is_reset() {
        return Ok(SyncAgreement::ASYNC);
    }
    match reply.split_first() {
        Some((&EXTENDED_MESSAGE, body)) => match ExtendedMessage::parse(body) {
            Some(ExtendedMessage::Sync(agreement)) => Ok(agreement),
            other => bail!("Unexpected SDTR reply {:?}", other),
        },
        _ => Ok(SyncAgreement::ASYNC),
    }
}

fn run_session(engine: &mut Engine, config: &PhyConfig, args: &Args) -> Result<SessionReport> {
    let target_id = config.target_ids.first().copied().unwrap_or_default();
    let mut report = SessionReport {
        target_id,
        bytes_expected: args.blocks * BLOCK_SIZE,
        ..Default::default()
    };

    // Selection
    engine.phy_mut().begin_selection(target_id, true);
    if engine.check_selection().is_none() {
        check_reset!(engine, report);
        bail!("Target {} did not respond to selection", target_id);
    }

    let agreement = message_out(engine, args.period, args.offset)?;
    check_reset!(engine, report);
    info!(
        "Agreement: period {} offset {}",
        agreement.period, agreement.offset
    );
    engine.phy_mut().set_sync_offset(agreement.offset);
    report.agreement = engine.agreement(target_id);
    report.rate_estimate_kbs = report.agreement.rate_kbs();

    // READ(10) from LBA 0
    let blocks = u16::try_from(args.blocks)?;
    let mut cdb = [CMD_READ_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    engine.phy_mut().queue_initiator_bytes(&cdb);
    engine.enter_phase(BusPhase::Command);
    let received_cdb = (0..cdb.len()).map(|_| engine.read_byte()).collect_vec();
    check_reset!(engine, report);
    debug!("CDB: {:02X}", received_cdb.iter().format(" "));
    if received_cdb != cdb {
        bail!("CDB mismatch");
    }
    if engine.take_parity_error() {
        warn!("Parity error in command phase");
    }

    // DATA IN, one request per block
    let expected = (0..args.blocks).flat_map(block_pattern).collect_vec();
    engine.enter_phase(BusPhase::DataIn);
    let start = engine.phy().cycles();
    for lba in 0..args.blocks {
        engine.start_write(block_pattern(lba).collect());
    }
    let done = engine.finish_write();
    report.data_cycles = engine.phy().cycles() - start;
    report.aborted_requests = done.iter().filter(|r| r.is_aborted()).count();
    report.max_outstanding = engine.phy().max_outstanding();
    report.parity_errors = engine.phy().parity_errors();

    let received = engine.phy_mut().take_received();
    report.bytes_received = received.len();
    report.data_ok = received == expected;
    if report.data_cycles > 0 {
        let secs = report.data_cycles as f64 / f64::from(config.clk_hz);
        report.throughput_kbs = (received.len() as f64 / secs / 1000.0) as u64;
    }
    check_reset!(engine, report);

    engine.enter_phase(BusPhase::Status);
    engine.write_byte(STATUS_GOOD);
    engine.enter_phase(BusPhase::MessageIn);
    engine.write_byte(MSG_COMMAND_COMPLETE);
    check_reset!(engine, report);
    engine.enter_bus_free();

    let trailer = engine.phy_mut().take_received();
    if trailer != [STATUS_GOOD, MSG_COMMAND_COMPLETE] {
        warn!("Unexpected status/message bytes {:02X?}", trailer);
    }
    report.total_cycles = engine.phy().cycles();
    Ok(report)
}

fn build_engine(config: &PhyConfig, args: &Args) -> Result<Engine> {
    let bus = SimBus::new(config.clk_hz).with_ack_latency(args.latency);
    let mut engine = Engine::new(bus, PioEngine::new(config.parity), config)?;
    let reset = engine.reset_flag();
    engine.phy_mut().attach_reset_irq(reset);
    if let Some(at) = args.reset_at {
        engine.phy_mut().schedule_reset(at);
    }
    Ok(engine)
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    if args.list_grades {
        for grade in SpeedGrade::iter() {
            println!(
                "{:<10} {:>6} kB/s{}",
                grade.to_string(),
                grade.nominal_kbs(),
                grade
                    .min_period()
                    .map(|p| format!(", period >= {}", p))
                    .unwrap_or_default()
            );
        }
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => PhyConfig::load(path)?,
        None => PhyConfig::default(),
    };
    if args.dump_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }
    if args.blocks == 0 {
        bail!("Need at least one block");
    }

    let mut engine = build_engine(&config, &args)?;
    let report = run_session(&mut engine, &config, &args)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if !report.reset && !report.data_ok {
        bail!("Data mismatch");
    }
    Ok(())
}
