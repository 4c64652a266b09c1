/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! The data-plane loop.
//!
//! `GenerationManager::step` is called in a tight loop by the thread
//! pinned to the data-plane CPU. Each iteration: drain the control ring,
//! pull and discard whatever the NIC received, check the run window,
//! fire every due scheduler slot, and flush whatever that produced. Every
//! step is non-blocking; there is never a reason for this loop to wait.
//!
//! `generators` (the flow arenas) and `ctx` (pool, scheduler, tx batch,
//! stats, report writer) are separate fields rather than one combined
//! struct specifically so `process_due` can hold a generator and its
//! `GenOps` context as two independent mutable borrows — resolving the
//! event payload down to a plain `(generator_id, flow_id)` pair instead of
//! a pointer back into the arena.

use std::rc::Rc;

use crate::config::validate_generation_config;
use crate::cycles::{current_cycles, cycles_per_second};
use crate::error::{EngineError, Result};
use crate::flow::{CaptureTemplate, FlowBuildConfig, FlowsGenerator, GenOps, GenerationReport};
use crate::messages::{
    ControlMessage, DataMessage, FlowRollup, GenerationConfig, StartGenerationOutcome, SummaryStats,
};
use crate::nic::NicAdapter;
use crate::pool::{Buffer, BufferPool};
use crate::report::ReportWriter;
use crate::ring;
use crate::scheduler::{EventHandle, EventScheduler};

/// Packets pulled from the NIC per `step`; receive traffic is not part of
/// this generator's job, so these are only counted and freed.
const RX_BURST_SIZE: usize = 32;

/// Outbound packets batched before a `tx_burst` call.
const TX_BATCH_SIZE: usize = 64;

/// Everything a running flow needs from the manager, minus the arena of
/// flows itself. Implements `GenOps` so `FlowsGenerator` methods can be
/// called without ever seeing a whole `GenerationManager`.
struct ManagerOps {
    pool: BufferPool,
    scheduler: EventScheduler<(u32, u32)>,
    tx_batch: Vec<Buffer>,
    stats: SummaryStats,
    report_writer: Option<ReportWriter>,
}

impl GenOps for ManagerOps {
    fn alloc_buffer(&mut self) -> Option<Buffer> {
        let buf = self.pool.alloc();
        if buf.is_none() {
            self.stats.cnt_tx_pkts_nombuf += 1;
        }
        buf
    }

    fn copy_buffer(&mut self, src: &Buffer) -> Option<Buffer> {
        let buf = self.pool.copy(src);
        if buf.is_none() {
            self.stats.cnt_tx_pkts_nombuf += 1;
        }
        buf
    }

    fn send_packet(&mut self, buf: Buffer) {
        self.tx_batch.push(buf);
    }

    fn create_event_slot(&mut self, due_cycles: u64, key: (u32, u32)) -> EventHandle {
        self.scheduler.schedule(due_cycles, key)
    }

    fn cancel_event_slot(&mut self, handle: EventHandle) {
        self.scheduler.cancel(handle);
    }

    fn record_report(&mut self, report: GenerationReport) {
        if let Some(writer) = self.report_writer.as_mut() {
            let _ = writer.append(&report);
        }
    }
}

/// Owns the NIC, the buffer pool, every active flow generator, and the two
/// SPSC rings connecting this CPU to the control plane.
pub struct GenerationManager<N: NicAdapter> {
    nic: N,
    ctx: ManagerOps,
    generators: Vec<FlowsGenerator>,
    control_rx: ring::Consumer<ControlMessage>,
    data_tx: ring::Producer<DataMessage>,
    run_until_cycles: Option<u64>,
}

impl<N: NicAdapter> GenerationManager<N> {
    pub fn new(
        nic: N,
        pool: BufferPool,
        control_rx: ring::Consumer<ControlMessage>,
        data_tx: ring::Producer<DataMessage>,
    ) -> GenerationManager<N> {
        GenerationManager {
            nic,
            ctx: ManagerOps {
                pool,
                scheduler: EventScheduler::new(),
                tx_batch: Vec::with_capacity(TX_BATCH_SIZE),
                stats: SummaryStats::default(),
                report_writer: None,
            },
            generators: Vec::new(),
            control_rx,
            data_tx,
            run_until_cycles: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_until_cycles.is_some()
    }

    pub fn stats(&self) -> &SummaryStats {
        &self.ctx.stats
    }

    /// One iteration of the data-plane loop. Never blocks.
    pub fn step(&mut self) {
        for msg in self.control_rx.drain() {
            self.handle_control_message(msg);
        }

        let received = self.nic.rx_burst(&self.ctx.pool, RX_BURST_SIZE);
        self.ctx.stats.cnt_rx_pkts += received.len() as u64;
        self.ctx.stats.cnt_rx_bytes += received.iter().map(|b| b.total_len() as u64).sum::<u64>();
        drop(received);

        if let Some(until) = self.run_until_cycles {
            if current_cycles() >= until {
                self.stop_generation();
            }
        }

        self.process_due();
        self.flush_tx();
    }

    fn process_due(&mut self) {
        let mut scheduler = std::mem::take(&mut self.ctx.scheduler);
        scheduler.process_due(|_, &(generator_id, flow_id)| {
            self.generators[generator_id as usize].fire(&mut self.ctx, flow_id)
        });
        self.ctx.scheduler = scheduler;
    }

    fn flush_tx(&mut self) {
        if self.ctx.tx_batch.len() < TX_BATCH_SIZE && self.run_until_cycles.is_some() {
            return;
        }
        self.force_flush_tx();
    }

    fn force_flush_tx(&mut self) {
        if self.ctx.tx_batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.ctx.tx_batch);
        let total_bytes: u64 = batch.iter().map(|b| b.total_len() as u64).sum();
        let submitted = batch.len();
        let sent = self.nic.tx_burst(batch);
        self.ctx.stats.cnt_tx_pkts += sent as u64;
        self.ctx.stats.cnt_tx_bytes += total_bytes;
        self.ctx.stats.cnt_tx_pkts_qfull += (submitted - sent) as u64;
    }

    fn handle_control_message(&mut self, msg: ControlMessage) {
        let response = match msg {
            ControlMessage::StartGeneration(cfg) => {
                DataMessage::StartGenerationResult(self.start_generation(cfg))
            }
            ControlMessage::StopGeneration => {
                let (stats, detailed) = self.stop_generation();
                DataMessage::StopGenerationResult(stats, detailed)
            }
            ControlMessage::StatsRequest => DataMessage::StatsReport(self.ctx.stats.clone()),
        };
        if self.data_tx.push(response).is_err() {
            log::warn!("control response dropped: data ring full");
        }
    }

    /// Validates and starts one generation run. Returns `AlreadyStarted`
    /// without touching any existing run if one is already in progress,
    /// `Invalid` if the request fails validation or flow construction, or
    /// `Started` once every capture's flows are built and armed.
    fn start_generation(&mut self, cfg: GenerationConfig) -> StartGenerationOutcome {
        if self.is_running() {
            return StartGenerationOutcome::AlreadyStarted;
        }
        if let Err(e) = validate_generation_config(&cfg) {
            return StartGenerationOutcome::Invalid(e.to_string());
        }
        match self.build_generators(cfg) {
            Ok(()) => StartGenerationOutcome::Started,
            Err(e) => StartGenerationOutcome::Invalid(e.to_string()),
        }
    }

    fn build_generators(&mut self, cfg: GenerationConfig) -> Result<()> {
        self.generators.clear();
        self.ctx.report_writer = match &cfg.report_path {
            Some(path) => Some(ReportWriter::create(path)?),
            None => None,
        };

        let dut_mac: crate::packet::MacAddr = cfg
            .dut_mac
            .parse()
            .map_err(|_| EngineError::InvalidConfig(format!("invalid dut_ether_addr {:?}", cfg.dut_mac)))?;

        let mut total_flows = 0u64;
        for capture in &cfg.captures {
            let template = Rc::new(CaptureTemplate::load(
                &capture.pcap_path,
                capture.inter_pkts_gap_usecs,
            )?);
            let generator_id = self.generators.len() as u32;
            let mut generator = FlowsGenerator::new(generator_id, template.clone());

            let build_cfg = FlowBuildConfig {
                client_cidr: capture
                    .client_cidr
                    .parse()
                    .map_err(|_| EngineError::InvalidConfig(format!("invalid client_cidr {:?}", capture.client_cidr)))?,
                server_cidr: capture
                    .server_cidr
                    .parse()
                    .map_err(|_| EngineError::InvalidConfig(format!("invalid server_cidr {:?}", capture.server_cidr)))?,
                client_mac: template.client_mac(),
                server_mac: dut_mac,
                client_port: capture.client_port,
                burst: capture.burst,
                flows_per_sec: cfg.flows_per_sec,
                start_cycles: current_cycles(),
                offload: self.nic.checksum_offload(),
            };

            total_flows += generator.build_flows(&mut self.ctx, &build_cfg)? as u64;
            self.generators.push(generator);
        }

        log::info!("generation started: {total_flows} flows across {} captures", self.generators.len());
        self.run_until_cycles = Some(current_cycles() + cycles_per_second() * cfg.duration_secs as u64);
        Ok(())
    }

    /// Tears down the current run and returns the summary counters plus the
    /// per-flow detailed rollup, read from live flow state before the
    /// generators are dropped. Cascades: events deregister, templates
    /// return to the pool.
    fn stop_generation(&mut self) -> (SummaryStats, Vec<FlowRollup>) {
        let detailed: Vec<FlowRollup> = self.generators.iter().flat_map(|g| g.rollups()).collect();

        for generator in &mut self.generators {
            generator.cancel_all(&mut self.ctx);
        }
        assert_eq!(
            self.ctx.scheduler.live_event_count(),
            0,
            "scheduler must hold no armed events after every generator's flows are cancelled"
        );
        self.generators.clear();

        self.run_until_cycles = None;
        self.force_flush_tx();
        if let Some(writer) = self.ctx.report_writer.as_mut() {
            let _ = writer.flush();
        }

        (self.ctx.stats.clone(), detailed)
    }
}
