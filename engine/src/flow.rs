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

//! Flow construction and steady-state replay.
//!
//! A [`CaptureTemplate`] is a capture loaded once and shared (via `Rc`)
//! across every flow built from it. `FlowsGenerator` rewrites it into a
//! `canonical` buffer per template packet (MAC addresses and, if
//! configured, the client-side port), shared by every flow the generator
//! owns; client/server IP addresses and checksums are filled in fresh at
//! every send since a flow's address pair changes as the CIDR ranges
//! advance.
//!
//! The flow arena is never resized once built: exactly `flows_per_sec`
//! flows exist, and each one continuously replays its template forever,
//! wrapping back to the first packet (and a new IP pair, every `burst`
//! wraps) until the run is stopped. Flows live in a flat arena
//! (`FlowsGenerator::flows`) and are addressed by their stable index. The
//! scheduler never holds a pointer back into this arena: its event payload
//! is a plain `(generator_id, flow_id)` pair that the manager resolves back
//! through the owning generator at fire time, so the arena is always free
//! to reallocate without invalidating outstanding timer slots.

use std::net::Ipv4Addr;
use std::rc::Rc;

use ipnet::Ipv4Net;

use crate::cycles::{current_cycles, cycles_per_second, cycles_to_usecs, usecs_to_cycles};
use crate::error::{EngineError, Result};
use crate::nic::ChecksumOffload;
use crate::packet::{
    transport_checksum, EthHeader, Ipv4Header, MacAddr, TcpHeader, UdpHeader, ETH_HEADER_LEN,
    IPPROTO_TCP, IPPROTO_UDP,
};
use crate::pool::{Buffer, OffloadFlags};
use crate::scheduler::EventHandle;

/// Gap, in microseconds, added to a flow's next-event delay when it wraps
/// back to its first packet.
pub const INTER_FLOW_GAP: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

struct TemplatePacket {
    rel_cycles: u64,
    direction: Direction,
    frame: Vec<u8>,
}

/// A capture loaded once and replayed by any number of flows, each with its
/// own client/server identity substituted in.
pub struct CaptureTemplate {
    packets: Vec<TemplatePacket>,
    client_mac: MacAddr,
    server_mac: MacAddr,
    client_port: u16,
    server_port: u16,
    protocol: u8,
}

impl CaptureTemplate {
    /// Loads `path` and computes each packet's offset from the first
    /// packet. When `inter_pkts_gap_usecs` is given, the captured inter-
    /// packet timing is discarded entirely and packets are spaced evenly by
    /// that many microseconds instead; this is how a capture recorded over
    /// a slow or bursty link is turned into a steady synthetic rate.
    pub fn load(
        path: &std::path::Path,
        inter_pkts_gap_usecs: Option<u64>,
    ) -> Result<CaptureTemplate> {
        let captured = crate::pcap::load(path)?;
        let first = captured.first().ok_or_else(|| {
            EngineError::InvalidConfig(format!("capture {} has no packets", path.display()))
        })?;

        let client_mac = first.src_mac;
        let server_mac = first.dst_mac;
        let ip = &first.data[ETH_HEADER_LEN..];
        let protocol = Ipv4Header::protocol(ip);
        let l4 = &ip[Ipv4Header::ihl(ip)..];
        let (client_port, server_port) = match protocol {
            IPPROTO_TCP => (TcpHeader::src_port(l4), TcpHeader::dst_port(l4)),
            IPPROTO_UDP => (UdpHeader::src_port(l4), UdpHeader::dst_port(l4)),
            other => {
                return Err(EngineError::InvalidConfig(format!(
                    "capture {} uses unsupported IP protocol {other}",
                    path.display()
                )))
            }
        };

        let base_ts = first.timestamp_usecs;
        let mut packets = Vec::with_capacity(captured.len());
        for (i, pkt) in captured.iter().enumerate() {
            let rel_usecs = match inter_pkts_gap_usecs {
                Some(gap) => i as u64 * gap,
                None => pkt.timestamp_usecs - base_ts,
            };
            let direction = if pkt.src_mac == client_mac {
                Direction::ClientToServer
            } else {
                Direction::ServerToClient
            };
            packets.push(TemplatePacket {
                rel_cycles: usecs_to_cycles(rel_usecs),
                direction,
                frame: pkt.data.clone(),
            });
        }

        Ok(CaptureTemplate {
            packets,
            client_mac,
            server_mac,
            client_port,
            server_port,
            protocol,
        })
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn client_mac(&self) -> MacAddr {
        self.client_mac
    }

    pub fn server_mac(&self) -> MacAddr {
        self.server_mac
    }
}

/// One attempted send, handed to `GenOps::record_report` every time a flow
/// fires — successful or not. This is the per-packet stream persisted by
/// `crate::report`; it is distinct from the per-flow summary `FlowRollup`
/// a stop response returns, which is read live off `Flow` counters instead.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub generator_id: u32,
    pub flow_id: u32,
    pub pkt_idx: usize,
    pub pkt_len: usize,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub from_client: bool,
    pub ok: bool,
    pub tstamp_cycles: u64,
}

/// The capabilities a flow needs from its owning manager. Kept as a trait
/// bound rather than a trait object: `FlowsGenerator` is generic over `O`,
/// monomorphised per concrete manager type, so none of this indirection
/// costs a vtable hop on the per-packet hot path.
pub trait GenOps {
    fn alloc_buffer(&mut self) -> Option<Buffer>;
    fn copy_buffer(&mut self, src: &Buffer) -> Option<Buffer>;
    fn send_packet(&mut self, buf: Buffer);
    fn create_event_slot(&mut self, due_cycles: u64, key: (u32, u32)) -> EventHandle;
    fn cancel_event_slot(&mut self, handle: EventHandle);
    fn record_report(&mut self, report: GenerationReport);
}

struct Flow {
    client_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
    pkt_idx: usize,
    cnt_pkts: u64,
    cnt_bytes: u64,
    tstamp_begin: u64,
    tstamp_end: u64,
    handle: Option<EventHandle>,
}

/// Parameters for one batch of flow construction against a shared capture
/// template.
pub struct FlowBuildConfig {
    pub client_cidr: Ipv4Net,
    pub server_cidr: Ipv4Net,
    pub client_mac: MacAddr,
    pub server_mac: MacAddr,
    /// Fixed client-side source port burned into every flow. Leaves the
    /// capture's own captured port untouched when absent.
    pub client_port: Option<u16>,
    /// Number of consecutive flows (at construction, and again every time a
    /// flow wraps at runtime) that share one client/server IP pair before
    /// the generator advances to the next pair.
    pub burst: u32,
    pub flows_per_sec: u32,
    pub start_cycles: u64,
    pub offload: ChecksumOffload,
}

/// Owns the arena of flows built from one capture template and the only
/// logic that touches them: construction and steady-state replay.
pub struct FlowsGenerator {
    generator_id: u32,
    template: Rc<CaptureTemplate>,
    canonical: Vec<Buffer>,
    flows: Vec<Flow>,
    client_hosts: Option<std::iter::Cycle<ipnet::Ipv4AddrRange>>,
    server_hosts: Option<std::iter::Cycle<ipnet::Ipv4AddrRange>>,
    burst: u32,
    /// Running count of flow-wraps (construction steps plus runtime
    /// wraps), so the burst cadence started at construction continues
    /// seamlessly once flows start wrapping at runtime.
    flows_emitted: u64,
    current_pair: (Ipv4Addr, Ipv4Addr),
    client_mac: MacAddr,
    server_mac: MacAddr,
    client_port: Option<u16>,
    offload: ChecksumOffload,
}

impl FlowsGenerator {
    pub fn new(generator_id: u32, template: Rc<CaptureTemplate>) -> FlowsGenerator {
        FlowsGenerator {
            generator_id,
            template,
            canonical: Vec::new(),
            flows: Vec::new(),
            client_hosts: None,
            server_hosts: None,
            burst: 1,
            flows_emitted: 0,
            current_pair: (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED),
            client_mac: MacAddr::default(),
            server_mac: MacAddr::default(),
            client_port: None,
            offload: ChecksumOffload::default(),
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Builds exactly `flows_per_sec` flows, staggering each one's first
    /// event uniformly across one second so they do not all fire on the
    /// same tick.
    pub fn build_flows<O: GenOps>(&mut self, ops: &mut O, cfg: &FlowBuildConfig) -> Result<usize> {
        if cfg.flows_per_sec == 0 {
            return Err(EngineError::InvalidConfig("flows_per_sec must be non-zero".into()));
        }
        let cycles_per_sec = cycles_per_second();
        let step = cycles_per_sec / cfg.flows_per_sec as u64;
        if step == 0 {
            return Err(EngineError::StepRoundsToZero(cfg.flows_per_sec));
        }

        self.client_mac = cfg.client_mac;
        self.server_mac = cfg.server_mac;
        self.client_port = cfg.client_port;
        self.offload = cfg.offload;
        self.burst = cfg.burst.max(1);
        self.build_canonical(ops)?;

        let mut client_hosts = cfg.client_cidr.hosts().cycle();
        let mut server_hosts = cfg.server_cidr.hosts().cycle();
        self.current_pair = (
            client_hosts.next().ok_or_else(empty_cidr)?,
            server_hosts.next().ok_or_else(empty_cidr)?,
        );
        self.client_hosts = Some(client_hosts);
        self.server_hosts = Some(server_hosts);
        self.flows_emitted = 0;

        let count = cfg.flows_per_sec as usize;
        self.flows = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                self.advance_pair_if_due()?;
            }
            let (client_ip, server_ip) = self.current_pair;
            let first_due = cfg.start_cycles + i as u64 * step + self.template.packets[0].rel_cycles;
            let handle = ops.create_event_slot(first_due, (self.generator_id, i as u32));
            self.flows.push(Flow {
                client_ip,
                server_ip,
                pkt_idx: 0,
                cnt_pkts: 0,
                cnt_bytes: 0,
                tstamp_begin: 0,
                tstamp_end: 0,
                handle: Some(handle),
            });
        }
        Ok(count)
    }

    /// Ticks the burst counter and, every `burst` ticks, advances to the
    /// next client/server address pair. Called once per construction step
    /// past the first flow, and again every time a flow wraps at runtime —
    /// the same cadence, uninterrupted.
    fn advance_pair_if_due(&mut self) -> Result<()> {
        self.flows_emitted += 1;
        if self.flows_emitted % self.burst as u64 == 0 {
            let client_hosts = self
                .client_hosts
                .as_mut()
                .expect("client_hosts initialized before any flow is built");
            let server_hosts = self
                .server_hosts
                .as_mut()
                .expect("server_hosts initialized before any flow is built");
            self.current_pair = (
                client_hosts.next().ok_or_else(empty_cidr)?,
                server_hosts.next().ok_or_else(empty_cidr)?,
            );
        }
        Ok(())
    }

    fn build_canonical<O: GenOps>(&mut self, ops: &mut O) -> Result<()> {
        let mut out = Vec::with_capacity(self.template.packets.len());
        for tmpl in &self.template.packets {
            let mut buf = ops.alloc_buffer().ok_or_else(|| {
                EngineError::PoolSetup("buffer pool exhausted during flow build".into())
            })?;
            if !buf.append(&tmpl.frame) {
                return Err(EngineError::InvalidConfig(
                    "capture packet larger than buffer slot size".into(),
                ));
            }
            rewrite_static_headers(
                &mut buf,
                tmpl.direction,
                self.client_mac,
                self.server_mac,
                self.client_port,
                self.template.protocol,
            );
            out.push(buf);
        }
        self.canonical = out;
        Ok(())
    }

    /// The scheduler fire callback: sends the current packet of `flow_id`,
    /// reports the attempt, advances to the next packet (wrapping, and
    /// advancing the IP pair, once the template is exhausted), and always
    /// returns the next due cycle count — a flow never finishes.
    pub fn fire<O: GenOps>(&mut self, ops: &mut O, flow_id: u32) -> Option<u64> {
        let idx = flow_id as usize;
        let pkt_idx = self.flows[idx].pkt_idx;
        let direction = self.template.packets[pkt_idx].direction;
        let (client_ip, server_ip) = (self.flows[idx].client_ip, self.flows[idx].server_ip);
        let (src_ip, dst_ip) = match direction {
            Direction::ClientToServer => (client_ip, server_ip),
            Direction::ServerToClient => (server_ip, client_ip),
        };

        let now = current_cycles();
        if self.flows[idx].cnt_pkts == 0 {
            self.flows[idx].tstamp_begin = now;
        }
        self.flows[idx].tstamp_end = now;

        let pkt_len = self.canonical[pkt_idx].len();
        let mut ok = false;
        if let Some(mut buf) = ops.copy_buffer(&self.canonical[pkt_idx]) {
            rewrite_dynamic_headers(&mut buf, src_ip, dst_ip, self.template.protocol, self.offload);
            ops.send_packet(buf);
            self.flows[idx].cnt_pkts += 1;
            self.flows[idx].cnt_bytes += pkt_len as u64;
            ok = true;
        }

        ops.record_report(GenerationReport {
            generator_id: self.generator_id,
            flow_id,
            pkt_idx,
            pkt_len,
            src_addr: src_ip,
            dst_addr: dst_ip,
            from_client: direction == Direction::ClientToServer,
            ok,
            tstamp_cycles: now,
        });

        let packet_count = self.template.packets.len();
        let next_idx = (pkt_idx + 1) % packet_count;
        let wrapped = next_idx == 0;
        if wrapped {
            self.advance_pair_if_due()
                .expect("CIDR host ranges validated non-empty at construction never run dry");
            let (client_ip, server_ip) = self.current_pair;
            self.flows[idx].client_ip = client_ip;
            self.flows[idx].server_ip = server_ip;
        }
        self.flows[idx].pkt_idx = next_idx;

        let delta = if wrapped {
            self.template.packets[0].rel_cycles + usecs_to_cycles(INTER_FLOW_GAP)
        } else {
            self.template.packets[next_idx].rel_cycles - self.template.packets[pkt_idx].rel_cycles
        };
        Some(now + delta)
    }

    /// Reads each flow's live counters for the `detailed` rollup a stop
    /// response returns.
    pub fn rollups(&self) -> Vec<crate::messages::FlowRollup> {
        self.flows
            .iter()
            .enumerate()
            .map(|(flow_idx, f)| crate::messages::FlowRollup {
                gen_idx: self.generator_id,
                flow_idx: flow_idx as u32,
                cnt_pkts: f.cnt_pkts,
                cnt_bytes: f.cnt_bytes,
                duration_usec: if f.cnt_pkts > 0 {
                    cycles_to_usecs(f.tstamp_end.saturating_sub(f.tstamp_begin))
                } else {
                    0
                },
            })
            .collect()
    }

    /// Cancels every still-armed flow, for `StopGeneration`.
    pub fn cancel_all<O: GenOps>(&mut self, ops: &mut O) {
        for flow in &mut self.flows {
            if let Some(handle) = flow.handle.take() {
                ops.cancel_event_slot(handle);
            }
        }
    }
}

fn empty_cidr() -> EngineError {
    EngineError::InvalidConfig("client/server CIDR range has no usable host addresses".into())
}

/// Rewrites the parts of a template packet that never change across a
/// flow's lifetime: the Ethernet addresses, and (if configured) the fixed
/// client-side port. Done once per template packet, shared by every flow.
fn rewrite_static_headers(
    buf: &mut Buffer,
    direction: Direction,
    client_mac: MacAddr,
    server_mac: MacAddr,
    client_port: Option<u16>,
    protocol: u8,
) {
    let (src_mac, dst_mac) = match direction {
        Direction::ClientToServer => (client_mac, server_mac),
        Direction::ServerToClient => (server_mac, client_mac),
    };

    let data = buf.data_mut();
    EthHeader::set_src(data, src_mac);
    EthHeader::set_dst(data, dst_mac);

    if let Some(port) = client_port {
        let ip = &mut data[ETH_HEADER_LEN..];
        let ihl = Ipv4Header::ihl(ip);
        let l4 = &mut ip[ihl..];
        match (protocol, direction) {
            (IPPROTO_TCP, Direction::ClientToServer) => TcpHeader::set_src_port(l4, port),
            (IPPROTO_TCP, Direction::ServerToClient) => TcpHeader::set_dst_port(l4, port),
            (IPPROTO_UDP, Direction::ClientToServer) => UdpHeader::set_src_port(l4, port),
            (IPPROTO_UDP, Direction::ServerToClient) => UdpHeader::set_dst_port(l4, port),
            _ => {}
        }
    }
}

/// Rewrites the parts of a packet that change every send: the IPv4
/// addresses, checksums for whatever the NIC doesn't offload, and the
/// tx-offload flags the NIC reads at transmit.
fn rewrite_dynamic_headers(
    buf: &mut Buffer,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    offload: ChecksumOffload,
) {
    let frame_len = buf.len();
    let data = buf.data_mut();
    let ip = &mut data[ETH_HEADER_LEN..];
    Ipv4Header::set_src(ip, src_ip.octets());
    Ipv4Header::set_dst(ip, dst_ip.octets());
    let ihl = Ipv4Header::ihl(ip);

    let want_ip_csum = !offload.ip_csum;
    let want_l4_csum = match protocol {
        IPPROTO_TCP => !offload.tcp_csum,
        IPPROTO_UDP => !offload.udp_csum,
        _ => false,
    };

    if want_ip_csum {
        Ipv4Header::clear_checksum(ip);
        let sum = Ipv4Header::compute_checksum(ip);
        Ipv4Header::set_checksum(ip, sum);
    }
    if want_l4_csum {
        let l4_len = frame_len - ETH_HEADER_LEN - ihl;
        match protocol {
            IPPROTO_TCP => {
                TcpHeader::clear_checksum(&mut ip[ihl..]);
                let sum =
                    transport_checksum(src_ip.octets(), dst_ip.octets(), protocol, &ip[ihl..ihl + l4_len]);
                TcpHeader::set_checksum(&mut ip[ihl..], sum);
            }
            IPPROTO_UDP => {
                UdpHeader::clear_checksum(&mut ip[ihl..]);
                let sum =
                    transport_checksum(src_ip.octets(), dst_ip.octets(), protocol, &ip[ihl..ihl + l4_len]);
                UdpHeader::set_checksum(&mut ip[ihl..], sum);
            }
            _ => {}
        }
    }

    buf.set_offload_flags(OffloadFlags {
        ip_csum: offload.ip_csum,
        tcp_csum: protocol == IPPROTO_TCP && offload.tcp_csum,
        udp_csum: protocol == IPPROTO_UDP && offload.udp_csum,
        l2_len: ETH_HEADER_LEN as u8,
        l3_len: ihl as u8,
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::{BufferPool, DEFAULT_SLOT_SIZE};
    use std::cell::RefCell;

    struct TestOps {
        pool: BufferPool,
        scheduler: crate::scheduler::EventScheduler<(u32, u32)>,
        sent: RefCell<Vec<Buffer>>,
        reports: RefCell<Vec<GenerationReport>>,
    }

    impl GenOps for TestOps {
        fn alloc_buffer(&mut self) -> Option<Buffer> {
            self.pool.alloc()
        }
        fn copy_buffer(&mut self, src: &Buffer) -> Option<Buffer> {
            self.pool.copy(src)
        }
        fn send_packet(&mut self, buf: Buffer) {
            self.sent.borrow_mut().push(buf);
        }
        fn create_event_slot(&mut self, due_cycles: u64, key: (u32, u32)) -> EventHandle {
            self.scheduler.schedule(due_cycles, key)
        }
        fn cancel_event_slot(&mut self, handle: EventHandle) {
            self.scheduler.cancel(handle);
        }
        fn record_report(&mut self, report: GenerationReport) {
            self.reports.borrow_mut().push(report);
        }
    }

    fn write_capture(path: &std::path::Path, frames: &[Vec<u8>]) {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&65535u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        for (i, frame) in frames.iter().enumerate() {
            buf.extend_from_slice(&(1000u32 + i as u32).to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes());
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(frame);
        }
        std::fs::write(path, buf).unwrap();
    }

    fn udp_frame(src_mac: [u8; 6], dst_mac: [u8; 6]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HEADER_LEN + 20 + 8 + 4];
        frame[0..6].copy_from_slice(&dst_mac);
        frame[6..12].copy_from_slice(&src_mac);
        frame[12..14].copy_from_slice(&crate::packet::ETHERTYPE_IPV4.to_be_bytes());
        let ip = &mut frame[ETH_HEADER_LEN..];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((20 + 8 + 4) as u16).to_be_bytes());
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let l4 = &mut ip[20..];
        l4[0..2].copy_from_slice(&1111u16.to_be_bytes());
        l4[2..4].copy_from_slice(&2222u16.to_be_bytes());
        l4[4..6].copy_from_slice(&12u16.to_be_bytes());
        frame
    }

    fn sample_template() -> (std::path::PathBuf, CaptureTemplate) {
        let dir = std::env::temp_dir().join(format!("tgen-flow-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flow.pcap");

        let client_mac = [0xaa, 0, 0, 0, 0, 1];
        let server_mac = [0xaa, 0, 0, 0, 0, 2];
        write_capture(
            &path,
            &[udp_frame(client_mac, server_mac), udp_frame(server_mac, client_mac)],
        );
        let template = CaptureTemplate::load(&path, None).unwrap();
        (path, template)
    }

    fn test_ops() -> TestOps {
        TestOps {
            pool: BufferPool::new(64, DEFAULT_SLOT_SIZE).unwrap(),
            scheduler: crate::scheduler::EventScheduler::new(),
            sent: RefCell::new(Vec::new()),
            reports: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn template_classifies_direction_by_mac() {
        let (_path, template) = sample_template();
        assert_eq!(template.packet_count(), 2);
        assert_eq!(template.packets[0].direction, Direction::ClientToServer);
        assert_eq!(template.packets[1].direction, Direction::ServerToClient);
    }

    #[test]
    fn build_flows_respects_burst_ip_reuse() {
        let (_path, template) = sample_template();
        let mut gen = FlowsGenerator::new(0, Rc::new(template));
        let mut ops = test_ops();

        let cfg = FlowBuildConfig {
            client_cidr: "10.1.0.0/24".parse().unwrap(),
            server_cidr: "10.2.0.0/24".parse().unwrap(),
            client_mac: MacAddr([0xbb, 0, 0, 0, 0, 1]),
            server_mac: MacAddr([0xbb, 0, 0, 0, 0, 2]),
            client_port: Some(4000),
            burst: 2,
            flows_per_sec: 4,
            start_cycles: current_cycles(),
            offload: ChecksumOffload::default(),
        };

        let n = gen.build_flows(&mut ops, &cfg).unwrap();
        assert_eq!(n, 4);
        assert_eq!(gen.flows[0].client_ip, gen.flows[1].client_ip);
        assert_ne!(gen.flows[1].client_ip, gen.flows[2].client_ip);
    }

    #[test]
    fn build_flows_rewrites_fixed_client_port() {
        let (_path, template) = sample_template();
        let mut gen = FlowsGenerator::new(0, Rc::new(template));
        let mut ops = test_ops();

        let cfg = FlowBuildConfig {
            client_cidr: "10.1.0.0/30".parse().unwrap(),
            server_cidr: "10.2.0.0/30".parse().unwrap(),
            client_mac: MacAddr([0xbb, 0, 0, 0, 0, 1]),
            server_mac: MacAddr([0xbb, 0, 0, 0, 0, 2]),
            client_port: Some(1024),
            burst: 1,
            flows_per_sec: 2,
            start_cycles: current_cycles(),
            offload: ChecksumOffload::default(),
        };
        gen.build_flows(&mut ops, &cfg).unwrap();

        let ip = &gen.canonical[0].data()[ETH_HEADER_LEN..];
        let l4 = &ip[Ipv4Header::ihl(ip)..];
        assert_eq!(UdpHeader::src_port(l4), 1024);
    }

    #[test]
    fn build_flows_leaves_captured_port_when_absent() {
        let (_path, template) = sample_template();
        let mut gen = FlowsGenerator::new(0, Rc::new(template));
        let mut ops = test_ops();

        let cfg = FlowBuildConfig {
            client_cidr: "10.1.0.0/30".parse().unwrap(),
            server_cidr: "10.2.0.0/30".parse().unwrap(),
            client_mac: MacAddr([0xbb, 0, 0, 0, 0, 1]),
            server_mac: MacAddr([0xbb, 0, 0, 0, 0, 2]),
            client_port: None,
            burst: 1,
            flows_per_sec: 2,
            start_cycles: current_cycles(),
            offload: ChecksumOffload::default(),
        };
        gen.build_flows(&mut ops, &cfg).unwrap();

        let ip = &gen.canonical[0].data()[ETH_HEADER_LEN..];
        let l4 = &ip[Ipv4Header::ihl(ip)..];
        assert_eq!(UdpHeader::src_port(l4), 1111);
    }

    #[test]
    fn fire_wraps_and_advances_ip_pair_with_inter_flow_gap() {
        let (_path, template) = sample_template();
        let packet_count = template.packet_count();
        let mut gen = FlowsGenerator::new(0, Rc::new(template));
        let mut ops = test_ops();

        let cfg = FlowBuildConfig {
            client_cidr: "10.1.0.0/30".parse().unwrap(),
            server_cidr: "10.2.0.0/30".parse().unwrap(),
            client_mac: MacAddr([0xbb, 0, 0, 0, 0, 1]),
            server_mac: MacAddr([0xbb, 0, 0, 0, 0, 2]),
            client_port: Some(4000),
            burst: 1,
            flows_per_sec: 1,
            start_cycles: current_cycles(),
            offload: ChecksumOffload::default(),
        };
        gen.build_flows(&mut ops, &cfg).unwrap();
        let first_client_ip = gen.flows[0].client_ip;

        let mut last_due = None;
        for _ in 0..packet_count {
            last_due = gen.fire(&mut ops, 0);
        }

        assert!(last_due.is_some(), "a flow must always re-arm, never finish");
        assert_ne!(
            gen.flows[0].client_ip, first_client_ip,
            "wrapping back to packet 0 must advance the client/server IP pair"
        );
        assert_eq!(ops.sent.borrow().len(), packet_count);
        assert_eq!(ops.reports.borrow().len(), packet_count);

        let rollups = gen.rollups();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].cnt_pkts, packet_count as u64);
        assert_eq!(rollups[0].gen_idx, 0);
        assert_eq!(rollups[0].flow_idx, 0);
    }

    #[test]
    fn fire_records_a_report_even_when_pool_is_exhausted() {
        let (_path, template) = sample_template();
        let mut gen = FlowsGenerator::new(0, Rc::new(template));
        let mut ops = test_ops();

        let cfg = FlowBuildConfig {
            client_cidr: "10.1.0.0/30".parse().unwrap(),
            server_cidr: "10.2.0.0/30".parse().unwrap(),
            client_mac: MacAddr([0xbb, 0, 0, 0, 0, 1]),
            server_mac: MacAddr([0xbb, 0, 0, 0, 0, 2]),
            client_port: Some(4000),
            burst: 1,
            flows_per_sec: 1,
            start_cycles: current_cycles(),
            offload: ChecksumOffload::default(),
        };
        gen.build_flows(&mut ops, &cfg).unwrap();

        // Drain the pool down to nothing so the next copy_buffer fails.
        let mut holds = Vec::new();
        while let Some(b) = ops.pool.alloc() {
            holds.push(b);
        }

        let due = gen.fire(&mut ops, 0);
        assert!(due.is_some(), "a failed copy must still re-arm the next event");
        assert_eq!(ops.sent.borrow().len(), 0);
        assert_eq!(ops.reports.borrow().len(), 1);
        assert!(!ops.reports.borrow()[0].ok);
    }
}
