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

//! Messages carried across the control/data boundary.
//!
//! `ControlMessage` flows control-plane to data-plane on the outbound
//! ring; `DataMessage` flows the other way on the inbound ring. Both are
//! plain enums rather than trait objects, so the ring never has to box
//! anything to move it between CPUs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One capture-driven traffic source within a generation request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    pub pcap_path: PathBuf,
    pub client_cidr: String,
    pub server_cidr: String,
    /// Fixed client-side source port burned into every flow's packets. When
    /// absent, the capture's own captured port is left untouched.
    #[serde(default)]
    pub client_port: Option<u16>,
    /// Flows sharing one client/server IP pair before the generator
    /// advances to the next pair in each CIDR.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// When set, captured inter-packet timing is discarded and packets are
    /// spaced evenly by this many microseconds instead.
    #[serde(default)]
    pub inter_pkts_gap_usecs: Option<u64>,
}

fn default_burst() -> u32 {
    1
}

/// The body of a `start_gen` request: everything needed to build and run
/// one generation session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    pub captures: Vec<CaptureConfig>,
    pub flows_per_sec: u32,
    pub duration_secs: u32,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    /// The device under test's MAC address. Every rewritten packet across
    /// every capture in this request is addressed to this MAC on the
    /// server side, replacing whatever happened to be captured.
    pub dut_mac: String,
}

/// Sent control-plane to data-plane.
pub enum ControlMessage {
    StartGeneration(GenerationConfig),
    StopGeneration,
    StatsRequest,
}

/// How a `StartGeneration` request resolved. Carried as a plain enum rather
/// than `Result<(), String>` so the HTTP layer can distinguish "already
/// running" (412) from "malformed request" (400) without re-parsing a
/// string.
#[derive(Debug, Clone)]
pub enum StartGenerationOutcome {
    Started,
    AlreadyStarted,
    Invalid(String),
}

/// One flow's lifetime counters, read at stop time for the `detailed`
/// rollup in a stop response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRollup {
    pub gen_idx: u32,
    pub flow_idx: u32,
    pub cnt_pkts: u64,
    pub cnt_bytes: u64,
    pub duration_usec: u64,
}

/// Sent data-plane to control-plane.
pub enum DataMessage {
    StartGenerationResult(StartGenerationOutcome),
    StopGenerationResult(SummaryStats, Vec<FlowRollup>),
    StatsReport(SummaryStats),
}

/// Aggregate counters returned in answer to a `StatsRequest` or a stop
/// response. Field names match the wire contract exactly: they serialize
/// verbatim as the response's `result` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryStats {
    pub cnt_rx_pkts: u64,
    pub cnt_tx_pkts: u64,
    pub cnt_rx_bytes: u64,
    pub cnt_tx_bytes: u64,
    pub cnt_rx_pkts_qfull: u64,
    pub cnt_rx_pkts_nombuf: u64,
    pub cnt_tx_pkts_qfull: u64,
    pub cnt_tx_pkts_nombuf: u64,
    pub cnt_rx_pkts_err: u64,
    pub cnt_tx_pkts_err: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_config_defaults_burst_to_one() {
        let json = r#"{
            "pcap_path": "/tmp/a.pcap",
            "client_cidr": "10.0.0.0/24",
            "server_cidr": "10.0.1.0/24"
        }"#;
        let cfg: CaptureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.burst, 1);
        assert_eq!(cfg.inter_pkts_gap_usecs, None);
        assert_eq!(cfg.client_port, None);
    }

    #[test]
    fn generation_config_round_trips_through_json() {
        let cfg = GenerationConfig {
            captures: vec![CaptureConfig {
                pcap_path: "/tmp/a.pcap".into(),
                client_cidr: "10.0.0.0/24".into(),
                server_cidr: "10.0.1.0/24".into(),
                client_port: Some(1024),
                burst: 4,
                inter_pkts_gap_usecs: Some(100),
            }],
            flows_per_sec: 100,
            duration_secs: 10,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: GenerationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flows_per_sec, 100);
        assert_eq!(back.captures[0].burst, 4);
        assert_eq!(back.captures[0].client_port, Some(1024));
        assert_eq!(back.dut_mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn summary_stats_serializes_with_exact_counter_names() {
        let stats = SummaryStats {
            cnt_tx_pkts: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cnt_tx_pkts"], 3);
        assert!(json.get("cnt_rx_pkts_err").is_some());
        assert!(json.get("packets_sent").is_none());
    }
}
