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

//! Process-level settings and `start_gen` request validation.
//!
//! `GeneratorSettings` is the file the bootstrap binary reads before
//! anything else exists: which interface to bind, how big the pool and
//! rings are, where to listen. It is a flat `key=value` file rather than
//! JSON or TOML, matching the simpler format the rest of this system's
//! fixed, rarely-edited bring-up configuration uses; `GenerationConfig`
//! (the thing a client posts at runtime) is JSON precisely because it
//! crosses the HTTP boundary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::messages::GenerationConfig;
use crate::packet::MacAddr;

pub const MAX_FLOWS_PER_SEC: u32 = 1_000_000;
pub const MAX_DURATION_SECS: u32 = 24 * 60 * 60;
pub const MIN_BURST: u32 = 1;
pub const MAX_BURST: u32 = 5;
pub const MIN_IPG_USECS: u64 = 1;
pub const MAX_IPG_USECS: u64 = 100_000_000;
pub const MIN_CLIENT_PORT: u16 = 1024;
pub const MAX_CLIENT_PORT: u16 = 65535;

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub interface: String,
    pub pool_capacity: u32,
    pub control_ring_capacity: usize,
    pub data_ring_capacity: usize,
    pub http_addr: SocketAddr,
    pub report_path: PathBuf,
}

fn get(fields: &HashMap<String, String>, key: &str) -> Result<String> {
    fields
        .get(key)
        .cloned()
        .ok_or_else(|| EngineError::InvalidConfig(format!("missing setting {key:?}")))
}

fn parse_field<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
    value
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("invalid value for {key:?}: {value:?}")))
}

impl GeneratorSettings {
    /// Parses a flat `key=value` settings file. Blank lines and lines
    /// starting with `#` are ignored. Every key below is required; a
    /// missing or malformed one is reported with its line content so a
    /// typo is easy to spot.
    pub fn load(path: &Path) -> Result<GeneratorSettings> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            EngineError::InvalidConfig(format!("failed to read {}: {source}", path.display()))
        })?;

        let mut fields = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                EngineError::InvalidConfig(format!("malformed settings line: {line:?}"))
            })?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }

        let interface = get(&fields, "interface")?;
        let pool_capacity = parse_field::<u32>("pool_capacity", get(&fields, "pool_capacity")?)?;
        let control_ring_capacity =
            parse_field::<usize>("control_ring_capacity", get(&fields, "control_ring_capacity")?)?;
        let data_ring_capacity =
            parse_field::<usize>("data_ring_capacity", get(&fields, "data_ring_capacity")?)?;
        let http_addr = parse_field::<SocketAddr>("http_addr", get(&fields, "http_addr")?)?;
        let report_path = PathBuf::from(get(&fields, "report_path")?);

        Ok(GeneratorSettings {
            interface,
            pool_capacity,
            control_ring_capacity,
            data_ring_capacity,
            http_addr,
            report_path,
        })
    }
}

/// Validates a `start_gen` request before anything is built or enqueued.
/// Every bound here matches the JSON contract's documented valid ranges.
pub fn validate_generation_config(cfg: &GenerationConfig) -> Result<()> {
    if cfg.captures.is_empty() {
        return Err(EngineError::InvalidConfig("captures must not be empty".into()));
    }
    if cfg.flows_per_sec == 0 || cfg.flows_per_sec > MAX_FLOWS_PER_SEC {
        return Err(EngineError::InvalidConfig(format!(
            "flows_per_sec must be in 1..={MAX_FLOWS_PER_SEC}, got {}",
            cfg.flows_per_sec
        )));
    }
    if cfg.duration_secs == 0 || cfg.duration_secs > MAX_DURATION_SECS {
        return Err(EngineError::InvalidConfig(format!(
            "duration_secs must be in 1..={MAX_DURATION_SECS}, got {}",
            cfg.duration_secs
        )));
    }
    cfg.dut_mac
        .parse::<MacAddr>()
        .map_err(|_| EngineError::InvalidConfig(format!("invalid dut_ether_addr {:?}", cfg.dut_mac)))?;
    for capture in &cfg.captures {
        if capture.burst < MIN_BURST || capture.burst > MAX_BURST {
            return Err(EngineError::InvalidConfig(format!(
                "burst must be in {MIN_BURST}..={MAX_BURST}, got {}",
                capture.burst
            )));
        }
        capture.client_cidr.parse::<ipnet::Ipv4Net>().map_err(|_| {
            EngineError::InvalidConfig(format!("invalid client_cidr {:?}", capture.client_cidr))
        })?;
        capture.server_cidr.parse::<ipnet::Ipv4Net>().map_err(|_| {
            EngineError::InvalidConfig(format!("invalid server_cidr {:?}", capture.server_cidr))
        })?;
        if let Some(gap) = capture.inter_pkts_gap_usecs {
            if gap < MIN_IPG_USECS || gap > MAX_IPG_USECS {
                return Err(EngineError::InvalidConfig(format!(
                    "inter_pkts_gap_usecs must be in {MIN_IPG_USECS}..={MAX_IPG_USECS}, got {gap}"
                )));
            }
        }
        if let Some(port) = capture.client_port {
            if port < MIN_CLIENT_PORT {
                return Err(EngineError::InvalidConfig(format!(
                    "client_port must be in {MIN_CLIENT_PORT}..={MAX_CLIENT_PORT}, got {port}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::CaptureConfig;

    fn valid_capture() -> CaptureConfig {
        CaptureConfig {
            pcap_path: "/tmp/a.pcap".into(),
            client_cidr: "10.0.0.0/24".into(),
            server_cidr: "10.0.1.0/24".into(),
            client_port: Some(1024),
            burst: 1,
            inter_pkts_gap_usecs: None,
        }
    }

    #[test]
    fn settings_file_parses_key_value_pairs() {
        let dir = std::env::temp_dir().join(format!("tgen-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tgen.conf");
        std::fs::write(
            &path,
            "# comment\ninterface=eth0\npool_capacity=4096\ncontrol_ring_capacity=64\ndata_ring_capacity=64\nhttp_addr=127.0.0.1:9000\nreport_path=/tmp/report.csv\n",
        )
        .unwrap();

        let settings = GeneratorSettings::load(&path).unwrap();
        assert_eq!(settings.interface, "eth0");
        assert_eq!(settings.pool_capacity, 4096);
        assert_eq!(settings.http_addr.port(), 9000);
    }

    #[test]
    fn settings_file_rejects_missing_key() {
        let dir = std::env::temp_dir().join(format!("tgen-cfg-test-missing-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tgen.conf");
        std::fs::write(&path, "interface=eth0\n").unwrap();

        let err = GeneratorSettings::load(&path).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_flows_per_sec() {
        let cfg = GenerationConfig {
            captures: vec![valid_capture()],
            flows_per_sec: 0,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_cidr() {
        let mut capture = valid_capture();
        capture.client_cidr = "not-a-cidr".into();
        let cfg = GenerationConfig {
            captures: vec![capture],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_dut_mac() {
        let cfg = GenerationConfig {
            captures: vec![valid_capture()],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "not-a-mac".into(),
        };
        assert!(validate_generation_config(&cfg).is_err());
    }

    #[test]
    fn rejects_burst_above_five() {
        let mut capture = valid_capture();
        capture.burst = 6;
        let cfg = GenerationConfig {
            captures: vec![capture],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_ipg() {
        let mut capture = valid_capture();
        capture.inter_pkts_gap_usecs = Some(0);
        let cfg = GenerationConfig {
            captures: vec![capture],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_err());
    }

    #[test]
    fn rejects_client_port_below_1024() {
        let mut capture = valid_capture();
        capture.client_port = Some(80);
        let cfg = GenerationConfig {
            captures: vec![capture],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_err());
    }

    #[test]
    fn accepts_absent_ipg_and_client_port() {
        let mut capture = valid_capture();
        capture.client_port = None;
        capture.inter_pkts_gap_usecs = None;
        let cfg = GenerationConfig {
            captures: vec![capture],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_ok());
    }

    #[test]
    fn accepts_well_formed_config() {
        let cfg = GenerationConfig {
            captures: vec![valid_capture()],
            flows_per_sec: 10,
            duration_secs: 1,
            report_path: None,
            dut_mac: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert!(validate_generation_config(&cfg).is_ok());
    }
}
