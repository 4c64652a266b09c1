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

//! Classic-format PCAP capture loading.
//!
//! Only the original libpcap global header (magic `0xa1b2c3d4`, seconds +
//! microseconds per-record timestamps) is accepted. Byte-swapped and
//! nanosecond-resolution variants are rejected with `BadMagic` rather than
//! guessed at; a capture from a mismatched-endian host is expected to be
//! re-captured, not silently reinterpreted.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{EngineError, Result};
use crate::packet::{EthHeader, Ipv4Header, MacAddr, ETHERTYPE_IPV4, ETH_HEADER_LEN, IPV4_MIN_HEADER_LEN};

const CLASSIC_MAGIC: u32 = 0xa1b2c3d4;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

/// One fully parsed, validated capture record: a raw Ethernet/IPv4 frame and
/// its original capture timestamp.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp_usecs: u64,
    pub data: Vec<u8>,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
}

/// Reads and validates every record in the capture at `path`, in file
/// order. Every record must be IPv4 over Ethernet with no truncation; the
/// first record that isn't fails the whole load, since a generator built
/// from a partially-usable capture would silently skip packets.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<CapturedPacket>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| EngineError::CaptureLoad {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    read_global_header(&mut reader, path)?;

    let mut out = Vec::new();
    let mut record = 0usize;
    loop {
        match read_record(&mut reader, path, record)? {
            Some(packet) => out.push(packet),
            None => break,
        }
        record += 1;
    }
    Ok(out)
}

fn read_global_header(reader: &mut impl Read, path: &Path) -> Result<()> {
    let mut header = [0u8; GLOBAL_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|source| EngineError::CaptureLoad {
            path: path.to_path_buf(),
            source,
        })?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != CLASSIC_MAGIC {
        return Err(EngineError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn read_record(
    reader: &mut impl Read,
    path: &Path,
    record: usize,
) -> Result<Option<CapturedPacket>> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(source) => {
            return Err(EngineError::CaptureLoad {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let mut cursor = &header[..];
    let ts_sec = cursor.read_u32::<LittleEndian>().unwrap();
    let ts_usec = cursor.read_u32::<LittleEndian>().unwrap();
    let incl_len = cursor.read_u32::<LittleEndian>().unwrap() as usize;
    let orig_len = cursor.read_u32::<LittleEndian>().unwrap() as usize;

    if incl_len != orig_len {
        return Err(EngineError::TruncatedPacket {
            path: path.to_path_buf(),
            record,
        });
    }

    let mut data = vec![0u8; incl_len];
    reader
        .read_exact(&mut data)
        .map_err(|source| EngineError::CaptureLoad {
            path: path.to_path_buf(),
            source,
        })?;

    if data.len() < ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN {
        return Err(EngineError::NonIpv4Packet {
            path: path.to_path_buf(),
            record,
        });
    }
    if EthHeader::ethertype(&data) != ETHERTYPE_IPV4 {
        return Err(EngineError::NonIpv4Packet {
            path: path.to_path_buf(),
            record,
        });
    }
    let ip = &data[ETH_HEADER_LEN..];
    if Ipv4Header::ihl(ip) < IPV4_MIN_HEADER_LEN {
        return Err(EngineError::NonIpv4Packet {
            path: path.to_path_buf(),
            record,
        });
    }

    Ok(Some(CapturedPacket {
        timestamp_usecs: ts_sec as u64 * 1_000_000 + ts_usec as u64,
        src_mac: EthHeader::src(&data),
        dst_mac: EthHeader::dst(&data),
        data,
    }))
}

/// Builds the 24-byte classic global header libpcap writers emit; used only
/// by tests constructing a capture in memory.
#[cfg(test)]
fn write_global_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&CLASSIC_MAGIC.to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&4u16.to_le_bytes());
    buf.extend_from_slice(&0i32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&65535u32.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
}

#[cfg(test)]
fn write_record(buf: &mut Vec<u8>, ts_sec: u32, ts_usec: u32, data: &[u8]) {
    buf.extend_from_slice(&ts_sec.to_le_bytes());
    buf.extend_from_slice(&ts_usec.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

#[cfg(test)]
fn sample_ipv4_udp_frame() -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + 8];
    frame[0..6].copy_from_slice(&[0xaa, 0, 0, 0, 0, 1]);
    frame[6..12].copy_from_slice(&[0xaa, 0, 0, 0, 0, 2]);
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    let ip = &mut frame[ETH_HEADER_LEN..];
    ip[0] = 0x45;
    ip[9] = crate::packet::IPPROTO_UDP;
    frame
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_capture(path: &Path, frames: &[Vec<u8>]) {
        let mut buf = Vec::new();
        write_global_header(&mut buf);
        for (i, frame) in frames.iter().enumerate() {
            write_record(&mut buf, 1000 + i as u32, i as u32 * 10, frame);
        }
        let mut f = File::create(path).unwrap();
        f.write_all(&buf).unwrap();
    }

    #[test]
    fn loads_well_formed_capture() {
        let dir = std::env::temp_dir().join(format!("tgen-pcap-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.pcap");
        write_capture(&path, &[sample_ipv4_udp_frame(), sample_ipv4_udp_frame()]);

        let packets = load(&path).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].timestamp_usecs, 1000 * 1_000_000);
        assert_eq!(packets[1].timestamp_usecs, 1001 * 1_000_000 + 10);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = std::env::temp_dir().join(format!("tgen-pcap-test-badmagic-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.pcap");
        std::fs::write(&path, [0u8; 24]).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, EngineError::BadMagic { .. }));
    }

    #[test]
    fn rejects_truncated_record() {
        let dir = std::env::temp_dir().join(format!("tgen-pcap-test-trunc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trunc.pcap");

        let mut buf = Vec::new();
        write_global_header(&mut buf);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&60u32.to_le_bytes());
        buf.extend_from_slice(&64u32.to_le_bytes());
        buf.extend_from_slice(&vec![0u8; 60]);
        std::fs::write(&path, &buf).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, EngineError::TruncatedPacket { record: 0, .. }));
    }

    #[test]
    fn rejects_non_ipv4_record() {
        let dir = std::env::temp_dir().join(format!("tgen-pcap-test-nonip-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nonip.pcap");

        let mut frame = sample_ipv4_udp_frame();
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
        write_capture(&path, &[frame]);

        let err = load(&path).unwrap_err();
        assert!(matches!(err, EngineError::NonIpv4Packet { record: 0, .. }));
    }
}
