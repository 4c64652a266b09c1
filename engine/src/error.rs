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

use std::io;
use std::path::PathBuf;

/// Errors that can be surfaced back across the control/data boundary as a
/// request failure. Every variant here corresponds to a response the HTTP
/// collaborator can describe to its caller; nothing in this enum represents
/// an invariant violation (those are asserted/panicked on directly at the
/// point of detection, per the scheduler and ownership invariants).
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The NIC adapter could not be brought up (required offloads missing,
    /// queue setup failed, ...). Fatal at process startup.
    #[error("failed to initialize NIC adapter: {0}")]
    NicSetup(String),

    /// The buffer pool could not reserve its backing memory.
    #[error("failed to initialize buffer pool: {0}")]
    PoolSetup(String),

    /// A capture file could not be read or parsed.
    #[error("failed to load capture {path}: {source}")]
    CaptureLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A PCAP record claimed a captured length different from its original
    /// length.
    #[error("truncated packet in capture {path} at record {record}")]
    TruncatedPacket { path: PathBuf, record: usize },

    /// A capture packet was not IPv4, or its Ethernet/IPv4 header did not fit
    /// in the first segment.
    #[error("capture {path} contains a non IPv4 packet at record {record}")]
    NonIpv4Packet { path: PathBuf, record: usize },

    /// A capture's PCAP header was not the classic `0xA1B2C3D4` magic this
    /// loader accepts.
    #[error("capture {path} is not a recognized classic PCAP file")]
    BadMagic { path: PathBuf },

    /// `flows_per_sec` is too high for the scheduler's tick resolution: the
    /// per-flow stagger step rounds to zero cycles.
    #[error("flows_per_sec {0} is too high for the scheduler's resolution")]
    StepRoundsToZero(u32),

    /// A `start_gen` request failed validation before anything was enqueued.
    #[error("{0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
