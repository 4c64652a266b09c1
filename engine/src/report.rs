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

//! A flat-file, one-row-per-attempted-send report of a generation run.
//!
//! Kept to a hand-rolled writer rather than a CSV crate: the row shape is
//! fixed and small, and the data-plane loop appending to it should not pay
//! for a dependency with more machinery than `write!` already gives us.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::cycles::cycles_to_usecs;
use crate::error::{EngineError, Result};
use crate::flow::GenerationReport;

const HEADER: &str = "tstamp,gen_idx,flow_idx,pkt_idx,pkt_len,src_addr,dst_addr,from_cln,ok\n";

pub struct ReportWriter {
    out: BufWriter<File>,
}

impl ReportWriter {
    pub fn create(path: &Path) -> Result<ReportWriter> {
        let file = File::create(path).map_err(|source| {
            EngineError::InvalidConfig(format!("failed to create report {}: {source}", path.display()))
        })?;
        let mut out = BufWriter::new(file);
        out.write_all(HEADER.as_bytes()).map_err(|source| {
            EngineError::InvalidConfig(format!("failed to write report header: {source}"))
        })?;
        Ok(ReportWriter { out })
    }

    /// Appends one row, one per attempted send whether it succeeded or not.
    /// I/O errors here are deliberately swallowed into the return value
    /// rather than panicking the data-plane loop: a disk that fills up
    /// mid-run should not take traffic generation down with it.
    pub fn append(&mut self, report: &GenerationReport) -> std::io::Result<()> {
        let tstamp_usecs = cycles_to_usecs(report.tstamp_cycles);
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{},{}",
            tstamp_usecs,
            report.generator_id,
            report.flow_id,
            report.pkt_idx,
            report.pkt_len,
            report.src_addr,
            report.dst_addr,
            report.from_client,
            report.ok
        )
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn writes_header_and_rows() {
        let dir = std::env::temp_dir().join(format!("tgen-report-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("report.csv");

        {
            let mut writer = ReportWriter::create(&path).unwrap();
            writer
                .append(&GenerationReport {
                    generator_id: 0,
                    flow_id: 1,
                    pkt_idx: 2,
                    pkt_len: 64,
                    src_addr: Ipv4Addr::new(10, 0, 0, 1),
                    dst_addr: Ipv4Addr::new(10, 0, 1, 1),
                    from_client: true,
                    ok: true,
                    tstamp_cycles: crate::cycles::usecs_to_cycles(1000),
                })
                .unwrap();
            writer.flush().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(HEADER.trim_end()));
        let row = lines.next().unwrap();
        assert!(row.starts_with("1000,0,1,2,64,10.0.0.1,10.0.1.1,true,true"));
    }
}
