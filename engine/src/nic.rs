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

//! NIC adapters.
//!
//! `NicAdapter` is the single point of contact between the data-plane loop
//! and the outside world: `rx_burst` pulls whatever is waiting, `tx_burst`
//! hands off a batch for transmission. Bring-up failure (device missing,
//! bind refused) is fatal and surfaces as `EngineError::NicSetup`; failure
//! to place an individual packet once running is not fatal, it is just
//! counted (`NicStats::tx_dropped`), since a generator under overload must
//! keep making progress.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use crate::error::{EngineError, Result};
use crate::pool::{Buffer, BufferPool, OffloadFlags};

/// What checksum computation the adapter will perform in hardware. Anything
/// not set here must be computed in software by the caller before the
/// buffer is hit with `tx_burst` (see `crate::packet`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumOffload {
    pub ip_csum: bool,
    pub tcp_csum: bool,
    pub udp_csum: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NicStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
}

pub trait NicAdapter {
    /// Offloads this adapter actually negotiated at bring-up.
    fn checksum_offload(&self) -> ChecksumOffload;

    /// Pulls up to `max` packets into fresh buffers from `pool`. Returns
    /// fewer than `max` (possibly zero) if nothing is waiting; never
    /// blocks.
    fn rx_burst(&mut self, pool: &BufferPool, max: usize) -> Vec<Buffer>;

    /// Transmits as many of `bufs` as the adapter can currently accept, in
    /// order, consuming them regardless of outcome. Returns the number
    /// actually sent; the remainder count against `NicStats::tx_dropped`.
    fn tx_burst(&mut self, bufs: Vec<Buffer>) -> usize;

    fn stats(&self) -> NicStats;
}

/// Sends and receives raw Ethernet frames on a `AF_PACKET`/`SOCK_RAW`
/// socket bound to a named interface. Provides no hardware checksum
/// offload: `libc` gives userspace no portable way to negotiate it, so
/// `checksum_offload()` always reports everything unset and the data plane
/// computes checksums in software.
pub struct RawSocketNic {
    fd: RawFd,
    stats: NicStats,
}

impl RawSocketNic {
    pub fn open(ifname: &str) -> Result<RawSocketNic> {
        if ifname.len() >= libc::IFNAMSIZ {
            return Err(EngineError::NicSetup(format!(
                "interface name {ifname:?} too long"
            )));
        }

        // ETH_P_ALL, network byte order, per packet(7).
        let proto = (libc::ETH_P_ALL as u16).to_be() as i32;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            return Err(EngineError::NicSetup(format!(
                "socket(AF_PACKET, SOCK_RAW) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let index = match Self::if_index(ifname) {
            Ok(index) => index,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = index;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(EngineError::NicSetup(format!(
                "bind to {ifname} failed: {err}"
            )));
        }

        unsafe { Self::set_nonblocking(fd) }?;

        Ok(RawSocketNic {
            fd,
            stats: NicStats::default(),
        })
    }

    fn if_index(ifname: &str) -> Result<i32> {
        let cname = std::ffi::CString::new(ifname).map_err(|_| {
            EngineError::NicSetup(format!("interface name {ifname:?} contains a NUL byte"))
        })?;
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 {
            return Err(EngineError::NicSetup(format!(
                "interface {ifname} not found: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(index as i32)
    }

    unsafe fn set_nonblocking(fd: RawFd) -> Result<()> {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(EngineError::NicSetup(format!(
                "fcntl O_NONBLOCK failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl NicAdapter for RawSocketNic {
    fn checksum_offload(&self) -> ChecksumOffload {
        ChecksumOffload::default()
    }

    fn rx_burst(&mut self, pool: &BufferPool, max: usize) -> Vec<Buffer> {
        let mut out = Vec::with_capacity(max);
        for _ in 0..max {
            let Some(mut buf) = pool.alloc() else {
                break;
            };
            let cap = buf.capacity();
            let n = unsafe {
                libc::recv(
                    self.fd,
                    buf.data_mut_for_rx(cap).as_mut_ptr() as *mut libc::c_void,
                    cap,
                    0,
                )
            };
            if n <= 0 {
                break;
            }
            buf.set_rx_len(n as usize);
            self.stats.rx_packets += 1;
            out.push(buf);
        }
        out
    }

    fn tx_burst(&mut self, bufs: Vec<Buffer>) -> usize {
        let mut sent = 0;
        for buf in bufs {
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf.data().as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n as usize == buf.len() {
                sent += 1;
                self.stats.tx_packets += 1;
            } else {
                self.stats.tx_dropped += 1;
            }
        }
        sent
    }

    fn stats(&self) -> NicStats {
        self.stats
    }
}

impl Drop for RawSocketNic {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// In-memory adapter for tests: `tx_burst` files packets onto an internal
/// queue instead of a wire, and `inject()` lets a test stage packets for a
/// subsequent `rx_burst` to pick up. Reports full checksum offload so
/// generator tests can run without exercising the software checksum path
/// unless they choose to.
#[derive(Default)]
pub struct LoopbackNic {
    offload: ChecksumOffload,
    inbound: VecDeque<Buffer>,
    transmitted: Vec<Buffer>,
    stats: NicStats,
}

impl LoopbackNic {
    pub fn new(offload: ChecksumOffload) -> LoopbackNic {
        LoopbackNic {
            offload,
            ..Default::default()
        }
    }

    pub fn inject(&mut self, buf: Buffer) {
        self.inbound.push_back(buf);
    }

    /// Drains and returns everything handed to `tx_burst` so far, for test
    /// assertions on what the generator actually produced.
    pub fn take_transmitted(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.transmitted)
    }
}

impl NicAdapter for LoopbackNic {
    fn checksum_offload(&self) -> ChecksumOffload {
        self.offload
    }

    fn rx_burst(&mut self, _pool: &BufferPool, max: usize) -> Vec<Buffer> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.inbound.pop_front() {
                Some(b) => {
                    self.stats.rx_packets += 1;
                    out.push(b);
                }
                None => break,
            }
        }
        out
    }

    fn tx_burst(&mut self, bufs: Vec<Buffer>) -> usize {
        let n = bufs.len();
        self.stats.tx_packets += n as u64;
        self.transmitted.extend(bufs);
        n
    }

    fn stats(&self) -> NicStats {
        self.stats
    }
}

/// Clears any offload flags a buffer was tagged with that the given
/// adapter cannot actually perform in hardware, so the caller knows it
/// still owes a software checksum before transmit.
pub fn unsupported_offloads(adapter_offload: ChecksumOffload, requested: OffloadFlags) -> OffloadFlags {
    OffloadFlags {
        ip_csum: requested.ip_csum && !adapter_offload.ip_csum,
        tcp_csum: requested.tcp_csum && !adapter_offload.tcp_csum,
        udp_csum: requested.udp_csum && !adapter_offload.udp_csum,
        l2_len: requested.l2_len,
        l3_len: requested.l3_len,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::DEFAULT_SLOT_SIZE;

    #[test]
    fn loopback_round_trips_injected_packets() {
        let pool = BufferPool::new(4, DEFAULT_SLOT_SIZE).unwrap();
        let mut nic = LoopbackNic::default();

        let mut buf = pool.alloc().unwrap();
        assert!(buf.append(b"hello"));
        nic.inject(buf);

        let got = nic.rx_burst(&pool, 8);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data(), b"hello");
    }

    #[test]
    fn loopback_counts_transmitted_packets() {
        let pool = BufferPool::new(4, DEFAULT_SLOT_SIZE).unwrap();
        let mut nic = LoopbackNic::default();
        let buf = pool.alloc().unwrap();
        let sent = nic.tx_burst(vec![buf]);
        assert_eq!(sent, 1);
        assert_eq!(nic.stats().tx_packets, 1);
        assert_eq!(nic.take_transmitted().len(), 1);
    }

    #[test]
    fn unsupported_offloads_masks_only_missing_bits() {
        let adapter = ChecksumOffload {
            ip_csum: true,
            tcp_csum: false,
            udp_csum: true,
        };
        let requested = OffloadFlags {
            ip_csum: true,
            tcp_csum: true,
            udp_csum: true,
            l2_len: 14,
            l3_len: 20,
        };
        let remaining = unsupported_offloads(adapter, requested);
        assert!(!remaining.ip_csum);
        assert!(remaining.tcp_csum);
        assert!(!remaining.udp_csum);
    }
}
