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

//! The data-plane core of the traffic generator: buffer pool, NIC
//! adapters, capture loading, the event scheduler, flow replay, and the
//! generation manager that ties them together. Everything in this crate
//! is confined to a single CPU/thread; the only sanctioned way across
//! that boundary is the SPSC rings in [`ring`].

pub mod config;
pub mod cycles;
pub mod error;
pub mod flow;
pub mod manager;
pub mod messages;
pub mod nic;
pub mod packet;
pub mod pcap;
pub mod pool;
pub mod report;
pub mod ring;
pub mod scheduler;

pub use error::{EngineError, Result};
