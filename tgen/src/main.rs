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

//! Process bootstrap: load settings, bring up the NIC and buffer pool,
//! pin the data-plane loop to its own CPU, and run the control-plane HTTP
//! server on the thread that started the process.

mod http;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use engine::manager::GenerationManager;
use engine::nic::RawSocketNic;
use engine::pool::{BufferPool, DEFAULT_SLOT_SIZE};
use engine::{config::GeneratorSettings, ring};

#[derive(Parser, Debug)]
#[command(name = "tgen", about = "Capture-driven traffic generator")]
struct Cli {
    /// Path to the process settings file (interface, ring/pool sizes,
    /// control API bind address).
    #[arg(short = 'C', long, default_value = "tgen.conf")]
    config: PathBuf,

    /// Overrides the control API bind address from the settings file.
    #[arg(short = 'H', long)]
    http_addr: Option<String>,

    /// Enables debug-level logging regardless of RUST_LOG.
    #[arg(short = 'V', long)]
    verbose: bool,

    /// CPU the data-plane loop is pinned to.
    #[arg(long, default_value_t = 1)]
    data_plane_cpu: usize,
}

/// Best-effort CPU pin. Failing to pin does not stop the process: a
/// generator running unpinned is slower and noisier in its timing, not
/// incorrect.
fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            log::warn!(
                "failed to pin thread to CPU {cpu}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = match GeneratorSettings::load(&cli.config) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to load settings from {}: {err}", cli.config.display());
            std::process::exit(1);
        }
    };
    if let Some(http_addr) = &cli.http_addr {
        match http_addr.parse() {
            Ok(addr) => settings.http_addr = addr,
            Err(_) => {
                log::error!("invalid --http-addr {http_addr:?}");
                std::process::exit(1);
            }
        }
    }

    let nic = match RawSocketNic::open(&settings.interface) {
        Ok(nic) => nic,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };

    let (control_tx, control_rx) = ring::channel(settings.control_ring_capacity);
    let (data_tx, data_rx) = ring::channel(settings.data_ring_capacity);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            log::warn!("failed to install Ctrl-C handler: {err}");
        }
    }

    let data_plane_cpu = cli.data_plane_cpu;
    let data_plane_shutdown = shutdown.clone();
    let pool_capacity = settings.pool_capacity;
    let data_plane = std::thread::Builder::new()
        .name("tgen-data-plane".into())
        .spawn(move || {
            pin_current_thread(data_plane_cpu);

            // Built here, not on the control-plane thread: the pool's
            // free-list is `Rc`-backed since it is only ever touched by
            // the data-plane loop, so it cannot cross a thread boundary.
            let pool = match BufferPool::new(pool_capacity, DEFAULT_SLOT_SIZE) {
                Ok(pool) => pool,
                Err(err) => {
                    log::error!("{err}");
                    std::process::exit(1);
                }
            };

            let mut manager = GenerationManager::new(nic, pool, control_rx, data_tx);
            while !data_plane_shutdown.load(Ordering::Relaxed) {
                manager.step();
            }
        })
        .expect("failed to spawn data-plane thread");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("failed to build control-plane runtime");

    let http_addr = settings.http_addr;
    runtime.block_on(async move {
        tokio::select! {
            result = http::run_server(http_addr, control_tx, data_rx) => {
                if let Err(err) = result {
                    log::error!("control API exited: {err}");
                }
            }
            _ = wait_for_shutdown(shutdown.clone()) => {
                log::info!("shutdown requested, stopping control API");
            }
        }
    });

    if let Err(err) = data_plane.join() {
        log::error!("data-plane thread panicked: {err:?}");
        std::process::exit(1);
    }
}

async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
