//! cothread echo server
//!
//! One task per connection, written as plain blocking code over
//! `cothread::io`. Uses the epoll reactor underneath.
//!
//! Usage:
//!     ./target/release/echo [port]
//!
//! The port may also come from `ECHO_PORT` (default 9998).
//! Test with:
//!     nc 127.0.0.1 9998

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cothread::io::{CoListener, CoStream};
use cothread::{env_get, kerror, sleep, spawn, Runtime, SchedulerConfig};

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active: AtomicU64,
    errors: AtomicU64,
}

fn handle_client(mut stream: CoStream, stats: Arc<Stats>) {
    stats.active.fetch_add(1, Ordering::Relaxed);

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => {
                stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                match stream.write_all(&buf[..n]) {
                    Ok(()) => {
                        stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(_) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
            Err(_) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    stats.active.fetch_sub(1, Ordering::Relaxed);
}

fn main() {
    cothread::init_logging();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| env_get("ECHO_PORT", 9998));

    let listener = match CoListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("echo: bind 0.0.0.0:{} failed: {}", port, e);
            std::process::exit(1);
        }
    };

    let config = SchedulerConfig::from_env();
    let workers = config.num_workers;
    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("echo: {}", e);
            std::process::exit(1);
        }
    };

    eprintln!("echo: listening on 0.0.0.0:{}", port);
    eprintln!("echo: runtime = cothread, {} workers (epoll)", workers);

    let result = runtime.block_on(move || {
        let stats = Arc::new(Stats::default());
        let start = Instant::now();

        // Stats printer
        let s = Arc::clone(&stats);
        let printer = spawn(move || loop {
            sleep(Duration::from_secs(5));
            eprintln!(
                "[{:.1}s] active={} accepts={} bytes_in={} bytes_out={} err={}",
                start.elapsed().as_secs_f64(),
                s.active.load(Ordering::Relaxed),
                s.accepts.load(Ordering::Relaxed),
                s.bytes_in.load(Ordering::Relaxed),
                s.bytes_out.load(Ordering::Relaxed),
                s.errors.load(Ordering::Relaxed),
            );
        });
        if let Err(e) = printer {
            kerror!("echo: stats task: {}", e);
        }

        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stats.accepts.fetch_add(1, Ordering::Relaxed);
                    let s = Arc::clone(&stats);
                    if let Err(e) = spawn(move || handle_client(stream, s)) {
                        kerror!("echo: spawn: {}", e);
                    }
                }
                Err(e) => {
                    eprintln!("echo: accept error: {}", e);
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    if let Err(e) = result {
        eprintln!("echo: {}", e);
        std::process::exit(1);
    }
}
