//! Basic cothread example
//!
//! Spawns a handful of tasks on a multi-worker runtime and shows the main
//! primitives: yield, channel, CoMutex, sleep and timers.
//!
//! # Environment Variables
//!
//! - `COT_NUM_WORKERS=4` - Worker threads
//! - `COT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `COT_FLUSH_EPRINT=1` - Flush debug output immediately
//!
//! COT_LOG_LEVEL=debug cargo run -p cothread-basic

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cothread::{
    channel, current_id, kinfo, sleep_ms, spawn, yield_now, CoMutex, Runtime, SchedulerConfig,
};

fn main() {
    cothread::init_logging();
    println!("=== cothread basic example ===\n");

    let config = SchedulerConfig::from_env();
    config.print();

    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("basic: {}", e);
            std::process::exit(1);
        }
    };

    let sched = Arc::clone(runtime.scheduler());
    let result = runtime.block_on(move || {
        // Yield interleaving
        let (done_tx, done_rx) = channel::<usize>(4);
        for i in 1..=3 {
            let done = done_tx.clone();
            spawn(move || {
                for j in 0..3 {
                    kinfo!("[task {}] iteration {}", i, j);
                    yield_now();
                }
                let _ = done.send(i);
            })
            .unwrap();
        }
        drop(done_tx);
        while let Ok(i) = done_rx.recv() {
            println!("task {} finished", i);
        }

        // Shared counter behind a CoMutex
        let counter = Arc::new(CoMutex::new(0u64));
        let (tx, rx) = channel::<()>(8);
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            spawn(move || {
                for _ in 0..100 {
                    let mut guard = counter.lock();
                    *guard += 1;
                    yield_now();
                }
                let _ = tx.send(());
            })
            .unwrap();
        }
        drop(tx);
        while rx.recv().is_ok() {}
        println!("counter = {}", *counter.lock());

        // Sleep and timers
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        sched.expire_after(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&fired);
        let cancelled = sched.expire_after(Duration::from_millis(20), move || {
            f.fetch_add(100, Ordering::SeqCst);
        });
        sched.cancel_timer(cancelled);

        let start = Instant::now();
        sleep_ms(50);
        println!(
            "task {} slept {:?}, timers fired = {}",
            current_id(),
            start.elapsed(),
            fired.load(Ordering::SeqCst)
        );
    });

    if let Err(e) = result {
        eprintln!("basic: {}", e);
        std::process::exit(1);
    }
    println!("\n=== Example Complete ===");
}
