//! Flowbuf throughput driver
//!
//! One producer thread and N reader threads over a single buffer. Every
//! reader checks that it sees the counter sequence without gaps.
//!
//! Usage:
//!   cargo run --release -- [--items N] [--readers N] [--total N]
//!
//! Log level via `RUST_LOG` (default `flowbuf=info`), allocator via
//! `FLOWBUF_GRANULARITY` / `FLOWBUF_MAX_ATTEMPTS`.

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use flowbuf::{AllocatorConfig, Buffer, BufferReader, Registry, StageId};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ITEM_SIZE: usize = std::mem::size_of::<u64>();

/// Driver configuration
struct DriverConfig {
    items: usize,
    readers: usize,
    total: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            items: 64 * 1024,
            readers: 4,
            total: 50_000_000,
        }
    }
}

fn parse_args() -> DriverConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DriverConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--items" | "-n" => {
                if i + 1 < args.len() {
                    config.items = args[i + 1].parse().unwrap_or(config.items);
                    i += 1;
                }
            }
            "--readers" | "-r" => {
                if i + 1 < args.len() {
                    config.readers = args[i + 1].parse().unwrap_or(config.readers);
                    i += 1;
                }
            }
            "--total" | "-t" => {
                if i + 1 < args.len() {
                    config.total = args[i + 1].parse().unwrap_or(config.total);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Usage: flowbuf [--items N] [--readers N] [--total N]");
                std::process::exit(0);
            }
            other => eprintln!("ignoring unknown argument {other:?}"),
        }
        i += 1;
    }

    config
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowbuf=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .init();
}

fn produce(mut buf: Buffer, total: u64) -> Duration {
    let start = Instant::now();
    let mut counter = 0u64;

    while counter < total {
        let window = buf.write_items::<u64>();
        if window.is_empty() {
            thread::yield_now();
            continue;
        }
        let n = window.len().min((total - counter) as usize);
        for slot in &mut window[..n] {
            *slot = counter;
            counter += 1;
        }
        buf.update_write_pointer(n);
    }

    buf.set_done(true);
    let elapsed = start.elapsed();

    // Readers own their detach; wait for them before dropping the buffer.
    while buf.reader_count() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    elapsed
}

fn consume(mut reader: BufferReader, total: u64) -> Result<u64, String> {
    let mut expected = reader.nitems_read();

    loop {
        let window = reader.read_items::<u64>();
        let n = window.len();
        if n == 0 {
            if reader.is_done() && reader.items_available() == 0 {
                break;
            }
            std::hint::spin_loop();
            continue;
        }
        for &value in window {
            if value != expected {
                return Err(format!(
                    "reader {} expected {} got {}",
                    reader.id().get(),
                    expected,
                    value
                ));
            }
            expected += 1;
        }
        reader.update_read_pointer(n);
    }

    if expected != total {
        return Err(format!("reader {} stopped at {expected}", reader.id().get()));
    }
    Ok(expected)
}

fn run(config: DriverConfig) -> Result<(), String> {
    let registry = Registry::new();
    let before = registry.live();

    let buf = Buffer::builder(config.items, ITEM_SIZE)
        .owner(StageId(0))
        .allocator(AllocatorConfig::from_env())
        .registry(&registry)
        .build()
        .map_err(|e| e.to_string())?;

    info!(
        capacity = buf.capacity(),
        readers = config.readers,
        total = config.total,
        "starting run"
    );

    let readers: Vec<_> = (0..config.readers)
        .map(|i| buf.add_reader(0, Some(StageId(i as u64 + 1))))
        .collect();

    let (elapsed, results) = thread::scope(|s| {
        let consumers: Vec<_> = readers
            .into_iter()
            .map(|reader| {
                thread::Builder::new()
                    .name(format!("reader-{}", reader.id().get()))
                    .spawn_scoped(s, move || consume(reader, config.total))
                    .map_err(|e| e.to_string())
            })
            .collect();

        let elapsed = produce(buf, config.total);
        let results: Vec<Result<u64, String>> = consumers
            .into_iter()
            .map(|h| h.and_then(|h| h.join().map_err(|_| "reader thread panicked".to_string())?))
            .collect();
        (elapsed, results)
    });

    for result in results {
        result?;
    }

    let after = registry.live();
    if before != after {
        return Err(format!("leak: {before} before, {after} after"));
    }

    let secs = elapsed.as_secs_f64();
    println!("📊 Flowbuf Throughput (1 writer, {} readers)", config.readers);
    println!("-------------------------------------------");
    println!("  Items:      {}", config.total);
    println!("  Elapsed:    {:.3} s", secs);
    println!(
        "  Throughput: {:.2} M items/sec ({:.2} MB/sec)",
        config.total as f64 / secs / 1_000_000.0,
        (config.total as usize * ITEM_SIZE) as f64 / secs / 1_000_000.0
    );
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let config = parse_args();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}
