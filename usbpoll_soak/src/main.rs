//! Soak driver for the readiness layer.
//!
//! Allocates a set of loopback descriptors, keeps every slot in flight, and lets a completer
//! thread finish transfers (every so often short) while the main thread polls and re-arms.
//! A signal pipe stops the run when the time is up or on SIGINT/SIGTERM.

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use usbpoll_core::config::PollConfig;
use usbpoll_core::{logger, Descriptor, DescriptorTable, Error, Interest, LoopbackCaps, LoopbackDevice, WaitRequest};

#[cfg(unix)]
mod signals;

const TRANSFER_SIZE: usize = 512;
const SLOTS_PER_DESCRIPTOR: usize = 4;
/// One transfer in this many completes short.
const SHORT_EVERY: u64 = 13;

struct Args {
    config_path: Option<String>,
    seconds: u64,
    descriptors: usize,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args { config_path: None, seconds: 10, descriptors: 4 };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seconds" => {
                let v = iter.next().ok_or("--seconds needs a value")?;
                args.seconds = v.parse().map_err(|_| format!("invalid --seconds value: {}", v))?;
            }
            "--descriptors" => {
                let v = iter.next().ok_or("--descriptors needs a value")?;
                args.descriptors = v.parse().map_err(|_| format!("invalid --descriptors value: {}", v))?;
            }
            "-h" | "--help" => {
                println!("usage: usbpoll_soak [config-file] [--seconds N] [--descriptors N]");
                process::exit(0);
            }
            s if s.starts_with("--") => return Err(format!("unknown option {}", s)),
            path => args.config_path = Some(path.to_string()),
        }
    }
    Ok(args)
}

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let config = match &args.config_path {
        Some(path) => match PollConfig::load_from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("config load failure ({}): {}", path, e);
                process::exit(1);
            }
        },
        None => PollConfig::default(),
    };
    logger::init(config.log_level);

    #[cfg(unix)]
    signals::init_term_signals();

    let slots = SLOTS_PER_DESCRIPTOR.min(config.max_slots);
    let table = Arc::new(DescriptorTable::new(config));
    info!(
        "soak: {} descriptors x {} slots for {}s, cancellation {:?}",
        args.descriptors,
        slots,
        args.seconds,
        table.strategy()
    );

    let mut streams = Vec::with_capacity(args.descriptors);
    for _ in 0..args.descriptors {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        match table.allocate(dev.clone(), Interest::Readable, slots) {
            Ok(id) => streams.push((id, dev)),
            Err(e) => {
                error!("allocate failed: {}", e);
                process::exit(1);
            }
        }
    }
    let (stop_r, stop_w) = match table.create_pipe() {
        Ok(p) => p,
        Err(e) => {
            error!("create_pipe failed: {}", e);
            process::exit(1);
        }
    };

    for (id, dev) in &streams {
        if let Err(e) = submit_batch(&table, *id, dev, slots) {
            error!("{}: initial submit failed: {}", id, e);
            process::exit(1);
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let completer = {
        let devices: Vec<Arc<LoopbackDevice>> = streams.iter().map(|(_, d)| Arc::clone(d)).collect();
        let done = Arc::clone(&done);
        thread::spawn(move || run_completer(&devices, &done))
    };
    let watcher = {
        let table = Arc::clone(&table);
        let deadline = Instant::now() + Duration::from_secs(args.seconds);
        thread::spawn(move || {
            while Instant::now() < deadline && !terminate_requested() {
                thread::sleep(Duration::from_millis(50));
            }
            if let Err(e) = table.write(stop_w, &[1]) {
                warn!("stop signal failed: {}", e);
            }
        })
    };

    let batches = poll_loop(&table, &streams, stop_r, slots);

    done.store(true, Ordering::SeqCst);
    if completer.join().is_err() {
        warn!("completer thread panicked");
    }
    if watcher.join().is_err() {
        warn!("watcher thread panicked");
    }
    table.close_all();

    info!("soak finished after {} batches", batches);
    print!("{}", table.stats().render());
}

fn poll_loop(
    table: &DescriptorTable,
    streams: &[(Descriptor, Arc<LoopbackDevice>)],
    stop: Descriptor,
    slots: usize,
) -> u64 {
    let mut requests: Vec<WaitRequest> = streams.iter().map(|(id, _)| WaitRequest::readable(*id)).collect();
    requests.push(WaitRequest::readable(stop));
    let mut batches = 0u64;

    loop {
        match table.poll(&mut requests, 250) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Error::Interrupted) => {
                debug!("poll interrupted, request set unchanged");
                continue;
            }
            Err(e) => {
                error!("poll failed: {}", e);
                return batches;
            }
        }

        if requests.last().map_or(false, |r| r.is_ready()) {
            let mut byte = [0u8];
            if let Err(e) = table.read(stop, &mut byte) {
                warn!("reading the stop signal failed: {}", e);
            }
            return batches;
        }

        for (req, (id, dev)) in requests.iter().zip(streams) {
            if !req.is_ready() {
                continue;
            }
            match table.outcome(*id) {
                Ok(Some(outcome)) => {
                    batches += 1;
                    debug!("{}: batch done, {} bytes, aborted={}", id, outcome.bytes, outcome.aborted);
                    if req.error {
                        warn!("{}: batch failed: {:?}", id, outcome.status);
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    error!("{}: outcome failed: {}", id, e);
                    return batches;
                }
            }
            if let Err(e) = table.rearm(*id).and_then(|_| submit_batch(table, *id, dev, slots)) {
                error!("{}: re-arm failed: {}", id, e);
                return batches;
            }
        }
    }
}

fn submit_batch(table: &DescriptorTable, id: Descriptor, dev: &LoopbackDevice, slots: usize) -> usbpoll_core::Result<()> {
    for slot in 0..slots {
        dev.submit(table.arm(id, slot, TRANSFER_SIZE)?);
    }
    Ok(())
}

fn run_completer(devices: &[Arc<LoopbackDevice>], done: &AtomicBool) {
    let mut count = 0u64;
    while !done.load(Ordering::SeqCst) {
        let mut idle = true;
        for dev in devices {
            count += 1;
            let finished = if count % SHORT_EVERY == 0 {
                dev.complete_next(TRANSFER_SIZE / 2)
            } else {
                dev.complete_next_full()
            };
            idle &= finished.is_none();
        }
        if idle {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(unix)]
fn terminate_requested() -> bool {
    signals::should_terminate()
}

#[cfg(not(unix))]
fn terminate_requested() -> bool {
    false
}
