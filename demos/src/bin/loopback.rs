//! Loopback demo over the software fabric
//!
//! Packets injected into the AP IP downlink are received by a virtual NIC,
//! echoed back through the uplink and collected from the fabric again.

use clap::{ArgAction, Parser};
use ipa_fabric::utils::logging::init_logger;
use ipa_fabric::{
    Config, ConnectParams, EndpointId, Fabric, FifoId, FlowFilter, NicConfig, RecvPacket, Result,
    SoftPacket, TermMask, Terminal,
};
use log::{info, warn, Level};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "loopback", about = "Echo packets through the software fabric")]
struct Args {
    /// JSON fabric configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Packets to inject
    #[arg(short = 'n', long, default_value_t = 10_000)]
    packets: usize,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 512)]
    size: usize,

    /// Flow id to tag packets with
    #[arg(short, long, default_value_t = 0)]
    flow: u8,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => Level::Info,
        1 => Level::Debug,
        _ => Level::Trace,
    };
    if let Err(e) = init_logger(level) {
        eprintln!("Warning: Could not install logger: {}", e);
    }

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    println!("ipa-fabric loopback");
    println!("===================");

    let (fabric, soft) = Fabric::software(config)?;
    for (endpoint, err) in fabric.bringup_failures() {
        warn!("endpoint {} unavailable: {}", endpoint, err);
    }

    let info = fabric.connect(EndpointId::ApIp, ConnectParams::default())?;
    info!("connected ApIp: {:?}", info);
    fabric.create_receiver(EndpointId::ApIp)?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let tx = Mutex::new(tx);
    let nic = fabric.add_nic(
        EndpointId::ApIp,
        NicConfig::new("ip0", TermMask::all(), FlowFilter::Any),
        Arc::new(move |packet: RecvPacket| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(packet.payload().to_vec());
            }
        }),
    )?;
    let sender = fabric.create_sender(EndpointId::ApIp)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived shutdown signal...");
        r.store(false, Ordering::Relaxed);
    })
    .unwrap_or_else(|_| {
        eprintln!("Warning: Could not set Ctrl-C handler");
    });

    let start = Instant::now();
    let injector = {
        let soft = Arc::clone(&soft);
        let running = Arc::clone(&running);
        let total = args.packets;
        let payload = vec![0x5au8; args.size];
        let flow = args.flow;
        thread::spawn(move || {
            let mut injected = 0;
            while injected < total && running.load(Ordering::Relaxed) {
                let batch: Vec<SoftPacket> = (0..(total - injected).min(32))
                    .map(|_| SoftPacket::new(Terminal::Vap0.id(), flow, payload.clone()))
                    .collect();
                match soft.deliver(FifoId::ApIpDl, &batch) {
                    Ok(0) => thread::sleep(Duration::from_micros(50)),
                    Ok(n) => injected += n,
                    Err(e) => {
                        warn!("deliver failed: {}", e);
                        break;
                    }
                }
            }
            injected
        })
    };

    let mut echoed = 0usize;
    let mut looped = 0usize;
    let mut pending: Vec<Vec<u8>> = Vec::new();
    while running.load(Ordering::Relaxed) && looped < args.packets {
        if let Ok(payload) = rx.recv_timeout(Duration::from_millis(10)) {
            pending.push(payload);
        }
        pending.retain(|payload| match nic.send(payload) {
            Ok(()) => {
                echoed += 1;
                false
            }
            Err(_) => true,
        });
        match soft.transmit(FifoId::ApIpUl) {
            Ok(sent) => looped += sent.len(),
            Err(e) => warn!("transmit failed: {}", e),
        }
    }
    running.store(false, Ordering::Relaxed);
    let injected = injector.join().unwrap_or(0);
    let elapsed = start.elapsed();

    println!();
    println!("Injected:   {}", injected);
    println!("Echoed:     {}", echoed);
    println!("Looped:     {}", looped);
    println!(
        "Rate:       {:.0} packets/s",
        looped as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    if let Some(stats) = fabric.receiver_stats(EndpointId::ApIp) {
        println!("Receiver:   {:?}", stats);
    }
    println!("Sender:     {:?}", sender.stats());
    println!("NIC:        {:?}", nic.stats());
    println!("Interrupts: {:?}", fabric.irq_stats());

    fabric.shutdown()?;
    Ok(())
}
