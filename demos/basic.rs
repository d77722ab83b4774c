use jlsemi_ptp::capture::HardwareTimestamp;
use jlsemi_ptp::packet::{
    HwTstampConfig, NetStack, Packet, PtpClass, PtpHeader, RxFilter, TxType,
};
use jlsemi_ptp::regs::PagedPhy;
use jlsemi_ptp::sim::SimPhy;
use jlsemi_ptp::ticks::MonotonicTicks;
use jlsemi_ptp::{ChipVariant, Clock, PtpConfig, PtpDevice, Timestamp};
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

/// A PTP message as it would sit in a socket buffer: just the PTP header.
#[derive(Debug, Clone)]
struct DemoPacket {
    name: &'static str,
    header: [u8; 34],
}

impl DemoPacket {
    fn new(name: &'static str, message_type: u8, sequence_id: u16) -> Self {
        let mut header = [0u8; 34];
        header[0] = message_type;
        header[1] = 0x02; // versionPTP
        header[30..32].copy_from_slice(&sequence_id.to_be_bytes());
        Self { name, header }
    }
}

impl Packet for DemoPacket {
    fn ptp_header(&self, _class: PtpClass) -> Option<PtpHeader> {
        PtpHeader::parse(&self.header)
    }
}

struct PrintingStack;

impl NetStack<DemoPacket> for PrintingStack {
    fn deliver_rx(&self, packet: DemoPacket, hwtstamp: Option<Timestamp>) {
        match hwtstamp {
            Some(ts) => print_timestamp(&format!("  rx {}", packet.name), ts),
            None => println!("  rx {}: no timestamp", packet.name),
        }
    }

    fn complete_tx(&self, packet: DemoPacket, hwtstamp: Timestamp) {
        print_timestamp(&format!("  tx {}", packet.name), hwtstamp);
    }
}

struct Demo {
    phy: Arc<PagedPhy<SimPhy>>,
    device: PtpDevice<DemoPacket>,
}

impl Demo {
    fn new(variant: ChipVariant) -> Result<Self, Box<dyn std::error::Error>> {
        let config = PtpConfig {
            variant,
            ..PtpConfig::default()
        };
        let phy = Arc::new(PagedPhy::new(SimPhy::default()));
        let ticks = Arc::new(MonotonicTicks::new(config.tick_hz));
        let device =
            PtpDevice::<DemoPacket>::probe(phy.clone(), Arc::new(PrintingStack), config, ticks)?;
        device.config(true)?;
        device.hwtstamp(HwTstampConfig {
            tx_type: TxType::On,
            rx_filter: RxFilter::PtpV2Event,
        })?;
        Ok(Self { phy, device })
    }

    fn settle(&self) {
        if !self.device.wait_idle(Duration::from_secs(2)) {
            println!("  (workers still busy)");
        }
    }
}

fn print_timestamp(label: &str, timestamp: Timestamp) {
    println!("{}: {}.{:09} s", label, timestamp.seconds, timestamp.nanos);
}

fn demonstrate_time(demo: &Demo) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Time Demo ===");
    let clock = demo.device.clock();

    print_timestamp("Time after reset", clock.now()?);
    clock.set_time(Timestamp::new(1_700_000_000, 0))?;
    print_timestamp("Time after set", clock.now()?);

    demo.phy.bus().advance(1_500_000_000);
    print_timestamp(
        "Hardware ran 1.5 s (seconds are counted in software)",
        clock.now()?,
    );

    println!();
    Ok(())
}

fn demonstrate_capabilities(demo: &Demo) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Capabilities Demo ===");
    let caps = demo.device.clock().capabilities()?;
    println!("  Maximum frequency adjustment: {} ppb", caps.max_frequency_adjustment_ppb);
    println!("  Periodic outputs: {}", caps.n_per_out);
    println!("  PPS: {}", caps.pps);

    let info = demo.device.get_ts_info();
    println!("  SOF_TIMESTAMPING flags: {:#x}", info.so_timestamping);
    println!("  tx types: {:#b}", info.tx_types);
    println!("  rx filters: {:#b}", info.rx_filters);
    println!("  PHC index: {}", info.phc_index);

    println!();
    Ok(())
}

fn demonstrate_step(demo: &Demo) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Clock Stepping Demo ===");
    let clock = demo.device.clock();
    clock.set_time(Timestamp::new(100, 999_999_000))?;

    print_timestamp("Stepped forward 2 us", clock.step_clock(2_000)?);
    print_timestamp("Stepped back 1 s", clock.step_clock(-1_000_000_000)?);
    match clock.step_clock(-1_000_000_000_000) {
        Ok(ts) => print_timestamp("Unexpectedly stepped to", ts),
        Err(e) => println!("Stepping before zero refused: {}", e),
    }

    println!();
    Ok(())
}

fn demonstrate_frequency(demo: &Demo) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Frequency Adjustment Demo ===");
    let clock = demo.device.clock();

    for ppm in [95, -3] {
        demo.phy.bus().clear_log();
        clock.adjust_frequency(ppm * 65_536)?;
        demo.settle();

        let steps = demo.phy.bus().steps();
        let total: i64 = steps
            .iter()
            .map(|s| if s.negative { -i64::from(s.ns) } else { i64::from(s.ns) })
            .sum();
        println!(
            "  {} ppm: {} step commands, {} ns in total, servo {:?}",
            ppm,
            steps.len(),
            total,
            clock.servo().state()
        );
    }

    println!();
    Ok(())
}

fn demonstrate_rx(demo: &Demo) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Receive Timestamping Demo ===");
    let bus = demo.phy.bus();

    println!("Packet first, capture later:");
    let sync = DemoPacket::new("Sync #42", 0x0, 42);
    if demo.device.rx_timestamp(sync, PtpClass::V2_IPV4).is_some() {
        println!("  packet was not taken");
    }
    bus.latch_arrival(HardwareTimestamp::new(100, 500_000, 42));
    demo.device.interrupt();
    demo.settle();

    println!("Capture first, packet later:");
    bus.latch_arrival(HardwareTimestamp::new(101, 250, 43));
    demo.device.interrupt();
    demo.settle();
    let sync = DemoPacket::new("Sync #43", 0x0, 43);
    if demo.device.rx_timestamp(sync, PtpClass::V2_IPV4).is_some() {
        println!("  packet was not taken");
    }

    println!("General messages are not timestamped:");
    let announce = DemoPacket::new("Announce", 0xb, 1);
    if let Some(packet) = demo.device.rx_timestamp(announce, PtpClass::V2_IPV4) {
        println!("  {} handed back to the caller", packet.name);
    }
    println!("  free slots: {}", demo.device.rx().free_slots());

    println!();
    Ok(())
}

fn demonstrate_tx(demo: &Demo) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Transmit Timestamping Demo ===");

    demo.phy
        .bus()
        .latch_departure(HardwareTimestamp::new(200, 1_000, 7));
    let delay_req = DemoPacket::new("Delay_Req #7", 0x1, 7);
    demo.device.tx_timestamp(delay_req, PtpClass::V2_L2);
    demo.settle();

    demo.device.hwtstamp(HwTstampConfig {
        tx_type: TxType::OneStepSync,
        rx_filter: RxFilter::PtpV2Event,
    })?;
    let sync = DemoPacket::new("Sync #8", 0x0, 8);
    demo.device.tx_timestamp(sync, PtpClass::V2_L2);
    println!(
        "  one-step Sync stamped by the PHY, {} packets queued",
        demo.device.tx().queued()
    );

    println!();
    Ok(())
}

fn print_help() {
    println!("JLSemi PHY PTP Example Binary");
    println!("=============================");
    println!();
    println!("This example drives the PTP core against a simulated PHY.");
    println!();
    println!("Usage:");
    println!("  cargo run --example basic -- [OPTIONS]");
    println!();
    println!("Chip Selection:");
    println!("  --chip TYPE     Chip generation to simulate (default: jl2xxx)");
    println!("                  Options: jl2xxx, jl3xxx");
    println!();
    println!("Operation Options:");
    println!("  --help, -h      Show this help message");
    println!("  --time          Demonstrate reading and setting the time");
    println!("  --capabilities  Demonstrate clock and timestamping capabilities");
    println!("  --step          Demonstrate clock stepping");
    println!("  --frequency     Demonstrate frequency adjustment");
    println!("  --rx            Demonstrate receive timestamping");
    println!("  --tx            Demonstrate transmit timestamping");
    println!("  --all           Run all demonstrations (default)");
}

fn parse_chip(s: &str) -> Result<ChipVariant, String> {
    match s.to_lowercase().as_str() {
        "jl2xxx" => Ok(ChipVariant::Jl2xxx),
        "jl3xxx" => Ok(ChipVariant::Jl3xxx),
        _ => Err(format!(
            "Unknown chip '{}'. Valid options: jl2xxx, jl3xxx",
            s
        )),
    }
}

type DemoFn = fn(&Demo) -> Result<(), Box<dyn std::error::Error>>;

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut variant = ChipVariant::default();
    let mut operation = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--chip" => {
                let Some(chip) = args.get(i + 1) else {
                    eprintln!("Error: --chip requires a chip argument");
                    eprintln!("Use --help for usage information.");
                    process::exit(1);
                };
                match parse_chip(chip) {
                    Ok(v) => variant = v,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(1);
                    }
                }
                i += 2;
                continue;
            }
            "--time" => operation = Some("time"),
            "--capabilities" => operation = Some("capabilities"),
            "--step" => operation = Some("step"),
            "--frequency" => operation = Some("frequency"),
            "--rx" => operation = Some("rx"),
            "--tx" => operation = Some("tx"),
            "--all" => operation = Some("all"),
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                eprintln!("Use --help for usage information.");
                process::exit(1);
            }
        }
        i += 1;
    }

    let demo = match Demo::new(variant) {
        Ok(demo) => demo,
        Err(e) => {
            eprintln!("Failed to set up the simulated PHY: {}", e);
            process::exit(1);
        }
    };

    let demos: [(&str, &str, DemoFn); 6] = [
        ("time", "Time", demonstrate_time),
        ("capabilities", "Capabilities", demonstrate_capabilities),
        ("step", "Clock Stepping", demonstrate_step),
        ("frequency", "Frequency Adjustment", demonstrate_frequency),
        ("rx", "Receive Timestamping", demonstrate_rx),
        ("tx", "Transmit Timestamping", demonstrate_tx),
    ];

    println!("JLSemi PHY PTP Example ({:?})", variant);
    println!();
    for (key, name, demo_fn) in &demos {
        if operation.map_or(true, |op| op == "all" || op == *key) {
            if let Err(e) = demo_fn(&demo) {
                eprintln!("{} demo failed: {}", name, e);
            }
        }
    }

    demo.device.remove();
    println!("Example completed!");
}
