use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use sgdma::hw::LOOPBACK_PLATFORM;
use sgdma_loopback::udmabuf::{UdmabufSource, channel_ios, configure_bridge};
use sgdma_loopback::{Loopback, LoopbackConfig, logger};

/// Polled scatter-gather DMA loopback self-test.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// UIO device exposing the DMA register window
    #[arg(long, default_value = "uio0")]
    registers: String,

    /// u-dma-buf allocation holding the descriptor rings
    #[arg(long, default_value = "udmabuf2")]
    descriptors: String,

    /// u-dma-buf allocation for the transmit payload
    #[arg(long, default_value = "udmabuf0")]
    source: String,

    /// u-dma-buf allocation for the received payload
    #[arg(long, default_value = "udmabuf1")]
    destination: String,

    /// Payload length in bytes
    #[arg(long)]
    length: Option<usize>,

    /// First byte of the counter pattern
    #[arg(long)]
    seed: Option<u8>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    let mut cfg = LoopbackConfig {
        registers: cli.registers,
        descriptors: cli.descriptors,
        source: cli.source,
        destination: cli.destination,
        ..LoopbackConfig::default()
    };
    if let Some(length) = cli.length {
        cfg.max_pkt_len = length;
    }
    if let Some(seed) = cli.seed {
        cfg.seed = seed;
    }

    let mut loopback = Loopback::bring_up(cfg, LOOPBACK_PLATFORM, UdmabufSource::new(), |regs| {
        configure_bridge(regs);
        channel_ios(regs, &LOOPBACK_PLATFORM)
    })
    .context("bring-up failed")?;

    loopback.run().context("loopback transfer failed")?;
    Ok(())
}
