use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use usb_acquire::acquire::{RetryPolicy, acquire_device};
use usb_acquire::host::{InterfaceControl, InterfaceMatch, UsbHost, UsbId};
use usb_acquire::native::NativeHost;
use usb_acquire::select::{self, FirstInterface};
use usb_acquire::stop::StopToken;

/// Claim exclusive access to a USB device and drive one of its interfaces.
#[derive(Parser, Debug)]
#[command(name = "usb-acquire")]
struct Opt {
    /// Vendor ID of the device to claim (decimal, or hex with an 0x prefix)
    #[arg(value_parser = parse_id)]
    vendor_id: u16,

    /// Product ID of the device to claim
    #[arg(value_parser = parse_id)]
    product_id: u16,

    /// Match this interface number directly instead of walking the device
    #[arg(long)]
    interface: Option<u8>,

    /// Configuration value the interface lives in (only with --interface)
    #[arg(long, default_value_t = 1)]
    configuration: u8,

    /// Enumeration passes to make while the device stays contended
    #[arg(long, default_value_t = 5)]
    passes: u32,

    /// Delay between contended passes, in milliseconds
    #[arg(long, default_value_t = 1000)]
    delay_ms: u64,
}

fn parse_id(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid ID {s:?}: {e}"))
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("USB_ACQUIRE_LOG", "info")
            .write_style("USB_ACQUIRE_LOG_STYLE"),
    )
    .init();

    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(e) => {
            let _ = e.print();
            // A malformed invocation exits -1, like the acquisition failures.
            std::process::exit(if e.use_stderr() { -1 } else { 0 });
        }
    };

    let stop = StopToken::new();
    {
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            if stop.is_requested() {
                eprintln!("second interrupt, exiting immediately");
                std::process::exit(-3);
            }
            eprintln!("interrupted, requesting stop");
            stop.request();
        }) {
            warn!("could not establish signal handler: {e}");
        }
    }

    match run(&opt, &stop) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(-1);
        }
    }
}

/// Wire the host backend to the acquisition loop and map the outcome to a
/// process exit code.
fn run(opt: &Opt, stop: &StopToken) -> Result<i32> {
    let host = NativeHost::new()?;
    let id = UsbId {
        vid: opt.vendor_id,
        pid: opt.product_id,
    };

    if let Some(interface_number) = opt.interface {
        // Match the interface directly, skipping device acquisition.
        let mut candidates = host.interfaces_matching(InterfaceMatch {
            id,
            configuration: opt.configuration,
            interface_number,
        })?;
        let mut discriminator = FirstInterface::default();

        match select::select_interface(&mut candidates, &mut discriminator, |interface| {
            drive_interface(interface, stop)
        }) {
            Ok(()) => Ok(0),
            Err(e) => {
                error!("{e}");
                Ok(-1)
            }
        }
    } else {
        let mut candidates = host.devices_matching(id)?;
        let policy = RetryPolicy {
            passes: opt.passes,
            delay: Duration::from_millis(opt.delay_ms),
        };
        let mut discriminator = FirstInterface::default();

        let result = acquire_device(&mut candidates, &policy, stop, |device, configuration| {
            let selected =
                select::use_device(device, configuration, &mut discriminator, |interface| {
                    drive_interface(interface, stop)
                });
            if let Err(e) = selected {
                error!("{e}");
            }
        });
        match result {
            Ok(()) => Ok(0),
            Err(e) => {
                error!("{e}");
                Ok(e.exit_code())
            }
        }
    }
}

/// Stand-in for the device-specific work: hold the claim and poll for a stop
/// request, so the interface stays ours until we're interrupted.
fn drive_interface<I: InterfaceControl>(interface: &mut I, stop: &StopToken) {
    match interface.endpoints() {
        Ok(endpoints) => info!(
            "interface open with {} endpoints; press Ctrl-C to stop",
            endpoints.len()
        ),
        Err(_) => info!("interface open; press Ctrl-C to stop"),
    }

    while !stop.is_requested() {
        sleep(Duration::from_millis(100));
    }
    info!("stop requested, letting go of the interface");
}
