//! Boot the firmware ROM against the test disk over USB mass storage (xHCI).
//!
//! Any command-line arguments are forwarded to QEMU.

use std::{env, process};

use bootdisk::deps::Capabilities;
use bootdisk::runner::{self, RunConfig};
use bootdisk::transport::Transport;

fn main() {
    bootdisk::init_tracing();
    let config = RunConfig {
        extra_args: env::args().skip(1).collect(),
        ..RunConfig::from_env(Transport::UsbXhciMassStorage)
    };
    if !config.extra_args.is_empty() {
        eprintln!("[qemu-usb] Extra args: {:?}", config.extra_args);
    }
    let result = runner::execute(&config, &Capabilities::detect());
    process::exit(runner::exit_code(&result));
}
