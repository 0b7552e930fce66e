//! Boot the firmware ROM against the test disk over NVMe.

use std::{env, process};

use bootdisk::deps::Capabilities;
use bootdisk::runner::{self, RunConfig};
use bootdisk::transport::Transport;

fn main() {
    bootdisk::init_tracing();
    let config = RunConfig {
        extra_args: env::args().skip(1).collect(),
        ..RunConfig::from_env(Transport::Nvme)
    };
    if !config.extra_args.is_empty() {
        eprintln!("[qemu-nvme] Extra args: {:?}", config.extra_args);
    }
    let result = runner::execute(&config, &Capabilities::detect());
    process::exit(runner::exit_code(&result));
}
