use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use bootdisk::deps::{Capabilities, Tool};
use bootdisk::disk::{workspace_root, DiskBuilder, DiskConfig, Phases, DEFAULT_IMAGE};
use bootdisk::image::{DiskImage, MIB};
use bootdisk::qemu::{self, Acceleration, DEFAULT_MACHINE, DEFAULT_MEMORY};
use bootdisk::runner::{self, RunConfig};
use bootdisk::transport::Transport;
use bootdisk::{gpt, loopdev};

/// Disk-image fixture and QEMU harness tasks.
#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Report which external tools were found and whether KVM is usable.
    CheckDeps,
    /// Build a GPT disk image with a FAT32 ESP holding the boot payload.
    CreateDisk(CreateDiskArgs),
    /// Build the disk image, then boot the firmware against it in QEMU.
    Run(RunArgs),
    /// Print the partition table and ESP contents of an image.
    Verify {
        #[arg(long, env = "BOOTDISK_IMAGE")]
        image: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CreateDiskArgs {
    /// Image path [default: target/test-disk.img]
    #[arg(long, env = "BOOTDISK_IMAGE")]
    output: Option<PathBuf>,
    /// UEFI application installed as /EFI/BOOT/BOOTX64.EFI
    #[arg(long, env = "BOOTDISK_PAYLOAD")]
    payload: PathBuf,
    #[arg(long, default_value_t = 64)]
    size_mib: u64,
    /// Leave /startup.nsh off the volume.
    #[arg(long)]
    no_startup_script: bool,
    /// Delete the image if provisioning fails.
    #[arg(long)]
    remove_on_failure: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Image path [default: target/test-disk.img]
    #[arg(long, env = "BOOTDISK_IMAGE")]
    image: Option<PathBuf>,
    /// Firmware ROM passed as -bios [default: ~/coreboot/build/coreboot.rom]
    #[arg(long, env = "BOOTDISK_FIRMWARE")]
    firmware: Option<PathBuf>,
    #[arg(long, env = "BOOTDISK_PAYLOAD")]
    payload: Option<PathBuf>,
    #[arg(long, value_enum, env = "BOOTDISK_TRANSPORT", default_value = "usb")]
    transport: Transport,
    #[arg(long, env = "BOOTDISK_MEMORY", default_value = DEFAULT_MEMORY)]
    memory: String,
    #[arg(long, default_value = DEFAULT_MACHINE)]
    machine: String,
    /// Stop the emulator after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Also write serial output to this file.
    #[arg(long, env = "BOOTDISK_SERIAL_LOG")]
    serial_log: Option<PathBuf>,
    /// Boot the existing image instead of rebuilding it.
    #[arg(long)]
    no_create: bool,
    /// Extra arguments passed to QEMU after `--`.
    #[arg(last = true)]
    qemu_args: Vec<String>,
}

fn main() -> Result<()> {
    bootdisk::init_tracing();
    match Cli::parse().cmd {
        Cmd::CheckDeps => check_deps(),
        Cmd::CreateDisk(args) => create_disk(args),
        Cmd::Run(args) => run(args),
        Cmd::Verify { image } => verify(image),
    }
}

fn default_image() -> PathBuf {
    workspace_root().join(DEFAULT_IMAGE)
}

fn check_deps() -> Result<()> {
    let caps = Capabilities::detect();
    print!("{}", caps.report());
    match Acceleration::detect() {
        Acceleration::Kvm => println!("acceleration: KVM"),
        Acceleration::Tcg => {
            println!("acceleration: none (/dev/kvm missing or not accessible), QEMU will use TCG")
        }
    }
    match loopdev::system_loop_devices() {
        Ok(devices) => println!("loop devices in use: {}", devices.len()),
        Err(e) => println!("loop devices: unknown ({e})"),
    }

    let mut required = caps.provisioning_tools();
    required.push(Tool::Qemu);
    caps.require(&required)?;
    println!("All required tools found.");
    Ok(())
}

fn create_disk(args: CreateDiskArgs) -> Result<()> {
    let config = DiskConfig {
        output: args.output.unwrap_or_else(default_image),
        size_bytes: args.size_mib * MIB,
        startup_script: !args.no_startup_script,
        remove_on_failure: args.remove_on_failure,
        ..DiskConfig::new(args.payload)
    };
    config.check_inputs()?;
    let builder = DiskBuilder::from_capabilities(&Capabilities::detect())?;

    let mut phases = Phases::new(DiskBuilder::PHASES);
    let image = builder
        .build(&config, &mut phases)
        .with_context(|| format!("failed to create {}", config.output.display()))?;

    println!();
    println!("Disk image created: {}", image.path().display());
    println!("Size: {} MiB", image.size_bytes() / MIB);
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let config = RunConfig {
        image: args.image.unwrap_or_else(default_image),
        firmware: args.firmware.unwrap_or_else(qemu::default_firmware),
        payload: if args.no_create { None } else { args.payload },
        transport: args.transport,
        memory: args.memory,
        machine: args.machine,
        timeout: args.timeout.map(Duration::from_secs),
        serial_log: args.serial_log,
        extra_args: args.qemu_args,
    };
    let result = runner::execute(&config, &Capabilities::detect());
    process::exit(runner::exit_code(&result));
}

fn verify(image: Option<PathBuf>) -> Result<()> {
    let image = DiskImage::open(&image.unwrap_or_else(default_image))?;
    let layout = gpt::read_layout(image.path()).context("failed to read GPT")?;

    println!("{} ({} sectors)", image.path().display(), layout.disk_sectors);
    for (i, entry) in layout.entries.iter().enumerate() {
        println!(
            "  {}: {:<8} type {} LBA {}..={} ({} MiB){}",
            i + 1,
            entry.name,
            entry.type_guid,
            entry.first_lba,
            entry.last_lba,
            entry.size_bytes() / MIB,
            if entry.is_esp() { " [ESP]" } else { "" }
        );
    }
    let [esp] = layout.entries.as_slice() else {
        bail!("expected exactly one partition, found {}", layout.entries.len());
    };
    if !esp.is_esp() || esp.start_bytes() != MIB || !layout.spans_to_end(esp) {
        bail!("partition 1 is not an ESP at 1 MiB spanning the disk");
    }

    let builder = DiskBuilder::from_capabilities(&Capabilities::detect())?;
    let verification = builder.verify(&image)?;
    println!("ESP contents:");
    for file in &verification.files {
        println!("  /{} ({} bytes)", file.path.display(), file.contents.len());
    }
    Ok(())
}
