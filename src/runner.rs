//! Run-style entry points: provision the image (optionally), then boot it.

use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::error;

use crate::deps::Capabilities;
use crate::disk::{workspace_root, DiskBuilder, DiskConfig, Phases, DEFAULT_IMAGE};
use crate::error::{HarnessError, PreconditionError, Result};
use crate::qemu::{
    self, CancelToken, EmulatorHarness, Session, SessionReport, DEFAULT_MACHINE, DEFAULT_MEMORY,
};
use crate::transport::Transport;

pub const IMAGE_ENV: &str = "BOOTDISK_IMAGE";
pub const FIRMWARE_ENV: &str = "BOOTDISK_FIRMWARE";
pub const PAYLOAD_ENV: &str = "BOOTDISK_PAYLOAD";
pub const TRANSPORT_ENV: &str = "BOOTDISK_TRANSPORT";
pub const MEMORY_ENV: &str = "BOOTDISK_MEMORY";
pub const SERIAL_LOG_ENV: &str = "BOOTDISK_SERIAL_LOG";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: PathBuf,
    pub firmware: PathBuf,
    /// When set, a fresh image is built from this payload before booting.
    pub payload: Option<PathBuf>,
    pub transport: Transport,
    pub memory: String,
    pub machine: String,
    pub timeout: Option<Duration>,
    pub serial_log: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl RunConfig {
    /// Defaults, overridden by `BOOTDISK_*` environment variables. The
    /// transport is fixed by the caller.
    pub fn from_env(transport: Transport) -> Self {
        let path = |var: &str| env::var_os(var).map(PathBuf::from);
        RunConfig {
            image: path(IMAGE_ENV).unwrap_or_else(|| workspace_root().join(DEFAULT_IMAGE)),
            firmware: path(FIRMWARE_ENV).unwrap_or_else(qemu::default_firmware),
            payload: path(PAYLOAD_ENV),
            transport,
            memory: env::var(MEMORY_ENV).unwrap_or_else(|_| DEFAULT_MEMORY.to_string()),
            machine: DEFAULT_MACHINE.to_string(),
            timeout: None,
            serial_log: path(SERIAL_LOG_ENV),
            extra_args: Vec::new(),
        }
    }

    fn check_inputs(&self) -> Result<(), PreconditionError> {
        if !self.firmware.is_file() {
            return Err(PreconditionError::MissingInput {
                what: "firmware ROM",
                path: self.firmware.clone(),
            });
        }
        match &self.payload {
            Some(payload) if !payload.is_file() => Err(PreconditionError::MissingInput {
                what: "boot payload",
                path: payload.clone(),
            }),
            Some(_) => Ok(()),
            None if !self.image.is_file() => Err(PreconditionError::MissingInput {
                what: "disk image (set BOOTDISK_PAYLOAD to build one)",
                path: self.image.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Check preconditions, build the image if a payload was given, then boot
/// it with serial output forwarded to stdout.
pub fn execute(config: &RunConfig, caps: &Capabilities) -> Result<SessionReport> {
    config.check_inputs()?;
    let builder = match config.payload {
        Some(_) => Some(DiskBuilder::from_capabilities(caps)?),
        None => None,
    };
    let harness =
        EmulatorHarness::from_capabilities(caps)?.with_cancel(CancelToken::from_signals());

    let total = if builder.is_some() { DiskBuilder::PHASES + 1 } else { 1 };
    let mut phases = Phases::new(total);

    if let (Some(builder), Some(payload)) = (&builder, &config.payload) {
        let disk = DiskConfig {
            output: config.image.clone(),
            ..DiskConfig::new(payload)
        };
        let image = builder.build(&disk, &mut phases)?;
        println!("Disk image: {} ({} bytes)", image.path().display(), image.size_bytes());
    }

    let session = Session {
        memory: config.memory.clone(),
        machine: config.machine.clone(),
        serial_log: config.serial_log.clone(),
        timeout: config.timeout,
        extra_args: config.extra_args.clone(),
        ..Session::new(config.firmware.clone(), config.image.clone(), config.transport)
    };
    phases.begin(&format!("Booting {} over {}", config.firmware.display(), config.transport));
    harness.run(&session, &mut io::stdout())
}

/// Report the outcome on stderr and map it to a process exit code.
pub fn exit_code(result: &Result<SessionReport>) -> i32 {
    match result {
        Ok(report) => {
            eprintln!(
                "Emulator {} after {:.1?} ({} serial bytes)",
                report.terminal, report.duration, report.serial_bytes
            );
            0
        }
        Err(HarnessError::EmulatorExit { terminal, serial_bytes }) => {
            eprintln!("Emulator {terminal} ({serial_bytes} serial bytes)");
            terminal.exit_code()
        }
        Err(err) => {
            error!(phase = err.phase(), "{err}");
            eprintln!("error ({}): {err}", err.phase());
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_is_checked_before_anything_else() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            firmware: dir.path().join("coreboot.rom"),
            payload: Some(dir.path().join("BOOTX64.EFI")),
            image: dir.path().join("disk.img"),
            ..RunConfig::from_env(Transport::Nvme)
        };
        let err = execute(&config, &Capabilities::from_parts([], false)).unwrap_err();
        assert!(err.to_string().contains("firmware ROM"));
        assert!(!config.image.exists());
    }

    #[test]
    fn missing_tools_fail_before_the_image_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("coreboot.rom");
        let payload = dir.path().join("BOOTX64.EFI");
        std::fs::write(&firmware, b"rom").unwrap();
        std::fs::write(&payload, b"MZ").unwrap();
        let config = RunConfig {
            firmware,
            payload: Some(payload),
            image: dir.path().join("disk.img"),
            ..RunConfig::from_env(Transport::UsbXhciMassStorage)
        };

        let err = execute(&config, &Capabilities::from_parts([], false)).unwrap_err();
        assert_eq!(err.phase(), "preconditions");
        assert!(err.to_string().contains("parted"));
        assert!(!config.image.exists());
    }

    #[test]
    fn emulator_exit_codes_pass_through() {
        let err = HarnessError::EmulatorExit {
            terminal: qemu::Terminal::Exited(42),
            serial_bytes: 0,
        };
        assert_eq!(exit_code(&Err(err)), 42);
        let err = HarnessError::EmulatorExit {
            terminal: qemu::Terminal::Cancelled,
            serial_bytes: 0,
        };
        assert_eq!(exit_code(&Err(err)), 130);
    }
}
