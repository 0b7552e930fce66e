//! Bootable disk-image fixtures for firmware testing.
//!
//! The pipeline builds a raw GPT image with a single FAT32 EFI System
//! Partition holding a boot payload, then boots firmware against it in QEMU
//! over a selectable storage transport:
//!
//! ```text
//! image::allocate -> PartitionPlanner::plan -> BlockDeviceBinder::bind
//!     -> FilesystemProvisioner::provision -> LoopBinding::unbind
//!     -> EmulatorHarness::run
//! ```
//!
//! [`disk::DiskBuilder`] runs the provisioning half, [`runner::execute`]
//! the whole thing.

pub mod cleanup;
pub mod deps;
pub mod disk;
pub mod error;
pub mod esp;
pub mod gpt;
pub mod image;
pub mod loopdev;
pub mod partition;
pub mod privilege;
pub mod qemu;
pub mod runner;
pub mod tool;
pub mod transport;

pub use error::{HarnessError, PreconditionError, Result};

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` overrides the default
/// `info` level. Calling this twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
