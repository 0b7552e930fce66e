//! The provisioning pipeline: allocate, partition, bind, populate, unbind.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cleanup::CleanupStack;
use crate::deps::{Capabilities, Tool};
use crate::error::{PreconditionError, Result};
use crate::esp::{BootPayload, FilesystemProvisioner, VolumeFile, VOLUME_LABEL};
use crate::gpt::{self, GptLayout};
use crate::image::{self, DiskImage, MIB};
use crate::loopdev::{BlockDeviceBinder, POLL_INTERVAL, POLL_TIMEOUT};
use crate::partition::{PartitionPlanner, PartitionSpec};
use crate::privilege::{self, BlockOps};

pub const DEFAULT_IMAGE: &str = "target/test-disk.img";
pub const DEFAULT_SIZE: u64 = 64 * MIB;

const REMOVE_IMAGE: &str = "remove-image";
const UNBIND: &str = "unbind";

#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub output: PathBuf,
    pub payload: PathBuf,
    pub size_bytes: u64,
    pub startup_script: bool,
    pub label: String,
    /// Delete the image if any later phase fails. Off by default so a broken
    /// image can be inspected.
    pub remove_on_failure: bool,
}

impl DiskConfig {
    pub fn new(payload: impl Into<PathBuf>) -> Self {
        DiskConfig {
            output: PathBuf::from(DEFAULT_IMAGE),
            payload: payload.into(),
            size_bytes: DEFAULT_SIZE,
            startup_script: true,
            label: VOLUME_LABEL.to_string(),
            remove_on_failure: false,
        }
    }

    /// Every input file the build reads. Checked before any side effect.
    pub fn check_inputs(&self) -> Result<(), PreconditionError> {
        if !self.payload.is_file() {
            return Err(PreconditionError::MissingInput {
                what: "boot payload",
                path: self.payload.clone(),
            });
        }
        Ok(())
    }

    fn load_payload(&self) -> Result<BootPayload> {
        let payload = BootPayload::from_file(&self.payload)?;
        Ok(if self.startup_script {
            payload
        } else {
            payload.without_startup_script()
        })
    }
}

/// Numbered progress output: `[k/total] description`.
pub struct Phases {
    current: usize,
    total: usize,
    report: Box<dyn FnMut(&str)>,
}

impl Phases {
    /// Print phases to stdout.
    pub fn new(total: usize) -> Self {
        Self::with_reporter(total, |line| println!("{line}"))
    }

    pub fn with_reporter(total: usize, report: impl FnMut(&str) + 'static) -> Self {
        Phases {
            current: 0,
            total,
            report: Box::new(report),
        }
    }

    pub fn quiet(total: usize) -> Self {
        Self::with_reporter(total, |_| {})
    }

    pub fn begin(&mut self, description: &str) {
        self.current += 1;
        let line = format!("[{}/{}] {description}", self.current, self.total);
        info!(phase = self.current, total = self.total, "{description}");
        (self.report)(&line);
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// What `verify` found on an image.
#[derive(Debug, Clone)]
pub struct Verification {
    pub layout: GptLayout,
    pub files: Vec<VolumeFile>,
}

pub struct DiskBuilder {
    ops: Arc<dyn BlockOps>,
    parted: PathBuf,
    mount_parent: Option<PathBuf>,
    poll_interval: Duration,
    bind_timeout: Duration,
}

impl DiskBuilder {
    /// Phases printed by [`build`](Self::build).
    pub const PHASES: usize = 5;

    /// Resolve every provisioning tool, failing before any side effect if
    /// one is missing.
    pub fn from_capabilities(caps: &Capabilities) -> Result<Self, PreconditionError> {
        let ops = privilege::select_ops(caps)?;
        Ok(Self::with_ops(ops, caps.resolve(Tool::Parted)?))
    }

    pub fn with_ops(ops: Arc<dyn BlockOps>, parted: PathBuf) -> Self {
        DiskBuilder {
            ops,
            parted,
            mount_parent: None,
            poll_interval: POLL_INTERVAL,
            bind_timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_mount_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mount_parent = Some(dir.into());
        self
    }

    pub fn with_bind_timeout(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.bind_timeout = timeout;
        self
    }

    fn binder(&self) -> BlockDeviceBinder {
        BlockDeviceBinder::new(self.ops.clone()).with_timeout(self.poll_interval, self.bind_timeout)
    }

    fn provisioner(&self, label: &str) -> FilesystemProvisioner {
        let provisioner = FilesystemProvisioner::new(self.ops.clone()).with_label(label);
        match &self.mount_parent {
            Some(dir) => provisioner.with_mount_parent(dir),
            None => provisioner,
        }
    }

    /// Build a bootable image as described by `config`.
    pub fn build(&self, config: &DiskConfig, phases: &mut Phases) -> Result<DiskImage> {
        config.check_inputs()?;
        let payload = config.load_payload()?;

        let mut cleanup = CleanupStack::new();

        phases.begin(&format!(
            "Allocating {} MiB image at {}",
            config.size_bytes / MIB,
            config.output.display()
        ));
        let image = image::allocate(&config.output, config.size_bytes)?;
        if config.remove_on_failure {
            let path = image.path().to_path_buf();
            cleanup.push(REMOVE_IMAGE, move || Ok(fs::remove_file(&path)?));
        }

        phases.begin("Writing GPT label with EFI System Partition");
        PartitionPlanner::new(self.parted.clone()).plan(&image, &PartitionSpec::esp())?;

        self.install_phased(&image, &payload, &config.label, phases, &mut cleanup)?;

        cleanup.disarm(REMOVE_IMAGE);
        info!(path = %image.path().display(), size_bytes = image.size_bytes(), "image ready");
        Ok(image)
    }

    /// Install `payload` on an already partitioned image.
    pub fn install(&self, image: &DiskImage, payload: &BootPayload) -> Result<()> {
        let mut cleanup = CleanupStack::new();
        self.install_phased(image, payload, VOLUME_LABEL, &mut Phases::quiet(3), &mut cleanup)
    }

    fn install_phased(
        &self,
        image: &DiskImage,
        payload: &BootPayload,
        label: &str,
        phases: &mut Phases,
        cleanup: &mut CleanupStack,
    ) -> Result<()> {
        phases.begin("Binding image to a loop device");
        let partition = self.bind(image, cleanup)?;

        phases.begin(&format!(
            "Formatting {} as FAT32 and installing payload",
            partition.display()
        ));
        let provisioned = self.provisioner(label).provision(&partition, payload);

        phases.begin("Releasing loop device");
        let unbound = cleanup.release(UNBIND);
        provisioned?;
        unbound
    }

    /// Bind `image` and register the unbind on `cleanup`. Returns the
    /// partition node.
    fn bind(&self, image: &DiskImage, cleanup: &mut CleanupStack) -> Result<PathBuf> {
        let mut binding = self.binder().bind(image)?;
        let partition = binding.partition().to_path_buf();
        cleanup.push(UNBIND, move || binding.unbind());
        Ok(partition)
    }

    /// Read the partition table and every file on the ESP.
    pub fn verify(&self, image: &DiskImage) -> Result<Verification> {
        let layout = gpt::read_layout(image.path())?;
        let mut cleanup = CleanupStack::new();
        let partition = self.bind(image, &mut cleanup)?;
        let files = self.provisioner(VOLUME_LABEL).read_back(&partition);
        let unbound = cleanup.release(UNBIND);
        let files = files?;
        unbound?;
        Ok(Verification { layout, files })
    }
}

/// Directory holding the workspace `Cargo.toml`, or the current directory
/// when there is none above it.
pub fn workspace_root() -> PathBuf {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut current: &Path = &cwd;
    loop {
        let manifest = current.join("Cargo.toml");
        if fs::read_to_string(&manifest).is_ok_and(|content| content.contains("[workspace]")) {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return cwd.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn phases_are_numbered() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        let mut phases =
            Phases::with_reporter(2, move |line| sink.borrow_mut().push(line.to_string()));
        phases.begin("Allocating");
        phases.begin("Partitioning");
        assert_eq!(*lines.borrow(), ["[1/2] Allocating", "[2/2] Partitioning"]);
    }

    #[test]
    fn defaults_match_the_fixture_layout() {
        let config = DiskConfig::new("BOOTX64.EFI");
        assert_eq!(config.output, Path::new("target/test-disk.img"));
        assert_eq!(config.size_bytes, 64 * MIB);
        assert_eq!(config.label, "ESP");
        assert!(config.startup_script);
        assert!(!config.remove_on_failure);
    }

    #[test]
    fn missing_payload_fails_the_input_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskConfig::new(dir.path().join("BOOTX64.EFI"));
        let err = config.check_inputs().unwrap_err();
        assert!(err.to_string().contains("boot payload"));
    }

    #[test]
    fn workspace_root_holds_a_workspace_manifest() {
        let root = workspace_root();
        let manifest = fs::read_to_string(root.join("Cargo.toml")).unwrap();
        assert!(manifest.contains("[workspace]"));
    }
}
