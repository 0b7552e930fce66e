//! EFI System Partition population.
//!
//! ## Volume contents
//!
//! - `/EFI/BOOT/BOOTX64.EFI` - the boot payload (removable-media default path)
//! - `/startup.nsh` - optional shell script that launches the payload
//!
//! Every step that acquires something (mount point, mount) pushes its
//! release onto a [`CleanupStack`], so a failure at any later step still
//! unmounts the volume and removes the mount point.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cleanup::CleanupStack;
use crate::error::{HarnessError, PreconditionError, Result};
use crate::privilege::BlockOps;

pub const PAYLOAD_PATH: &str = "EFI/BOOT/BOOTX64.EFI";
pub const STARTUP_SCRIPT_PATH: &str = "startup.nsh";
pub const STARTUP_SCRIPT: &str = "@echo -off\r\nfs0:\r\n\\EFI\\BOOT\\BOOTX64.EFI\r\n";
pub const VOLUME_LABEL: &str = "ESP";

const UNMOUNT: &str = "unmount";
const REMOVE_MOUNT_POINT: &str = "remove-mount-point";

/// Provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Format,
    CreateMountPoint,
    Mount,
    CreateBootDir,
    WritePayload,
    WriteStartupScript,
    Sync,
    Unmount,
    RemoveMountPoint,
    ReadBack,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::Format => "format",
            Step::CreateMountPoint => "create-mount-point",
            Step::Mount => "mount",
            Step::CreateBootDir => "create-boot-dir",
            Step::WritePayload => "write-payload",
            Step::WriteStartupScript => "write-startup-script",
            Step::Sync => "sync",
            Step::Unmount => "unmount",
            Step::RemoveMountPoint => "remove-mount-point",
            Step::ReadBack => "read-back",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What gets installed on the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPayload {
    pub bytes: Vec<u8>,
    /// Relative to the volume root. A leading `/` is accepted; any `..`
    /// component fails provisioning.
    pub install_path: PathBuf,
    pub startup_script: Option<String>,
}

impl BootPayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        BootPayload {
            bytes,
            install_path: PathBuf::from(PAYLOAD_PATH),
            startup_script: Some(STARTUP_SCRIPT.to_string()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PreconditionError::MissingInput {
                what: "boot payload",
                path: path.to_path_buf(),
            }
            .into());
        }
        Ok(Self::new(fs::read(path)?))
    }

    pub fn without_startup_script(mut self) -> Self {
        self.startup_script = None;
        self
    }
}

/// A file found on a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFile {
    /// Relative to the volume root.
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

/// A mounted partition. Lives only inside one provisioning operation.
struct MountHandle {
    dir: PathBuf,
    device: PathBuf,
}

pub struct FilesystemProvisioner {
    ops: Arc<dyn BlockOps>,
    label: String,
    mount_parent: Option<PathBuf>,
}

impl FilesystemProvisioner {
    pub fn new(ops: Arc<dyn BlockOps>) -> Self {
        FilesystemProvisioner {
            ops,
            label: VOLUME_LABEL.to_string(),
            mount_parent: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Create mount points under `dir` instead of the system temp directory.
    pub fn with_mount_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mount_parent = Some(dir.into());
        self
    }

    /// Format `partition` as FAT32 and install `payload` on it. On return,
    /// successful or not, the partition is unmounted and the mount point
    /// directory is gone.
    pub fn provision(&self, partition: &Path, payload: &BootPayload) -> Result<()> {
        let mut cleanup = CleanupStack::new();
        let result = self.populate(partition, payload, &mut cleanup);
        if result.is_err() {
            cleanup.unwind();
        }
        result
    }

    fn populate(
        &self,
        partition: &Path,
        payload: &BootPayload,
        cleanup: &mut CleanupStack,
    ) -> Result<()> {
        let relative = volume_relative(&payload.install_path).ok_or_else(|| {
            let msg = format!(
                "install path {} is not inside the volume",
                payload.install_path.display()
            );
            HarnessError::provisioning(
                Step::WritePayload,
                io::Error::new(io::ErrorKind::InvalidInput, msg),
            )
        })?;

        self.ops
            .format_fat32(partition, &self.label)
            .map_err(|e| HarnessError::provisioning(Step::Format, e))?;

        let mount = self.mount(partition, cleanup)?;
        let target = mount.dir.join(&relative);
        let boot_dir = target.parent().unwrap_or(mount.dir.as_path()).to_path_buf();

        fs::create_dir_all(&boot_dir)
            .map_err(|e| HarnessError::provisioning(Step::CreateBootDir, e))?;
        write_durable(&target, &payload.bytes)
            .map_err(|e| HarnessError::provisioning(Step::WritePayload, e))?;
        info!(path = %relative.display(), bytes = payload.bytes.len(), "installed payload");

        if let Some(script) = &payload.startup_script {
            write_durable(&mount.dir.join(STARTUP_SCRIPT_PATH), script.as_bytes())
                .map_err(|e| HarnessError::provisioning(Step::WriteStartupScript, e))?;
            info!(path = STARTUP_SCRIPT_PATH, "installed startup script");
        }

        // Directory entries must be durable too, not just file data.
        for dir in boot_dir.ancestors().take_while(|d| d.starts_with(&mount.dir)) {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| HarnessError::provisioning(Step::Sync, e))?;
        }

        self.release(cleanup, &mount)
    }

    /// Mount `partition` independently and return every regular file on it.
    pub fn read_back(&self, partition: &Path) -> Result<Vec<VolumeFile>> {
        let mut cleanup = CleanupStack::new();
        let result = self.mount(partition, &mut cleanup).and_then(|mount| {
            let mut files = Vec::new();
            collect_files(&mount.dir, &mount.dir, &mut files)
                .map_err(|e| HarnessError::provisioning(Step::ReadBack, e))?;
            self.release(&mut cleanup, &mount)?;
            Ok(files)
        });
        if result.is_err() {
            cleanup.unwind();
        }
        result
    }

    fn mount(&self, partition: &Path, cleanup: &mut CleanupStack) -> Result<MountHandle> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bootdisk-esp-");
        let tmp = match &self.mount_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| HarnessError::provisioning(Step::CreateMountPoint, e))?;
        // Removal must never recurse into a still-mounted volume, so the
        // directory is released with a plain rmdir instead of TempDir's drop.
        let dir = tmp.keep();
        {
            let dir = dir.clone();
            cleanup.push(REMOVE_MOUNT_POINT, move || {
                fs::remove_dir(&dir)
                    .map_err(|e| HarnessError::provisioning(Step::RemoveMountPoint, e))
            });
        }

        if let Err(err) = self.ops.mount_fat(partition, &dir) {
            if self.ops.is_mounted(&dir) {
                if let Err(unmount) = self.ops.unmount(&dir) {
                    warn!(
                        dir = %dir.display(),
                        error = %unmount,
                        "unmount after failed mount failed"
                    );
                }
            }
            return Err(HarnessError::provisioning(Step::Mount, err));
        }
        {
            let ops = self.ops.clone();
            let dir = dir.clone();
            cleanup.push(UNMOUNT, move || {
                ops.unmount(&dir).map_err(|e| HarnessError::provisioning(Step::Unmount, e))
            });
        }

        info!(device = %partition.display(), dir = %dir.display(), "mounted volume");
        Ok(MountHandle {
            dir,
            device: partition.to_path_buf(),
        })
    }

    fn release(&self, cleanup: &mut CleanupStack, mount: &MountHandle) -> Result<()> {
        cleanup.release(UNMOUNT)?;
        cleanup.release(REMOVE_MOUNT_POINT)?;
        info!(device = %mount.device.display(), "unmounted volume");
        Ok(())
    }
}

/// `path` below the volume root, or `None` if it names the root itself or
/// has anything but plain components after an optional leading `/`.
fn volume_relative(path: &Path) -> Option<PathBuf> {
    let path = path.strip_prefix("/").unwrap_or(path);
    let relative: PathBuf = path
        .components()
        .map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!relative.as_os_str().is_empty()).then_some(relative)
}

fn write_durable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<VolumeFile>) -> std::io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(VolumeFile {
                path: path.strip_prefix(root).unwrap_or(&path).to_path_buf(),
                contents: fs::read(&path)?,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_payload_targets_the_removable_media_path() {
        let payload = BootPayload::new(vec![0x4D, 0x5A]);
        assert_eq!(payload.install_path, Path::new("EFI/BOOT/BOOTX64.EFI"));
        assert!(payload.startup_script.as_deref().unwrap().contains("\\EFI\\BOOT\\BOOTX64.EFI"));
        assert!(payload.without_startup_script().startup_script.is_none());
    }

    #[test]
    fn missing_payload_is_a_precondition_failure() {
        let err = BootPayload::from_file(Path::new("/nonexistent/BOOTX64.EFI")).unwrap_err();
        assert_eq!(err.phase(), "preconditions");
    }

    #[test]
    fn collects_nested_files_relative_to_the_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("EFI/BOOT")).unwrap();
        fs::write(dir.path().join("EFI/BOOT/BOOTX64.EFI"), b"payload").unwrap();
        fs::write(dir.path().join("startup.nsh"), b"script").unwrap();

        let mut files = Vec::new();
        collect_files(dir.path(), dir.path(), &mut files).unwrap();
        assert_eq!(
            files,
            vec![
                VolumeFile {
                    path: PathBuf::from("EFI/BOOT/BOOTX64.EFI"),
                    contents: b"payload".to_vec(),
                },
                VolumeFile {
                    path: PathBuf::from("startup.nsh"),
                    contents: b"script".to_vec(),
                },
            ]
        );
    }

    /// Mounting is a no-op; unmounting moves whatever was written to the
    /// mount point into `volume`.
    struct DirVolume {
        volume: PathBuf,
        formats: AtomicUsize,
    }

    impl BlockOps for DirVolume {
        fn attach_loop(&self, _image: &Path) -> Result<PathBuf> {
            Err(io::Error::other("no loop devices here").into())
        }

        fn detach_loop(&self, _device: &Path) -> Result<()> {
            Ok(())
        }

        fn format_fat32(&self, _partition: &Path, _label: &str) -> Result<()> {
            self.formats.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(&self.volume)?;
            Ok(())
        }

        fn mount_fat(&self, _partition: &Path, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn unmount(&self, dir: &Path) -> Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                fs::rename(entry.path(), self.volume.join(entry.file_name()))?;
            }
            Ok(())
        }

        fn is_mounted(&self, _dir: &Path) -> bool {
            false
        }
    }

    fn dir_volume(root: &Path) -> (Arc<DirVolume>, FilesystemProvisioner) {
        fs::create_dir(root.join("mnt")).unwrap();
        let ops = Arc::new(DirVolume {
            volume: root.join("volume"),
            formats: AtomicUsize::new(0),
        });
        let provisioner =
            FilesystemProvisioner::new(ops.clone()).with_mount_parent(root.join("mnt"));
        (ops, provisioner)
    }

    #[test]
    fn install_paths_are_kept_below_the_volume_root() {
        assert_eq!(
            volume_relative(Path::new("/EFI/BOOT/BOOTX64.EFI")).unwrap(),
            Path::new("EFI/BOOT/BOOTX64.EFI")
        );
        assert_eq!(
            volume_relative(Path::new("EFI/BOOT/BOOTX64.EFI")).unwrap(),
            Path::new("EFI/BOOT/BOOTX64.EFI")
        );
        assert_eq!(volume_relative(Path::new("EFI/../../etc/passwd")), None);
        assert_eq!(volume_relative(Path::new("../BOOTX64.EFI")), None);
        assert_eq!(volume_relative(Path::new("/")), None);
        assert_eq!(volume_relative(Path::new("")), None);
    }

    #[test]
    fn absolute_install_path_lands_on_the_volume() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let (ops, provisioner) = dir_volume(root.path());

        let escape = outside.path().join("EFI/BOOT/BOOTX64.EFI");
        let payload = BootPayload {
            install_path: escape.clone(),
            ..BootPayload::new(b"MZ".to_vec())
        };
        provisioner.provision(Path::new("/dev/fake0p1"), &payload).unwrap();

        assert!(!escape.exists());
        assert!(fs::read_dir(outside.path()).unwrap().next().is_none());
        let on_volume = ops.volume.join(escape.strip_prefix("/").unwrap());
        assert_eq!(fs::read(on_volume).unwrap(), b"MZ");
        assert!(fs::read_dir(root.path().join("mnt")).unwrap().next().is_none());
    }

    #[test]
    fn parent_components_fail_before_formatting() {
        let root = tempfile::tempdir().unwrap();
        let (ops, provisioner) = dir_volume(root.path());

        let payload = BootPayload {
            install_path: PathBuf::from("EFI/../../BOOTX64.EFI"),
            ..BootPayload::new(b"MZ".to_vec())
        };
        let err = provisioner.provision(Path::new("/dev/fake0p1"), &payload).unwrap_err();

        assert!(matches!(err, HarnessError::Provisioning { step: Step::WritePayload, .. }));
        assert_eq!(ops.formats.load(Ordering::SeqCst), 0);
        assert!(!root.path().join("BOOTX64.EFI").exists());
        assert!(fs::read_dir(root.path().join("mnt")).unwrap().next().is_none());
    }

    #[test]
    fn step_names_are_stable() {
        assert_eq!(Step::WritePayload.to_string(), "write-payload");
        assert_eq!(Step::RemoveMountPoint.name(), "remove-mount-point");
    }
}
