//! Privileged block-device operations.
//!
//! Binding an image to a loop device, formatting the partition and mounting
//! it all need root. [`BlockOps`] is the seam: [`NativeOps`] talks to the
//! kernel directly when we already are root, [`SudoOps`] shells out through
//! `sudo` otherwise. The pipeline never knows which one it got.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info};

use crate::deps::{Capabilities, Tool};
use crate::error::{HarnessError, PreconditionError, Result};
use crate::tool;

pub trait BlockOps: Send + Sync {
    /// Attach `image` to a free loop device with partition scanning enabled
    /// and return the loop device node.
    fn attach_loop(&self, image: &Path) -> Result<PathBuf>;

    /// Detach a loop device. Detaching an unbound device succeeds.
    fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Node the kernel creates for the first partition of `device`.
    fn partition_node(&self, device: &Path) -> PathBuf {
        let mut node = device.as_os_str().to_owned();
        node.push("p1");
        PathBuf::from(node)
    }

    fn format_fat32(&self, partition: &Path, label: &str) -> Result<()>;

    /// Mount a FAT volume at `dir`, writable by the invoking user.
    fn mount_fat(&self, partition: &Path, dir: &Path) -> Result<()>;

    /// Unmount `dir`. Unmounting something that is not mounted succeeds.
    fn unmount(&self, dir: &Path) -> Result<()>;

    fn is_mounted(&self, dir: &Path) -> bool {
        is_mount_point(dir)
    }
}

/// Pick the backend matching our privilege level.
pub fn select_ops(caps: &Capabilities) -> Result<Arc<dyn BlockOps>, PreconditionError> {
    caps.require(&caps.provisioning_tools())?;
    let mkfs = caps.resolve(Tool::MkfsFat)?;
    if caps.is_root() {
        info!("running as root, using direct loop/mount system calls");
        Ok(Arc::new(NativeOps::new(mkfs)))
    } else {
        info!("not running as root, privileged steps go through sudo");
        Ok(Arc::new(SudoOps {
            sudo: caps.resolve(Tool::Sudo)?,
            losetup: caps.resolve(Tool::Losetup)?,
            mkfs,
            mount: caps.resolve(Tool::Mount)?,
            umount: caps.resolve(Tool::Umount)?,
            // SAFETY: getuid/getgid have no preconditions and cannot fail.
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }))
    }
}

fn mkfs_command(program: &Path, partition: &Path, label: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-F", "32", "-n", label]).arg(partition);
    cmd
}

// linux/loop.h
const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_SET_STATUS64: u32 = 0x4C04;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;
const LO_FLAGS_PARTSCAN: u32 = 8;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn partscan(image: &Path) -> Self {
        let mut lo_file_name = [0u8; LO_NAME_SIZE];
        let name = image.as_os_str().as_bytes();
        let len = name.len().min(LO_NAME_SIZE - 1);
        lo_file_name[..len].copy_from_slice(&name[..len]);

        LoopInfo64 {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: LO_FLAGS_PARTSCAN,
            lo_file_name,
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Direct system calls; only usable as root.
pub struct NativeOps {
    mkfs: PathBuf,
}

impl NativeOps {
    pub fn new(mkfs: PathBuf) -> Self {
        NativeOps { mkfs }
    }
}

impl BlockOps for NativeOps {
    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let unavailable = |reason: String| HarnessError::BindUnavailable { reason };

        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")
            .map_err(|e| unavailable(format!("/dev/loop-control: {e}")))?;
        // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns an index or -1.
        let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if index < 0 {
            return Err(unavailable(io::Error::last_os_error().to_string()));
        }

        let device = PathBuf::from(format!("/dev/loop{index}"));
        let loop_file = OpenOptions::new().read(true).write(true).open(&device)?;
        let backing = OpenOptions::new().read(true).write(true).open(image)?;

        let loop_fd = loop_file.as_raw_fd();
        // SAFETY: both descriptors are open for the duration of the call.
        if unsafe { libc::ioctl(loop_fd, LOOP_SET_FD as _, backing.as_raw_fd()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                // Another process grabbed the device between GET_FREE and SET_FD.
                return Err(unavailable(format!("{} was claimed concurrently", device.display())));
            }
            return Err(err.into());
        }

        let info = LoopInfo64::partscan(image);
        // SAFETY: `info` is a fully initialized loop_info64 that outlives the call.
        if unsafe { libc::ioctl(loop_fd, LOOP_SET_STATUS64 as _, &info as *const LoopInfo64) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: the device was bound above.
            unsafe { libc::ioctl(loop_fd, LOOP_CLR_FD as _, 0) };
            return Err(err.into());
        }

        debug!(device = %device.display(), image = %image.display(), "loop device configured");
        Ok(device)
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        let loop_file = match OpenOptions::new().read(true).open(device) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        // SAFETY: LOOP_CLR_FD ignores its argument.
        if unsafe { libc::ioctl(loop_file.as_raw_fd(), LOOP_CLR_FD as _, 0) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENXIO) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn format_fat32(&self, partition: &Path, label: &str) -> Result<()> {
        tool::run(&mut mkfs_command(&self.mkfs, partition, label))?;
        Ok(())
    }

    fn mount_fat(&self, partition: &Path, dir: &Path) -> Result<()> {
        let source = c_path(partition)?;
        let target = c_path(dir)?;
        // SAFETY: every pointer refers to a NUL-terminated string alive across the call.
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                b"vfat\0".as_ptr().cast(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn unmount(&self, dir: &Path) -> Result<()> {
        let target = c_path(dir)?;
        // SAFETY: `target` is NUL-terminated and alive across the call.
        if unsafe { libc::umount2(target.as_ptr(), 0) } < 0 {
            let err = io::Error::last_os_error();
            // EINVAL: not a mount point.
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

/// Subprocess backend escalating through `sudo`.
pub struct SudoOps {
    sudo: PathBuf,
    losetup: PathBuf,
    mkfs: PathBuf,
    mount: PathBuf,
    umount: PathBuf,
    uid: u32,
    gid: u32,
}

impl SudoOps {
    fn sudo(&self, program: &Path) -> Command {
        let mut cmd = Command::new(&self.sudo);
        cmd.arg("--").arg(program);
        cmd
    }
}

impl BlockOps for SudoOps {
    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let mut cmd = self.sudo(&self.losetup);
        cmd.args(["--find", "--show", "--partscan"]).arg(image);
        let output = tool::run(&mut cmd).map_err(|failure| {
            if failure.stderr.contains("could not find any free loop device")
                || failure.stderr.contains("No such device")
            {
                HarnessError::BindUnavailable {
                    reason: failure.stderr.clone(),
                }
            } else {
                failure.into()
            }
        })?;

        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(HarnessError::BindUnavailable {
                reason: "losetup did not report a device".into(),
            });
        }
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        let mut cmd = self.sudo(&self.losetup);
        cmd.arg("--detach").arg(device);
        match tool::run(&mut cmd) {
            Ok(_) => Ok(()),
            Err(failure) if failure.stderr.contains("No such device") => Ok(()),
            Err(failure) => Err(failure.into()),
        }
    }

    fn format_fat32(&self, partition: &Path, label: &str) -> Result<()> {
        let mkfs = mkfs_command(&self.mkfs, partition, label);
        let mut cmd = self.sudo(mkfs.get_program().as_ref());
        cmd.args(mkfs.get_args());
        tool::run(&mut cmd)?;
        Ok(())
    }

    fn mount_fat(&self, partition: &Path, dir: &Path) -> Result<()> {
        let mut cmd = self.sudo(&self.mount);
        cmd.args(["-t", "vfat", "-o"])
            .arg(format!("uid={},gid={}", self.uid, self.gid))
            .arg(partition)
            .arg(dir);
        tool::run(&mut cmd)?;
        Ok(())
    }

    fn unmount(&self, dir: &Path) -> Result<()> {
        if !self.is_mounted(dir) {
            return Ok(());
        }
        let mut cmd = self.sudo(&self.umount);
        cmd.arg(dir);
        tool::run(&mut cmd)?;
        Ok(())
    }
}

/// Whether `dir` appears as a mount point in `/proc/self/mountinfo`.
pub fn is_mount_point(dir: &Path) -> bool {
    let Ok(table) = fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let found = mount_points(&table).any(|mp| mp == dir);
    found
}

fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// mountinfo escapes space, tab, newline and backslash as `\ooo`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let digit = |k: usize| bytes[i + k] - b'0';
            let value = digit(1) * 64 + digit(2) * 8 + digit(3);
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_partition_node_gets_p1_suffix() {
        let ops = NativeOps::new(PathBuf::from("/usr/sbin/mkfs.fat"));
        assert_eq!(ops.partition_node(Path::new("/dev/loop7")), PathBuf::from("/dev/loop7p1"));
    }

    #[test]
    fn loop_info_layout_matches_the_kernel_abi() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
        let info = LoopInfo64::partscan(Path::new("/tmp/disk.img"));
        assert_eq!(info.lo_flags, LO_FLAGS_PARTSCAN);
        assert_eq!(&info.lo_file_name[..13], b"/tmp/disk.img");
        assert_eq!(info.lo_file_name[13], 0);
    }

    #[test]
    fn mountinfo_fields_are_unescaped() {
        let table = "\
36 35 98:0 / /mnt/with\\040space rw,noatime master:1 - ext3 /dev/root rw
37 35 7:1 / /tmp/bootdisk-esp-abc rw - vfat /dev/loop0p1 rw
";
        let points: Vec<_> = mount_points(table).collect();
        assert_eq!(
            points,
            vec![PathBuf::from("/mnt/with space"), PathBuf::from("/tmp/bootdisk-esp-abc")]
        );
    }

    #[test]
    fn root_is_always_mounted() {
        assert!(is_mount_point(Path::new("/")));
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()));
    }

    #[test]
    fn sudo_backend_requires_the_helper() {
        let caps = Capabilities::from_parts(
            [
                (Tool::Parted, PathBuf::from("/usr/sbin/parted")),
                (Tool::MkfsFat, PathBuf::from("/usr/sbin/mkfs.fat")),
            ],
            false,
        );
        match select_ops(&caps) {
            Err(PreconditionError::MissingTool { tool, .. }) => assert_eq!(tool, "sudo"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("sudo backend selected without sudo"),
        }
        let root = Capabilities::from_parts(
            [
                (Tool::Parted, PathBuf::from("/usr/sbin/parted")),
                (Tool::MkfsFat, PathBuf::from("/usr/sbin/mkfs.fat")),
            ],
            true,
        );
        assert!(select_ops(&root).is_ok());
    }
}
