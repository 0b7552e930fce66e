//! Binding images to loop devices.
//!
//! The kernel enumerates partition nodes asynchronously after a loop device
//! is configured, so [`BlockDeviceBinder::bind`] polls for the node with a
//! bounded timeout instead of sleeping a fixed amount.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::image::DiskImage;
use crate::privilege::BlockOps;

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Images bound by this process, keyed by canonical image path.
static ACTIVE: Mutex<BTreeMap<PathBuf, PathBuf>> = Mutex::new(BTreeMap::new());

fn registry() -> MutexGuard<'static, BTreeMap<PathBuf, PathBuf>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn registry_key(image: &Path) -> PathBuf {
    image.canonicalize().unwrap_or_else(|_| image.to_path_buf())
}

/// Whether this process currently holds a binding for `image`.
pub fn is_bound(image: &Path) -> bool {
    registry().contains_key(&registry_key(image))
}

/// Snapshot of this process's bindings as (image, loop device) pairs.
pub fn active_bindings() -> Vec<(PathBuf, PathBuf)> {
    registry().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Every configured loop device on the host with its backing file, read from
/// sysfs. Readable without privileges.
pub fn system_loop_devices() -> io::Result<Vec<(PathBuf, PathBuf)>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("loop") {
            continue;
        }
        match fs::read_to_string(entry.path().join("loop/backing_file")) {
            Ok(backing) => devices.push((
                PathBuf::from(format!("/dev/{name}")),
                PathBuf::from(backing.trim_end()),
            )),
            // Unconfigured devices have no `loop/` directory.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    devices.sort();
    Ok(devices)
}

pub struct BlockDeviceBinder {
    ops: Arc<dyn BlockOps>,
    poll_interval: Duration,
    timeout: Duration,
}

impl BlockDeviceBinder {
    pub fn new(ops: Arc<dyn BlockOps>) -> Self {
        BlockDeviceBinder {
            ops,
            poll_interval: POLL_INTERVAL,
            timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Attach `image` to a free loop device and wait for its first
    /// partition node. At most one binding per image may exist.
    pub fn bind(&self, image: &DiskImage) -> Result<LoopBinding> {
        let key = image.path().canonicalize()?;
        {
            let mut active = registry();
            if let Some(loop_device) = active.get(&key) {
                return Err(HarnessError::BindConflict {
                    image: key,
                    loop_device: loop_device.clone(),
                });
            }
            // Reserve the slot while attaching.
            active.insert(key.clone(), PathBuf::new());
        }

        let loop_device = match self.ops.attach_loop(&key) {
            Ok(device) => device,
            Err(err) => {
                registry().remove(&key);
                return Err(err);
            }
        };
        registry().insert(key.clone(), loop_device.clone());

        let partition = self.ops.partition_node(&loop_device);
        let mut binding = LoopBinding {
            image: key,
            loop_device,
            partition,
            ops: self.ops.clone(),
            attached: true,
        };

        debug!(node = %binding.partition.display(), "waiting for partition node");
        if !wait_for_node(&binding.partition, self.poll_interval, self.timeout) {
            let err = HarnessError::BindTimeout {
                loop_device: binding.loop_device.clone(),
                node: binding.partition.clone(),
                waited: self.timeout,
            };
            if let Err(cleanup) = binding.unbind() {
                warn!(error = %cleanup, "detaching after timeout failed");
            }
            return Err(err);
        }

        info!(
            image = %binding.image.display(),
            device = %binding.loop_device.display(),
            partition = %binding.partition.display(),
            "bound image"
        );
        Ok(binding)
    }

    pub fn unbind(&self, binding: &mut LoopBinding) -> Result<()> {
        binding.unbind()
    }
}

/// Poll for `node` until it exists or `timeout` elapses.
fn wait_for_node(node: &Path, interval: Duration, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if node.exists() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}

/// An image attached to a loop device. Detaches on drop if still attached.
pub struct LoopBinding {
    image: PathBuf,
    loop_device: PathBuf,
    partition: PathBuf,
    ops: Arc<dyn BlockOps>,
    attached: bool,
}

impl LoopBinding {
    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn loop_device(&self) -> &Path {
        &self.loop_device
    }

    pub fn partition(&self) -> &Path {
        &self.partition
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Detach the loop device. Calling this again is a no-op.
    pub fn unbind(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.ops.detach_loop(&self.loop_device)?;
        self.attached = false;
        registry().remove(&self.image);
        info!(device = %self.loop_device.display(), "unbound image");
        Ok(())
    }
}

impl Drop for LoopBinding {
    fn drop(&mut self) {
        if let Err(err) = self.unbind() {
            warn!(
                device = %self.loop_device.display(),
                error = %err,
                "failed to detach loop device"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{self, MIB};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pretends to be the kernel: "attaching" creates a node file in a
    /// scratch directory, optionally along with its partition node.
    struct FakeLoop {
        dir: PathBuf,
        create_partition: bool,
        attaches: AtomicUsize,
        detaches: AtomicUsize,
    }

    impl FakeLoop {
        fn new(dir: &Path, create_partition: bool) -> Arc<Self> {
            Arc::new(FakeLoop {
                dir: dir.to_path_buf(),
                create_partition,
                attaches: AtomicUsize::new(0),
                detaches: AtomicUsize::new(0),
            })
        }
    }

    impl BlockOps for FakeLoop {
        fn attach_loop(&self, _image: &Path) -> Result<PathBuf> {
            let n = self.attaches.fetch_add(1, Ordering::SeqCst);
            let device = self.dir.join(format!("loop{n}"));
            fs::write(&device, b"")?;
            if self.create_partition {
                fs::write(self.partition_node(&device), b"")?;
            }
            Ok(device)
        }

        fn detach_loop(&self, device: &Path) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            let _ = fs::remove_file(self.partition_node(device));
            let _ = fs::remove_file(device);
            Ok(())
        }

        fn format_fat32(&self, _partition: &Path, _label: &str) -> Result<()> {
            Ok(())
        }

        fn mount_fat(&self, _partition: &Path, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn unmount(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bind_then_unbind_leaves_no_registration() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), MIB).unwrap();
        let ops = FakeLoop::new(dir.path(), true);
        let binder = BlockDeviceBinder::new(ops.clone());

        let mut binding = binder.bind(&image).unwrap();
        assert!(is_bound(image.path()));
        assert!(binding.partition().to_string_lossy().ends_with("loop0p1"));

        binder.unbind(&mut binding).unwrap();
        binder.unbind(&mut binding).unwrap();
        assert!(!is_bound(image.path()));
        assert!(!binding.is_attached());
        assert_eq!(ops.detaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_bind_of_the_same_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), MIB).unwrap();
        let ops = FakeLoop::new(dir.path(), true);
        let binder = BlockDeviceBinder::new(ops.clone());

        let _held = binder.bind(&image).unwrap();
        let err = binder.bind(&image).err().unwrap();
        assert!(matches!(err, HarnessError::BindConflict { .. }));
        assert_eq!(ops.attaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_partition_node_times_out_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), MIB).unwrap();
        let ops = FakeLoop::new(dir.path(), false);
        let binder = BlockDeviceBinder::new(ops.clone())
            .with_timeout(Duration::from_millis(10), Duration::from_millis(100));

        let start = Instant::now();
        let err = binder.bind(&image).err().unwrap();
        assert!(matches!(err, HarnessError::BindTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(ops.detaches.load(Ordering::SeqCst), 1);
        assert!(!is_bound(image.path()));
    }

    #[test]
    fn dropping_a_binding_detaches_it() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), MIB).unwrap();
        let ops = FakeLoop::new(dir.path(), true);
        let binder = BlockDeviceBinder::new(ops.clone());

        drop(binder.bind(&image).unwrap());
        assert_eq!(ops.detaches.load(Ordering::SeqCst), 1);
        assert!(!is_bound(image.path()));
    }

    #[test]
    fn node_poll_returns_as_soon_as_the_node_appears() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("loop9p1");
        let writer = {
            let node = node.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                fs::write(node, b"").unwrap();
            })
        };
        let start = Instant::now();
        assert!(wait_for_node(&node, POLL_INTERVAL, POLL_TIMEOUT));
        assert!(start.elapsed() < POLL_TIMEOUT);
        writer.join().unwrap();
    }
}
