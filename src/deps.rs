//! External dependency discovery.
//!
//! Every tool the pipeline shells out to is resolved once, up front, into a
//! [`Capabilities`] map. Nothing touches the disk until the map says the
//! required tools are present.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::PreconditionError;

/// Overrides the search path used for tool discovery.
pub const TOOL_PATH_ENV: &str = "BOOTDISK_PATH";

/// Directories searched after `PATH`; partitioning tools often live here and
/// unprivileged users frequently lack them in `PATH`.
const SBIN_DIRS: &str = "/usr/local/sbin:/usr/sbin:/sbin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tool {
    Parted,
    MkfsFat,
    Losetup,
    Mount,
    Umount,
    Sudo,
    Qemu,
}

impl Tool {
    pub const ALL: [Tool; 7] = [
        Tool::Parted,
        Tool::MkfsFat,
        Tool::Losetup,
        Tool::Mount,
        Tool::Umount,
        Tool::Sudo,
        Tool::Qemu,
    ];

    pub fn name(self) -> &'static str {
        self.candidates()[0]
    }

    fn candidates(self) -> &'static [&'static str] {
        match self {
            Tool::Parted => &["parted"],
            Tool::MkfsFat => &["mkfs.fat", "mkfs.vfat", "mkdosfs"],
            Tool::Losetup => &["losetup"],
            Tool::Mount => &["mount"],
            Tool::Umount => &["umount"],
            Tool::Sudo => &["sudo"],
            Tool::Qemu => &["qemu-system-x86_64"],
        }
    }

    /// Installation guidance shown when the tool is missing.
    pub fn hint(self) -> &'static str {
        match self {
            Tool::Parted => {
                "Install parted: sudo apt-get install parted (Fedora: sudo dnf install parted)"
            }
            Tool::MkfsFat => {
                "Install dosfstools: sudo apt-get install dosfstools (Fedora: sudo dnf install dosfstools)"
            }
            Tool::Losetup | Tool::Mount | Tool::Umount => {
                "Install util-linux: sudo apt-get install util-linux (Fedora: sudo dnf install util-linux)"
            }
            Tool::Sudo => {
                "Binding and mounting the image needs root. Install sudo (sudo apt-get install sudo) or run as root"
            }
            Tool::Qemu => {
                "Install QEMU: sudo apt-get install qemu-system-x86 (Fedora: sudo dnf install qemu-system-x86)"
            }
        }
    }
}

/// Which tools are available, and whether we already hold root.
#[derive(Debug, Clone)]
pub struct Capabilities {
    tools: BTreeMap<Tool, Option<PathBuf>>,
    is_root: bool,
}

impl Capabilities {
    /// Probe the host. Honors [`TOOL_PATH_ENV`] when set.
    pub fn detect() -> Self {
        let search = match env::var_os(TOOL_PATH_ENV) {
            Some(path) => path,
            None => {
                let mut path = env::var_os("PATH").unwrap_or_default();
                if !path.is_empty() {
                    path.push(":");
                }
                path.push(SBIN_DIRS);
                path
            }
        };
        // SAFETY: geteuid has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;
        Self::detect_in(&search, is_root)
    }

    /// Probe an explicit search path.
    pub fn detect_in(search: &OsString, is_root: bool) -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let tools = Tool::ALL
            .iter()
            .map(|&tool| {
                let found = tool
                    .candidates()
                    .iter()
                    .find_map(|cand| which::which_in(cand, Some(search), &cwd).ok());
                (tool, found)
            })
            .collect();
        Capabilities { tools, is_root }
    }

    /// Build a map by hand; absent entries count as missing.
    pub fn from_parts(found: impl IntoIterator<Item = (Tool, PathBuf)>, is_root: bool) -> Self {
        let mut tools: BTreeMap<Tool, Option<PathBuf>> =
            Tool::ALL.iter().map(|&tool| (tool, None)).collect();
        for (tool, path) in found {
            tools.insert(tool, Some(path));
        }
        Capabilities { tools, is_root }
    }

    pub fn path(&self, tool: Tool) -> Option<&Path> {
        self.tools.get(&tool).and_then(|p| p.as_deref())
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Resolved path of `tool`, or a precondition failure naming it.
    pub fn resolve(&self, tool: Tool) -> Result<PathBuf, PreconditionError> {
        self.path(tool)
            .map(Path::to_path_buf)
            .ok_or_else(|| PreconditionError::MissingTool {
                tool: tool.name(),
                hint: tool.hint().to_string(),
            })
    }

    /// Fail on the first tool in `tools` that is missing.
    pub fn require(&self, tools: &[Tool]) -> Result<(), PreconditionError> {
        for &tool in tools {
            self.resolve(tool)?;
        }
        Ok(())
    }

    /// Binding and mounting go through `sudo` unless we already are root.
    pub fn privilege_helper_needed(&self) -> bool {
        !self.is_root
    }

    /// Tools needed to build a disk image with the current privilege level.
    pub fn provisioning_tools(&self) -> Vec<Tool> {
        let mut tools = vec![Tool::Parted, Tool::MkfsFat];
        if self.privilege_helper_needed() {
            tools.extend([Tool::Sudo, Tool::Losetup, Tool::Mount, Tool::Umount]);
        }
        tools
    }

    /// Human-readable FOUND/MISSING listing.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "privilege: {}",
            if self.is_root { "root (direct system calls)" } else { "unprivileged (sudo helper)" }
        );
        for (tool, found) in &self.tools {
            match found {
                Some(path) => {
                    let _ = writeln!(out, "{}: FOUND ({})", tool.name(), path.display());
                }
                None => {
                    let _ = writeln!(out, "{}: MISSING", tool.name());
                    let _ = writeln!(out, "  - {}", tool.hint());
                }
            }
        }
        out
    }
}
