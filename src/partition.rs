//! GPT labeling through `parted`.

use std::path::PathBuf;
use std::process::Command;

use tracing::info;

use crate::error::{HarnessError, Result};
use crate::image::{DiskImage, MIB, SECTOR_SIZE};
use crate::tool;

/// Partitions start on a 1 MiB boundary.
pub const ALIGNMENT: u64 = MIB;

/// Smallest image that still holds a GPT plus a usable FAT32 partition.
pub const MIN_IMAGE_SIZE: u64 = 16 * MIB;

/// Primary header + entry array, mirrored at the end of the disk.
const GPT_RESERVED_SECTORS: u64 = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Fat32,
}

impl Filesystem {
    fn parted_name(self) -> &'static str {
        match self {
            Filesystem::Fat32 => "fat32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    ToEnd,
    Bytes(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    pub filesystem: Filesystem,
    pub start: u64,
    pub span: Span,
    pub esp: bool,
}

impl PartitionSpec {
    /// The single EFI System Partition every fixture image carries.
    pub fn esp() -> Self {
        PartitionSpec {
            name: "ESP".to_string(),
            filesystem: Filesystem::Fat32,
            start: ALIGNMENT,
            span: Span::ToEnd,
            esp: true,
        }
    }

    /// Check the partition against the image it is about to be written to.
    pub fn validate(&self, image: &DiskImage) -> Result<()> {
        let reject = |reason: String| HarnessError::Partition {
            image: image.path().to_path_buf(),
            reason,
        };

        if image.size_bytes() < MIN_IMAGE_SIZE {
            return Err(reject(format!(
                "image is {} bytes, at least {} MiB is needed for GPT and FAT32",
                image.size_bytes(),
                MIN_IMAGE_SIZE / MIB
            )));
        }
        if self.start < ALIGNMENT || self.start % ALIGNMENT != 0 {
            return Err(reject(format!(
                "partition start {} is not a multiple of the {} MiB alignment",
                self.start,
                ALIGNMENT / MIB
            )));
        }
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(reject(format!("invalid partition name {:?}", self.name)));
        }
        let usable_end = image.size_bytes() - GPT_RESERVED_SECTORS * SECTOR_SIZE;
        if let Span::Bytes(len) = self.span {
            if len == 0 || self.start + len > usable_end {
                return Err(reject(format!("partition of {len} bytes does not fit the image")));
            }
        }
        Ok(())
    }

    fn parted_args(&self) -> Vec<String> {
        let end = match self.span {
            Span::ToEnd => "100%".to_string(),
            Span::Bytes(len) => format!("{}B", self.start + len - 1),
        };
        let mut args = vec![
            "mklabel".to_string(),
            "gpt".to_string(),
            "mkpart".to_string(),
            self.name.clone(),
            self.filesystem.parted_name().to_string(),
            format!("{}MiB", self.start / MIB),
            end,
        ];
        if self.esp {
            args.extend(["set", "1", "esp", "on"].map(String::from));
        }
        args
    }
}

pub struct PartitionPlanner {
    parted: PathBuf,
}

impl PartitionPlanner {
    pub fn new(parted: PathBuf) -> Self {
        PartitionPlanner { parted }
    }

    /// Write a fresh GPT label holding exactly `spec`. Any previous table is
    /// replaced, so planning the same image twice is harmless.
    pub fn plan(&self, image: &DiskImage, spec: &PartitionSpec) -> Result<()> {
        spec.validate(image)?;

        let mut cmd = Command::new(&self.parted);
        cmd.arg("--script").arg(image.path()).args(spec.parted_args());
        tool::run(&mut cmd).map_err(|failure| HarnessError::Partition {
            image: image.path().to_path_buf(),
            reason: failure.to_string(),
        })?;

        info!(image = %image.path().display(), partition = %spec.name, "wrote GPT label");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image;

    #[test]
    fn esp_spec_emits_the_expected_parted_script() {
        assert_eq!(
            PartitionSpec::esp().parted_args(),
            ["mklabel", "gpt", "mkpart", "ESP", "fat32", "1MiB", "100%", "set", "1", "esp", "on"]
        );
    }

    #[test]
    fn too_small_images_are_rejected_before_parted_runs() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("tiny.img"), 8 * MIB).unwrap();
        let planner = PartitionPlanner::new(PathBuf::from("/nonexistent/parted"));

        let err = planner.plan(&image, &PartitionSpec::esp()).unwrap_err();
        assert_eq!(err.phase(), "partition");
        assert!(err.to_string().contains("16 MiB"));
    }

    #[test]
    fn misaligned_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), 32 * MIB).unwrap();
        let spec = PartitionSpec {
            start: 4096,
            ..PartitionSpec::esp()
        };
        assert!(spec.validate(&image).is_err());
        assert!(PartitionSpec::esp().validate(&image).is_ok());
    }

    #[test]
    fn fixed_span_must_fit_before_the_backup_table() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), 32 * MIB).unwrap();
        let fits = PartitionSpec {
            span: Span::Bytes(16 * MIB),
            ..PartitionSpec::esp()
        };
        assert!(fits.validate(&image).is_ok());
        assert_eq!(fits.parted_args()[6], format!("{}B", 17 * MIB - 1));

        let overflows = PartitionSpec {
            span: Span::Bytes(31 * MIB),
            ..PartitionSpec::esp()
        };
        assert!(overflows.validate(&image).is_err());
    }

    #[test]
    fn tool_rejection_is_a_partition_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::allocate(&dir.path().join("disk.img"), 16 * MIB).unwrap();
        let planner = PartitionPlanner::new(PathBuf::from("false"));
        let err = planner.plan(&image, &PartitionSpec::esp()).unwrap_err();
        assert!(matches!(err, HarnessError::Partition { .. }));
    }
}
