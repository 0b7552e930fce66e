//! Read-only GPT parser used to verify provisioned images.
//!
//! ## Layout
//!
//! ```text
//! LBA 0:      protective MBR
//! LBA 1:      GPT header ("EFI PART")
//! LBA 2..33:  partition entry array (128 entries x 128 bytes)
//! ...
//! LBA -33..-2: backup entry array
//! LBA -1:     backup header
//! ```
//!
//! All integers are little-endian. GUIDs store their first three fields
//! little-endian and the last two big-endian.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::image::SECTOR_SIZE;
use crate::partition::ALIGNMENT;

const SIGNATURE: &[u8; 8] = b"EFI PART";
const MAX_ENTRIES: u32 = 1024;
const MIN_ENTRY_SIZE: usize = 128;
const MAX_ENTRY_SIZE: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    /// C12A7328-F81F-11D2-BA4B-00A0C93EC93B
    pub const ESP: Guid = Guid([
        0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, //
        0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
    ]);

    pub const UNUSED: Guid = Guid([0; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9]
        )?;
        for byte in &b[10..] {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn is_esp(&self) -> bool {
        self.type_guid == Guid::ESP
    }

    pub fn start_bytes(&self) -> u64 {
        self.first_lba.saturating_mul(SECTOR_SIZE)
    }

    /// Zero for an inverted range.
    pub fn size_bytes(&self) -> u64 {
        match self.last_lba.checked_sub(self.first_lba) {
            Some(span) => span.saturating_add(1).saturating_mul(SECTOR_SIZE),
            None => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GptLayout {
    pub disk_sectors: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub entries: Vec<GptEntry>,
}

impl GptLayout {
    /// True if `entry` ends within one alignment unit of the last usable
    /// sector; partitioning tools may round the end down to a boundary.
    pub fn spans_to_end(&self, entry: &GptEntry) -> bool {
        entry.last_lba <= self.last_usable_lba
            && (self.last_usable_lba - entry.last_lba) * SECTOR_SIZE < ALIGNMENT
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap_or_default())
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap_or_default())
}

fn guid_at(buf: &[u8], offset: usize) -> Guid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    Guid(bytes)
}

/// Parse the primary GPT of the raw image at `path`, returning only the
/// partition entries that are in use.
pub fn read_layout(path: &Path) -> io::Result<GptLayout> {
    let mut file = File::open(path)?;
    let disk_bytes = file.metadata()?.len();
    let disk_sectors = disk_bytes / SECTOR_SIZE;

    let mut header = [0u8; SECTOR_SIZE as usize];
    file.seek(SeekFrom::Start(SECTOR_SIZE))?;
    file.read_exact(&mut header)?;

    if &header[0..8] != SIGNATURE {
        return Err(invalid("no GPT header at LBA 1"));
    }
    let first_usable_lba = u64_at(&header, 40);
    let last_usable_lba = u64_at(&header, 48);
    let entries_lba = u64_at(&header, 72);
    let entry_count = u32_at(&header, 80);
    let entry_size = u32_at(&header, 84) as usize;

    if entry_count > MAX_ENTRIES || !(MIN_ENTRY_SIZE..=MAX_ENTRY_SIZE).contains(&entry_size)
    {
        return Err(invalid(format!(
            "implausible entry array: {entry_count} entries of {entry_size} bytes"
        )));
    }

    let table_len = entry_count as usize * entry_size;
    let table_start = entries_lba
        .checked_mul(SECTOR_SIZE)
        .filter(|start| {
            start
                .checked_add(table_len as u64)
                .is_some_and(|end| end <= disk_bytes)
        })
        .ok_or_else(|| {
            invalid(format!("entry array at LBA {entries_lba} lies outside the disk"))
        })?;

    let mut table = vec![0u8; table_len];
    file.seek(SeekFrom::Start(table_start))?;
    file.read_exact(&mut table)?;

    let entries = table
        .chunks_exact(entry_size)
        .filter(|raw| guid_at(raw, 0) != Guid::UNUSED)
        .map(|raw| parse_entry(raw, disk_sectors))
        .collect::<io::Result<_>>()?;

    Ok(GptLayout {
        disk_sectors,
        first_usable_lba,
        last_usable_lba,
        entries,
    })
}

fn parse_entry(raw: &[u8], disk_sectors: u64) -> io::Result<GptEntry> {
    let name: Vec<u16> = raw[56..128]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect();
    let entry = GptEntry {
        type_guid: guid_at(raw, 0),
        unique_guid: guid_at(raw, 16),
        first_lba: u64_at(raw, 32),
        last_lba: u64_at(raw, 40),
        attributes: u64_at(raw, 48),
        name: String::from_utf16_lossy(&name),
    };
    if entry.last_lba < entry.first_lba || entry.last_lba >= disk_sectors {
        return Err(invalid(format!(
            "partition `{}` spans LBA {}..={} on a {disk_sectors}-sector disk",
            entry.name, entry.first_lba, entry.last_lba
        )));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Hand-assemble a minimal GPT image with one ESP entry.
    fn write_fixture(path: &Path, sectors: u64, first: u64, last: u64) {
        let mut disk = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        let header = &mut disk[512..1024];
        header[0..8].copy_from_slice(SIGNATURE);
        header[40..48].copy_from_slice(&34u64.to_le_bytes());
        header[48..56].copy_from_slice(&(sectors - 34).to_le_bytes());
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        header[80..84].copy_from_slice(&128u32.to_le_bytes());
        header[84..88].copy_from_slice(&128u32.to_le_bytes());

        let entry = &mut disk[1024..1152];
        entry[0..16].copy_from_slice(&Guid::ESP.0);
        entry[16..32].copy_from_slice(&[0x11; 16]);
        entry[32..40].copy_from_slice(&first.to_le_bytes());
        entry[40..48].copy_from_slice(&last.to_le_bytes());
        for (i, unit) in "ESP".encode_utf16().enumerate() {
            entry[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }

        File::create(path).unwrap().write_all(&disk).unwrap();
    }

    #[test]
    fn esp_guid_formats_canonically() {
        assert_eq!(Guid::ESP.to_string(), "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
    }

    #[test]
    fn reads_a_single_esp_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let sectors = 32 * 2048;
        write_fixture(&path, sectors, 2048, sectors - 34);

        let layout = read_layout(&path).unwrap();
        assert_eq!(layout.disk_sectors, sectors);
        assert_eq!(layout.entries.len(), 1);

        let esp = &layout.entries[0];
        assert!(esp.is_esp());
        assert_eq!(esp.name, "ESP");
        assert_eq!(esp.start_bytes(), ALIGNMENT);
        assert!(layout.spans_to_end(esp));
    }

    #[test]
    fn short_partition_does_not_span_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let sectors = 32 * 2048;
        write_fixture(&path, sectors, 2048, 8 * 2048);

        let layout = read_layout(&path).unwrap();
        assert!(!layout.spans_to_end(&layout.entries[0]));
    }

    /// Overwrite `bytes` at `offset` in an existing fixture.
    fn patch(path: &Path, offset: u64, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(bytes).unwrap();
    }

    fn corrupt_fixture(offset: u64, bytes: &[u8]) -> io::Error {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let sectors = 32 * 2048;
        write_fixture(&path, sectors, 2048, sectors - 34);
        patch(&path, offset, bytes);
        read_layout(&path).unwrap_err()
    }

    #[test]
    fn entry_array_beyond_the_disk_is_invalid() {
        let err = corrupt_fixture(512 + 72, &(u64::MAX / 2).to_le_bytes());
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = corrupt_fixture(512 + 72, &(32 * 2048u64).to_le_bytes());
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_entries_are_invalid() {
        let err = corrupt_fixture(512 + 84, &u32::MAX.to_le_bytes());
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn inverted_or_overlong_partitions_are_invalid() {
        // last_lba below first_lba
        let err = corrupt_fixture(1024 + 40, &100u64.to_le_bytes());
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // last_lba past the end of the disk
        let err = corrupt_fixture(1024 + 40, &(64 * 2048u64).to_le_bytes());
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn inverted_range_has_no_size() {
        let entry = GptEntry {
            type_guid: Guid::ESP,
            unique_guid: Guid::UNUSED,
            first_lba: 2048,
            last_lba: 100,
            attributes: 0,
            name: String::new(),
        };
        assert_eq!(entry.size_bytes(), 0);
    }

    #[test]
    fn blank_image_has_no_gpt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.img");
        std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
        let err = read_layout(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
