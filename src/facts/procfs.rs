//! Parsers for the Linux `/proc` text files the provider reads directly.

use crate::facts::{DiskIoFacts, PartitionFacts};

const SECTOR_BYTES: u64 = 512;

/// Parses `/proc/self/mounts` (or `/proc/mounts`). Lines with fewer than
/// three fields are skipped.
pub fn parse_mounts(content: &str) -> Vec<PartitionFacts> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(PartitionFacts {
                device: unescape_mount_field(device),
                mount_point: unescape_mount_field(mount_point),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// The kernel escapes space, tab, newline and backslash as `\ooo` octal.
fn unescape_mount_field(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(octal, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Parses `/proc/diskstats`. Counts are cumulative since boot; sectors are
/// always 512 bytes regardless of the device block size.
pub fn parse_diskstats(content: &str) -> Vec<DiskIoFacts> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 14 {
                return None;
            }
            let num = |idx: usize| fields[idx].parse::<u64>().unwrap_or(0);
            Some(DiskIoFacts {
                name: fields[2].to_string(),
                read_count: num(3),
                read_bytes: num(5).saturating_mul(SECTOR_BYTES),
                read_time_ms: num(6),
                write_count: num(7),
                write_bytes: num(9).saturating_mul(SECTOR_BYTES),
                write_time_ms: num(10),
            })
        })
        .collect()
}

/// The `/proc/meminfo` fields `sysinfo` does not expose, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeminfoExtras {
    pub shared: u64,
    pub cached: u64,
    pub buffers: u64,
}

pub fn parse_meminfo_extras(content: &str) -> MeminfoExtras {
    let mut extras = MeminfoExtras::default();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kib = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let bytes = kib.saturating_mul(1024);
        match key.trim() {
            "Shmem" => extras.shared = bytes,
            "Cached" => extras.cached = bytes,
            "Buffers" => extras.buffers = bytes,
            _ => {}
        }
    }
    extras
}

/// Distribution family from an os-release file: the first `ID_LIKE` entry,
/// or `ID` when the distribution names no parent.
pub fn parse_os_release_family(content: &str) -> Option<String> {
    let mut id = None;
    let mut id_like = None;
    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        match key {
            "ID" => id = Some(value.to_string()),
            "ID_LIKE" => id_like = value.split_whitespace().next().map(str::to_string),
            _ => {}
        }
    }
    id_like.or(id).filter(|v| !v.is_empty())
}
