//! `/proc/<pid>/maps` snapshots.
//!
//! The loader resolves hook targets against a cached snapshot of the
//! process's memory map rather than walking the dynamic linker's lists, so
//! every lookup here works purely on parsed map entries.

use crate::types::FileId;

/// One parsed line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub start: usize,
    pub end: usize,
    /// `PROT_*` bits decoded from the `rwx` columns.
    pub perms: i32,
    pub is_private: bool,
    pub offset: usize,
    pub dev: u64,
    pub inode: u64,
    /// Backing path or pseudo name (`[stack]`, `[anon:...]`); empty for
    /// unnamed anonymous memory.
    pub path: String,
}

impl MapInfo {
    /// Parse a single maps line. Returns `None` for malformed input.
    pub fn parse_line(line: &str) -> Option<MapInfo> {
        let mut rest = line.trim_end_matches('\n');

        let range = next_field(&mut rest)?;
        let perms = next_field(&mut rest)?;
        let offset = next_field(&mut rest)?;
        let dev = next_field(&mut rest)?;
        let inode = next_field(&mut rest)?;

        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if end < start {
            return None;
        }

        let bytes = perms.as_bytes();
        if bytes.len() < 4 {
            return None;
        }
        let mut prot = libc::PROT_NONE;
        if bytes[0] == b'r' {
            prot |= libc::PROT_READ;
        }
        if bytes[1] == b'w' {
            prot |= libc::PROT_WRITE;
        }
        if bytes[2] == b'x' {
            prot |= libc::PROT_EXEC;
        }

        let (major, minor) = dev.split_once(':')?;
        let major = u32::from_str_radix(major, 16).ok()?;
        let minor = u32::from_str_radix(minor, 16).ok()?;

        Some(MapInfo {
            start,
            end,
            perms: prot,
            is_private: bytes[3] == b'p',
            offset: usize::from_str_radix(offset, 16).ok()?,
            dev: makedev(major, minor),
            inode: inode.parse().ok()?,
            path: rest.trim_start().to_string(),
        })
    }

    /// Parse a whole maps file, skipping lines that do not parse.
    pub fn parse(text: &str) -> Vec<MapInfo> {
        text.lines().filter_map(MapInfo::parse_line).collect()
    }

    /// Snapshot the calling process's memory map.
    pub fn scan_self() -> Vec<MapInfo> {
        Self::scan("self")
    }

    /// Snapshot the memory map of `pid` (`"self"` for the calling process).
    pub fn scan(pid: &str) -> Vec<MapInfo> {
        match std::fs::read_to_string(format!("/proc/{pid}/maps")) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                log::warn!("failed to read /proc/{pid}/maps: {e}");
                Vec::new()
            }
        }
    }

    pub fn file_id(&self) -> FileId {
        FileId::new(self.dev, self.inode)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_readable(&self) -> bool {
        self.perms & libc::PROT_READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.perms & libc::PROT_WRITE != 0
    }

    /// The first mapping of a loaded image: file offset zero, private and
    /// readable. This is where the ELF header lives.
    pub fn is_image_base(&self) -> bool {
        self.offset == 0 && self.is_private && self.is_readable()
    }

    /// Anonymous mapping carrying the given `[anon:<name>]` label.
    pub fn has_anon_name(&self, name: &str) -> bool {
        self.file_id().is_anonymous()
            && self
                .path
                .strip_prefix("[anon:")
                .and_then(|p| p.strip_suffix(']'))
                .is_some_and(|label| label == name)
    }
}

/// Find the entry containing `addr`.
pub fn find_region(maps: &[MapInfo], addr: usize) -> Option<&MapInfo> {
    maps.iter().find(|m| m.contains(addr))
}

/// Find the lowest image base mapping for a file identity.
pub fn find_image_base(maps: &[MapInfo], id: FileId) -> Option<&MapInfo> {
    maps.iter()
        .filter(|m| m.file_id() == id && m.is_image_base())
        .min_by_key(|m| m.start)
}

/// Encode a major/minor pair the way the kernel reports `st_dev`.
pub const fn makedev(major: u32, minor: u32) -> u64 {
    let major = major as u64;
    let minor = minor as u64;
    ((major & 0xffff_f000) << 32) | ((major & 0xfff) << 8) | ((minor & 0xffff_ff00) << 12) | (minor & 0xff)
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(' ').unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(field)
}
