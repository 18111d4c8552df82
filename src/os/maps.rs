//! The address-space map reader: region boundaries and permissions for the
//! current process, normalized to one record shape regardless of where they
//! came from.
//!
//! Two sources are provided. [`ProcMaps`] reads the kernel's line-oriented
//! pseudo-file over a raw fd, one line per read, so a lookup that happens
//! under an allocator hook never touches the heap more than it must.
//! [`SnapshotMaps`] wraps pre-normalized records, which is what a structured
//! (sysctl-style) source or a test harness feeds in.

use std::ffi::CString;
use std::io;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Mapping permissions, straight from the `rwxp` column.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Perms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const PRIVATE = 1 << 3;
        const SHARED = 1 << 4;
    }
}

impl Perms {
    /// Parse a four-character permission column such as `r-xp`.
    pub fn parse(s: &str) -> Option<Perms> {
        let b = s.as_bytes();
        if b.len() != 4 {
            return None;
        }
        let mut p = Perms::empty();
        match b[0] {
            b'r' => p |= Perms::READ,
            b'-' => {}
            _ => return None,
        }
        match b[1] {
            b'w' => p |= Perms::WRITE,
            b'-' => {}
            _ => return None,
        }
        match b[2] {
            b'x' => p |= Perms::EXEC,
            b'-' => {}
            _ => return None,
        }
        match b[3] {
            b'p' => p |= Perms::PRIVATE,
            b's' => p |= Perms::SHARED,
            _ => return None,
        }
        Some(p)
    }
}

/// One mapped region of the process address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub perms: Perms,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub path: Option<String>,
}

impl Region {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Something that can produce the current region table. The mapped-region
/// allocator backend consults this once per cold lookup.
pub trait MapSource {
    fn snapshot(&self) -> Result<Vec<Region>>;
}

/// Decode one line of the text table. `None` for malformed lines (the kernel
/// format is stable; anything unparseable is skipped, not fatal).
pub fn parse_entry(line: &str) -> Option<Region> {
    fn field<'a>(rest: &mut &'a str) -> Option<&'a str> {
        let s = rest.trim_start();
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        let (f, r) = s.split_at(end);
        *rest = r;
        if f.is_empty() {
            None
        } else {
            Some(f)
        }
    }

    let mut rest = line;
    let range = field(&mut rest)?;
    let (lo, hi) = range.split_once('-')?;
    let start = usize::from_str_radix(lo, 16).ok()?;
    let end = usize::from_str_radix(hi, 16).ok()?;
    let perms = Perms::parse(field(&mut rest)?)?;
    let offset = u64::from_str_radix(field(&mut rest)?, 16).ok()?;
    let dev = field(&mut rest)?;
    let (maj, min) = dev.split_once(':')?;
    let dev_major = u32::from_str_radix(maj, 16).ok()?;
    let dev_minor = u32::from_str_radix(min, 16).ok()?;
    let inode = field(&mut rest)?.parse().ok()?;
    let path = {
        let p = rest.trim();
        if p.is_empty() {
            None
        } else {
            Some(p.to_owned())
        }
    };
    Some(Region {
        start,
        end,
        perms,
        offset,
        dev_major,
        dev_minor,
        inode,
        path,
    })
}

/// Reads `/proc/self/maps` line-at-a-time over a raw fd.
#[derive(Debug, Default)]
pub struct ProcMaps;

impl ProcMaps {
    pub const PATH: &'static str = "/proc/self/maps";

    /// Read one line (up to and including the newline) into `buf`, rewinding
    /// the fd to just past the newline. Returns the line length, or `None`
    /// at EOF.
    fn get_a_line(fd: i32, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        // Leave room for a terminator's worth of slack, like any C line
        // reader would.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len() - 1) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(None);
        }
        let n = n as usize;
        match buf[..n].iter().position(|&b| b == b'\n') {
            Some(newline) => {
                let line_len = newline + 1;
                // Rewind to just after the newline; negative if we over-read.
                let delta = line_len as i64 - n as i64;
                let r = unsafe { libc::lseek(fd, delta, libc::SEEK_CUR) };
                if r < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Some(line_len))
            }
            // Short read with no newline only happens at EOF.
            None => Ok(Some(n)),
        }
    }
}

impl MapSource for ProcMaps {
    fn snapshot(&self) -> Result<Vec<Region>> {
        let path = CString::new(Self::PATH).expect("no interior NUL");
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut regions = Vec::new();
        // One maps line never exceeds a path plus a fixed prefix.
        let mut buf = [0u8; 4096 + 256];
        loop {
            match Self::get_a_line(fd, &mut buf) {
                Ok(Some(len)) => {
                    if let Ok(line) = std::str::from_utf8(&buf[..len]) {
                        if let Some(region) = parse_entry(line.trim_end_matches('\n')) {
                            regions.push(region);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e.into());
                }
            }
        }
        unsafe { libc::close(fd) };
        Ok(regions)
    }
}

/// A fixed region table: the normalization target for structured sources,
/// and the way tests script an address space.
#[derive(Clone, Debug, Default)]
pub struct SnapshotMaps {
    regions: Vec<Region>,
}

impl SnapshotMaps {
    pub fn new(mut regions: Vec<Region>) -> Self {
        regions.sort_by_key(|r| r.start);
        Self { regions }
    }
}

impl MapSource for SnapshotMaps {
    fn snapshot(&self) -> Result<Vec<Region>> {
        Ok(self.regions.clone())
    }
}
