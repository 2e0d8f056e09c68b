//! Guest address space.
//!
//! Memory is a sorted set of non-overlapping regions, each with its own permissions.
//! Every access must fall entirely inside a single region that grants it; anything else
//! is an [`ExecFault::MemoryFault`]. Nothing outside the regions is backed, so a guest
//! address can never reach host memory.

use crate::virtual_machine::errors::ExecFault;
use crate::virtual_machine::isa::PAGE_SIZE;
use std::fmt;

/// Kind of memory access being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Execute => "execute",
        })
    }
}

/// Region permissions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Perms {
    pub const NONE: Perms = Perms {
        read: false,
        write: false,
        execute: false,
    };
    pub const READ_EXEC: Perms = Perms {
        read: true,
        write: false,
        execute: true,
    };
    pub const READ_WRITE: Perms = Perms {
        read: true,
        write: true,
        execute: false,
    };

    pub fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
            Access::Execute => self.execute,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Text,
    Data,
    Stack,
    Mapping,
}

impl RegionKind {
    pub fn name(self) -> &'static str {
        match self {
            RegionKind::Text => ".text",
            RegionKind::Data => ".data",
            RegionKind::Stack => "stack",
            RegionKind::Mapping => "mapping",
        }
    }
}

/// A contiguous block of guest memory.
#[derive(Debug)]
pub struct Region {
    base: u32,
    bytes: Vec<u8>,
    perms: Perms,
    kind: RegionKind,
}

impl Region {
    pub fn new(base: u32, bytes: Vec<u8>, perms: Perms, kind: RegionKind) -> Self {
        Self {
            base,
            bytes,
            perms,
            kind,
        }
    }

    /// A zero-filled region of `len` bytes.
    pub fn zeroed(base: u32, len: u32, perms: Perms, kind: RegionKind) -> Self {
        Self::new(base, vec![0; len as usize], perms, kind)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// One past the last address, widened so regions ending at 4 GiB do not wrap.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.bytes.len() as u64
    }
}

/// The set of regions making up one guest address space.
#[derive(Debug, Default)]
pub struct Memory {
    /// Sorted by base address.
    regions: Vec<Region>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region. On overlap, returns the kind of the region already occupying the range.
    pub fn insert(&mut self, region: Region) -> Result<(), RegionKind> {
        if region.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self
            .regions
            .iter()
            .find(|r| (region.base as u64) < r.end() && (r.base as u64) < region.end())
        {
            return Err(existing.kind);
        }
        let at = self.regions.partition_point(|r| r.base < region.base);
        self.regions.insert(at, region);
        Ok(())
    }

    /// Removes the mapping that starts exactly at `base`.
    pub fn remove_mapping(&mut self, base: u32) -> Option<Region> {
        let at = self
            .regions
            .iter()
            .position(|r| r.kind == RegionKind::Mapping && r.base == base)?;
        Some(self.regions.remove(at))
    }

    pub fn mapping_count(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::Mapping)
            .count()
    }

    /// Returns true if no region intersects `[base, base + len)`.
    pub fn is_free(&self, base: u32, len: u32) -> bool {
        let end = base as u64 + len as u64;
        !self
            .regions
            .iter()
            .any(|r| (base as u64) < r.end() && (r.base as u64) < end)
    }

    /// Lowest page-aligned address in `[low, high)` where `len` bytes fit without
    /// touching any region.
    pub fn find_free(&self, len: u32, low: u32, high: u32) -> Option<u32> {
        let mut candidate = low as u64;
        for r in &self.regions {
            if r.end() <= candidate || r.base as u64 >= high as u64 {
                continue;
            }
            if candidate + len as u64 <= r.base as u64 {
                break;
            }
            candidate = align_up(r.end());
        }
        if candidate + len as u64 <= high as u64 {
            u32::try_from(candidate).ok()
        } else {
            None
        }
    }

    /// Locates `[addr, addr + len)` inside one region granting `access`.
    fn locate(&self, addr: u32, len: usize, access: Access) -> Result<(usize, usize), ExecFault> {
        let fault = ExecFault::MemoryFault {
            addr,
            len: len as u32,
            access,
        };
        let idx = self.regions.partition_point(|r| r.base <= addr);
        let region = idx
            .checked_sub(1)
            .and_then(|i| self.regions.get(i))
            .ok_or(fault.clone())?;
        if addr as u64 + len as u64 > region.end() || !region.perms.allows(access) {
            return Err(fault);
        }
        Ok((idx - 1, (addr - region.base) as usize))
    }

    pub fn read(&self, addr: u32, len: usize, access: Access) -> Result<&[u8], ExecFault> {
        let (idx, off) = self.locate(addr, len, access)?;
        Ok(&self.regions[idx].bytes[off..off + len])
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8], ExecFault> {
        let (idx, off) = self.locate(addr, len, Access::Write)?;
        Ok(&mut self.regions[idx].bytes[off..off + len])
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), ExecFault> {
        self.slice_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Copies executable bytes at `pc` into `buf`.
    pub fn fetch(&self, pc: u32, buf: &mut [u8]) -> Result<(), ExecFault> {
        buf.copy_from_slice(self.read(pc, buf.len(), Access::Execute)?);
        Ok(())
    }

    pub fn load_u8(&self, addr: u32) -> Result<u8, ExecFault> {
        Ok(self.read(addr, 1, Access::Read)?[0])
    }

    pub fn load_u32(&self, addr: u32) -> Result<u32, ExecFault> {
        let bytes = self.read(addr, 4, Access::Read)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn store_u8(&mut self, addr: u32, value: u8) -> Result<(), ExecFault> {
        self.write(addr, &[value])
    }

    pub fn store_u32(&mut self, addr: u32, value: u32) -> Result<(), ExecFault> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max` bytes (terminator excluded).
    ///
    /// Returns `Ok(None)` when no terminator is found within the limit.
    pub fn load_cstr(&self, addr: u32, max: usize) -> Result<Option<Vec<u8>>, ExecFault> {
        let mut out = Vec::new();
        for i in 0..=max as u32 {
            let byte = self.load_u8(addr.checked_add(i).ok_or(ExecFault::MemoryFault {
                addr,
                len: i + 1,
                access: Access::Read,
            })?)?;
            if byte == 0 {
                return Ok(Some(out));
            }
            out.push(byte);
        }
        Ok(None)
    }
}

/// Rounds up to the next page boundary.
pub fn align_up(value: u64) -> u64 {
    let page = PAGE_SIZE as u64;
    value.div_ceil(page) * page
}
