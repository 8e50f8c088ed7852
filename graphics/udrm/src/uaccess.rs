//! Access to caller memory
//!
//! Control commands carry pointers into the caller's address space. Reads
//! through [`UserMemory`] either copy the whole range or fail with
//! [`Error::FaultyInput`]; nothing is ever partially consumed.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Caller address space a command payload is read from
pub trait UserMemory {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
}

/// A single contiguous region mapped at `base`
#[derive(Debug, Clone, Copy)]
pub struct UserBuffer<'a> {
    base: u64,
    data: &'a [u8],
}

impl<'a> UserBuffer<'a> {
    pub fn new(base: u64, data: &'a [u8]) -> Self {
        Self { base, data }
    }
}

impl UserMemory for UserBuffer<'_> {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        read_region(self.base, self.data, addr, buf)
    }
}

fn read_region(base: u64, data: &[u8], addr: u64, buf: &mut [u8]) -> Result<()> {
    let start = addr.checked_sub(base).ok_or(Error::FaultyInput)?;
    let start = usize::try_from(start).map_err(|_| Error::FaultyInput)?;
    let end = start.checked_add(buf.len()).ok_or(Error::FaultyInput)?;
    buf.copy_from_slice(data.get(start..end).ok_or(Error::FaultyInput)?);
    Ok(())
}

/// Sparse address space made of separately mapped regions
///
/// Address 0 and the gaps between regions are never readable.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl AddressSpace {
    const BASE: u64 = 0x1000;
    const ALIGN: u64 = 0x1000;

    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next: Self::BASE,
        }
    }

    /// Map `data` and return its address
    pub fn map(&mut self, data: impl Into<Vec<u8>>) -> u64 {
        let data = data.into();
        let addr = self.next;
        // Leave an unmapped guard page after each region
        let len = (data.len() as u64).div_ceil(Self::ALIGN).max(1) * Self::ALIGN;
        self.next = addr + len + Self::ALIGN;
        self.regions.insert(addr, data);
        addr
    }
}

impl UserMemory for AddressSpace {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (base, data) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(Error::FaultyInput)?;
        read_region(*base, data, addr, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_buffer_bounds() {
        let data = [1u8, 2, 3, 4];
        let mem = UserBuffer::new(0x100, &data);

        let mut buf = [0u8; 2];
        mem.read(0x102, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);

        assert_eq!(mem.read(0x103, &mut buf), Err(Error::FaultyInput));
        assert_eq!(mem.read(0xff, &mut buf), Err(Error::FaultyInput));
        assert_eq!(mem.read(u64::MAX, &mut buf), Err(Error::FaultyInput));
    }

    #[test]
    fn test_address_space_regions() {
        let mut mem = AddressSpace::new();
        let a = mem.map(vec![0xaa; 16]);
        let b = mem.map(vec![0xbb; 8]);
        assert_ne!(a, b);

        let mut buf = [0u8; 8];
        mem.read(b, &mut buf).unwrap();
        assert_eq!(buf, [0xbb; 8]);
        mem.read(a + 8, &mut buf).unwrap();
        assert_eq!(buf, [0xaa; 8]);

        // Straddles the end of a region
        assert_eq!(mem.read(a + 12, &mut buf), Err(Error::FaultyInput));
        assert_eq!(mem.read(0, &mut buf), Err(Error::FaultyInput));
        assert_eq!(mem.read(b + 0x1000, &mut buf), Err(Error::FaultyInput));
    }
}
