//! Flat guest memory for the reference backend.
//!
//! One contiguous, zero-initialised pool starting at a configurable guest
//! address.  Reads outside the pool return `0`; writes outside it are
//! dropped.

use log::debug;
use tripwire_sal::backend::MemoryManager;
use tripwire_sal::event::Address;

/// Contiguous guest memory pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatMemory {
    base: Address,
    bytes: Vec<u8>,
}

impl FlatMemory {
    /// Allocate `size` zeroed bytes mapped at guest address `base`.
    pub fn new(base: Address, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    fn offset(&self, addr: Address) -> Option<usize> {
        let off = addr.checked_sub(self.base)?;
        let off = usize::try_from(off).ok()?;
        (off < self.bytes.len()).then_some(off)
    }

    /// Copy of the whole pool.
    pub fn dump(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Overwrite the pool with `data`, which must have the pool's size.
    pub fn load(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        if data.len() != self.bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "memory image is {} bytes, pool is {} bytes",
                    data.len(),
                    self.bytes.len()
                ),
            ));
        }
        self.bytes.copy_from_slice(data);
        Ok(())
    }

    /// Zero the pool.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

impl MemoryManager for FlatMemory {
    fn pool_size(&self) -> usize {
        self.bytes.len()
    }

    fn start_addr(&self) -> Address {
        self.base
    }

    fn get_byte(&self, addr: Address) -> u8 {
        self.offset(addr).map_or(0, |off| self.bytes[off])
    }

    fn get_bytes(&self, addr: Address, buf: &mut [u8]) {
        match self.offset(addr) {
            Some(off) if off + buf.len() <= self.bytes.len() => {
                buf.copy_from_slice(&self.bytes[off..off + buf.len()]);
            }
            _ => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.get_byte(addr.wrapping_add(i as u64));
                }
            }
        }
    }

    fn set_byte(&mut self, addr: Address, data: u8) {
        match self.offset(addr) {
            Some(off) => self.bytes[off] = data,
            None => debug!("memory: dropped write to unmapped {:#x}", addr),
        }
    }

    fn set_bytes(&mut self, addr: Address, data: &[u8]) {
        match self.offset(addr) {
            Some(off) if off + data.len() <= self.bytes.len() => {
                self.bytes[off..off + data.len()].copy_from_slice(data);
            }
            _ => {
                for (i, &b) in data.iter().enumerate() {
                    self.set_byte(addr.wrapping_add(i as u64), b);
                }
            }
        }
    }

    fn is_mapped(&self, addr: Address) -> bool {
        self.offset(addr).is_some()
    }
}
