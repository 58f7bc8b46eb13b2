//! Bridges any [`Nvm`] backend to the [`embedded_storage`] NOR flash traits, so this crate's
//! stack can be handed to other crates (filesystems, bootloaders) that consume that ecosystem
//! contract instead of `Nvm` directly.

use crate::{Nvm, NvmError};
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};

/// Wraps a backend `B` to expose it as [`ReadNorFlash`] / [`NorFlash`].
///
/// `embedded_storage` wants `ERASE_SIZE`/`WRITE_SIZE` as compile-time constants, but this crate's
/// backends only report their geometry at runtime (`Nvm::get_info`), so the caller states the
/// expected erase granularity as a const generic and [`NorFlashAdapter::new`] asserts it against
/// the backend's actual sector size.
pub struct NorFlashAdapter<B, const ERASE_SIZE: usize> {
    inner: B,
    capacity: u32,
}

impl<B: Nvm, const ERASE_SIZE: usize> NorFlashAdapter<B, ERASE_SIZE> {
    /// Panics if `ERASE_SIZE` doesn't match the backend's actual sector size.
    pub fn new(inner: B) -> Self {
        let info = inner.get_info();
        assert_eq!(
            info.sector_size as usize, ERASE_SIZE,
            "ERASE_SIZE does not match the backend's sector size"
        );
        Self {
            capacity: info.capacity_bytes() as u32,
            inner,
        }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: Nvm, const ERASE_SIZE: usize> ErrorType for NorFlashAdapter<B, ERASE_SIZE> {
    type Error = NvmError;
}

impl<B: Nvm, const ERASE_SIZE: usize> ReadNorFlash for NorFlashAdapter<B, ERASE_SIZE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.inner.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl<B: Nvm, const ERASE_SIZE: usize> NorFlash for NorFlashAdapter<B, ERASE_SIZE> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.inner.erase(from, to - from)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.inner.write(offset, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Memory;

    #[test]
    fn reads_and_writes_through_the_adapter() {
        let mut buf = [0xffu8; 64];
        let mut mem = Memory::new(&mut buf, 16);
        mem.start().unwrap();
        let mut adapter = NorFlashAdapter::<_, 16>::new(mem);

        adapter.write(0, &[0xaa; 4]).unwrap();
        let mut out = [0u8; 4];
        adapter.read(0, &mut out).unwrap();
        assert_eq!(out, [0xaa; 4]);

        adapter.erase(0, 16).unwrap();
        adapter.read(0, &mut out).unwrap();
        assert_eq!(out, [0xff; 4]);

        assert_eq!(adapter.capacity(), 64);
    }

    #[test]
    #[should_panic(expected = "ERASE_SIZE does not match")]
    fn mismatched_erase_size_panics() {
        let mut buf = [0xffu8; 64];
        let mut mem = Memory::new(&mut buf, 16);
        mem.start().unwrap();
        let _ = NorFlashAdapter::<_, 32>::new(mem);
    }
}
