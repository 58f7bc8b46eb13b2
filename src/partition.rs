//! A restricted sector window onto an underlying backend.

use crate::nvm::check_range;
use crate::{Nvm, NvmError, NvmInfo, NvmState};

/// Exposes `[sector_offset, sector_offset + sector_count)` of `B` as its own standalone backend.
///
/// Every operation translates the caller's address by `sector_offset * underlying_sector_size`
/// and is bounds-checked against the window before being delegated; an access that would escape
/// the window fails with [`NvmError::InvalidArgument`] rather than touching bytes outside it.
pub struct Partition<B> {
    underlying: B,
    sector_offset: u32,
    sector_count: u32,
    state: NvmState,
}

impl<B: Nvm> Partition<B> {
    /// `sector_offset..sector_offset+sector_count` must lie within `underlying`'s own sector
    /// count; panics otherwise (a static configuration error, not a runtime condition).
    pub fn new(underlying: B, sector_offset: u32, sector_count: u32) -> Self {
        let info = underlying.get_info();
        assert!(
            sector_offset as u64 + sector_count as u64 <= info.sector_count as u64,
            "partition window exceeds underlying sector count"
        );
        Self {
            underlying,
            sector_offset,
            sector_count,
            state: NvmState::Stop,
        }
    }

    fn byte_offset(&self) -> u64 {
        self.sector_offset as u64 * self.underlying.get_info().sector_size as u64
    }

    fn capacity(&self) -> u64 {
        self.sector_count as u64 * self.underlying.get_info().sector_size as u64
    }

    fn require_ready(&self) -> Result<(), NvmError> {
        if self.state != NvmState::Ready {
            return Err(NvmError::InvalidState);
        }
        Ok(())
    }

    /// Access to the underlying backend, e.g. to `stop()` a whole stack or inspect its state.
    pub fn into_inner(self) -> B {
        self.underlying
    }
}

impl<B: Nvm> Nvm for Partition<B> {
    fn start(&mut self) -> Result<(), NvmError> {
        self.underlying.start()?;
        self.state = NvmState::Ready;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.underlying.stop()?;
        self.state = NvmState::Stop;
        Ok(())
    }

    fn read(&mut self, start: u32, buf: &mut [u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, buf.len() as u32, self.capacity())?;
        let base = self.byte_offset() + start as u64;
        self.underlying.read(base as u32, buf)
    }

    fn write(&mut self, start: u32, buf: &[u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, buf.len() as u32, self.capacity())?;
        let base = self.byte_offset() + start as u64;
        self.underlying.write(base as u32, buf)
    }

    fn erase(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, n, self.capacity())?;
        let base = self.byte_offset() + start as u64;
        self.underlying.erase(base as u32, n)
    }

    fn mass_erase(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        let base = self.byte_offset() as u32;
        let n = self.capacity() as u32;
        self.underlying.erase(base, n)
    }

    fn sync(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.underlying.sync()
    }

    fn get_info(&self) -> NvmInfo {
        let underlying = self.underlying.get_info();
        NvmInfo {
            sector_size: underlying.sector_size,
            sector_count: self.sector_count,
            identification: underlying.identification,
            write_alignment: underlying.write_alignment,
        }
    }

    fn write_protect(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, n, self.capacity())?;
        let base = self.byte_offset() + start as u64;
        self.underlying.write_protect(base as u32, n)
    }

    fn mass_write_protect(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        let base = self.byte_offset() as u32;
        let n = self.capacity() as u32;
        self.underlying.write_protect(base, n)
    }

    fn write_unprotect(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, n, self.capacity())?;
        let base = self.byte_offset() + start as u64;
        self.underlying.write_unprotect(base as u32, n)
    }

    fn mass_write_unprotect(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        let base = self.byte_offset() as u32;
        let n = self.capacity() as u32;
        self.underlying.write_unprotect(base, n)
    }

    fn acquire(&mut self) -> Result<(), NvmError> {
        self.underlying.acquire()
    }

    fn release(&mut self) -> Result<(), NvmError> {
        self.underlying.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Memory;

    #[test]
    fn partition_windows_a_sector_range() {
        let mut buf = [0xffu8; 16 * 256];
        let mut mem = Memory::new(&mut buf, 256);
        mem.start().unwrap();
        let mut part = Partition::new(mem, 4, 8);
        part.start().unwrap();

        assert_eq!(part.get_info().sector_count, 8);
        assert_eq!(part.get_info().sector_size, 256);

        part.write(10, &[0x55; 100]).unwrap();
        part.sync().unwrap();

        let mut underlying = part.into_inner();
        let mut check = [0u8; 100];
        underlying.read(4 * 256 + 10, &mut check).unwrap();
        assert_eq!(check, [0x55; 100]);

        let mut untouched = [0u8; 1];
        underlying.read(0, &mut untouched).unwrap();
        assert_eq!(untouched[0], 0xff);
    }

    #[test]
    fn out_of_window_access_is_rejected() {
        let mut buf = [0xffu8; 16 * 256];
        let mut mem = Memory::new(&mut buf, 256);
        mem.start().unwrap();
        let mut part = Partition::new(mem, 4, 8);
        part.start().unwrap();

        assert_eq!(
            part.write(8 * 256 - 1, &[0, 0]),
            Err(NvmError::InvalidArgument)
        );
    }
}
