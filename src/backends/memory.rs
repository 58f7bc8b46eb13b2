use crate::nvm::check_range;
use crate::{Nvm, NvmError, NvmInfo, NvmState};

/// A backend over a caller-owned byte buffer.
///
/// Used for deterministic unit tests and desktop simulation of the layers built on top of the
/// `Nvm` contract. Writes are applied as a bitwise AND of the new data against the current
/// contents, the same way a real NOR/NAND cell behaves (a write can only clear bits; only an
/// erase can set them back to `1`). This means a higher layer that violates the monotonic-write
/// rule — writing over a cell without erasing it first, expecting an overwrite — is caught here
/// exactly as it would be on real silicon, rather than silently "working" the way a naive
/// `copy_from_slice` fake would.
pub struct Memory<'a> {
    buf: &'a mut [u8],
    sector_size: u32,
    identification: [u8; 3],
    state: NvmState,
}

impl<'a> Memory<'a> {
    /// Wrap `buf` as a backend with the given `sector_size`. `buf.len()` must be an exact
    /// multiple of `sector_size`; panics otherwise, since this is a programmer error in test/sim
    /// setup, not a runtime condition.
    pub fn new(buf: &'a mut [u8], sector_size: u32) -> Self {
        assert!(sector_size > 0, "sector_size must be nonzero");
        assert!(
            buf.len() % sector_size as usize == 0,
            "buffer length must be a multiple of sector_size"
        );
        Self {
            buf,
            sector_size,
            identification: [0xff, 0xff, 0xff],
            state: NvmState::Stop,
        }
    }

    /// Override the synthetic three-byte identification reported by [`Nvm::get_info`].
    pub fn with_identification(mut self, identification: [u8; 3]) -> Self {
        self.identification = identification;
        self
    }

    fn sector_count(&self) -> u32 {
        (self.buf.len() / self.sector_size as usize) as u32
    }

    fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    fn require_ready(&self) -> Result<(), NvmError> {
        if self.state != NvmState::Ready {
            return Err(NvmError::InvalidState);
        }
        Ok(())
    }
}

impl<'a> Nvm for Memory<'a> {
    fn start(&mut self) -> Result<(), NvmError> {
        self.state = NvmState::Ready;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.state = NvmState::Stop;
        Ok(())
    }

    fn read(&mut self, start: u32, buf: &mut [u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, buf.len() as u32, self.capacity())?;
        let start = start as usize;
        buf.copy_from_slice(&self.buf[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, start: u32, data: &[u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, data.len() as u32, self.capacity())?;
        let start = start as usize;
        for (cell, new) in self.buf[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *new;
        }
        Ok(())
    }

    fn erase(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, n, self.capacity())?;
        if start % self.sector_size != 0 || n % self.sector_size != 0 {
            return Err(NvmError::InvalidArgument);
        }
        let start = start as usize;
        let n = n as usize;
        self.buf[start..start + n].fill(0xff);
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.buf.fill(0xff);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), NvmError> {
        self.require_ready()
    }

    fn get_info(&self) -> NvmInfo {
        NvmInfo {
            sector_size: self.sector_size,
            sector_count: self.sector_count(),
            identification: self.identification,
            write_alignment: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_clears_bits_only() {
        let mut buf = [0xff; 64];
        let mut mem = Memory::new(&mut buf, 16);
        mem.start().unwrap();
        mem.write(0, &[0b1010_1010]).unwrap();
        // writing 0x11 should only clear bits already clear in 0xAA won't set any
        mem.write(0, &[0b1111_1111]).unwrap();
        let mut out = [0u8; 1];
        mem.read(0, &mut out).unwrap();
        assert_eq!(out[0], 0b1010_1010, "write cannot set bits back to 1");
    }

    #[test]
    fn erase_resets_to_0xff_and_respects_sector_bounds() {
        let mut buf = [0u8; 32];
        let mut mem = Memory::new(&mut buf, 16);
        mem.start().unwrap();
        mem.erase(0, 16).unwrap();
        let mut out = [0u8; 16];
        mem.read(0, &mut out).unwrap();
        assert_eq!(out, [0xff; 16]);
        assert_eq!(mem.erase(0, 8), Err(NvmError::InvalidArgument));
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut buf = [0xff; 16];
        let mut mem = Memory::new(&mut buf, 16);
        mem.start().unwrap();
        let mut out = [0u8; 4];
        assert_eq!(mem.read(15, &mut out), Err(NvmError::InvalidArgument));
    }

    #[test]
    fn operations_require_ready_state() {
        let mut buf = [0xff; 16];
        let mut mem = Memory::new(&mut buf, 16);
        let mut out = [0u8; 4];
        assert_eq!(mem.read(0, &mut out), Err(NvmError::InvalidState));
        mem.start().unwrap();
        assert!(mem.read(0, &mut out).is_ok());
    }
}
