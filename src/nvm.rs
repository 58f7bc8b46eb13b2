//! The NVM contract: the trait every backend implements and every composing layer consumes.

use crate::NvmError;

/// Static facts about a backend: its geometry, identification and write granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NvmInfo {
    /// Smallest erasable unit, in bytes.
    pub sector_size: u32,
    /// Number of sectors this backend exposes.
    pub sector_count: u32,
    /// Three-byte device identification (JEDEC manufacturer + device ID, or a synthetic value
    /// for non-SPI backends).
    pub identification: [u8; 3],
    /// `0` for byte-granular backends; otherwise writes must start at a multiple of this many
    /// bytes and cover a whole multiple of this many bytes.
    pub write_alignment: u32,
}

impl NvmInfo {
    /// Total addressable capacity in bytes (`sector_size * sector_count`), widened to `u64` so
    /// large chips don't overflow when both factors are near `u32::MAX`.
    pub fn capacity_bytes(&self) -> u64 {
        self.sector_size as u64 * self.sector_count as u64
    }
}

/// The composable block-device contract implemented by every backend in this crate.
///
/// All operations are synchronous and return `Ok(())` (or the requested value) on success, or a
/// [`NvmError`] otherwise. Implementations legal only in [`crate::NvmState::Ready`] return
/// [`NvmError::InvalidState`] when called in `Stop`.
pub trait Nvm {
    /// Bring the backend from `Stop` to `Ready`, running any recovery procedure the backend
    /// defines (Mirror header scan + copy, FEE arena scan + GC resume). Idempotent when already
    /// `Ready`.
    fn start(&mut self) -> Result<(), NvmError>;

    /// Return the backend to `Stop`. No operations other than `start` are legal afterwards.
    fn stop(&mut self) -> Result<(), NvmError>;

    /// Read `buf.len()` bytes starting at `start` into `buf`.
    fn read(&mut self, start: u32, buf: &mut [u8]) -> Result<(), NvmError>;

    /// Write `buf` starting at `start`, subject to the alignment declared by [`Nvm::get_info`].
    fn write(&mut self, start: u32, buf: &[u8]) -> Result<(), NvmError>;

    /// Erase `n` bytes starting at `start`. The range must cover whole sectors.
    fn erase(&mut self, start: u32, n: u32) -> Result<(), NvmError>;

    /// Erase everything this backend owns.
    fn mass_erase(&mut self) -> Result<(), NvmError>;

    /// Block until all prior writes and erases are durable.
    fn sync(&mut self) -> Result<(), NvmError>;

    /// Static geometry and identification for this backend.
    fn get_info(&self) -> NvmInfo;

    /// Protect `n` bytes starting at `start` against writes. Backends that cannot protect
    /// sub-ranges may treat this as a successful no-op.
    fn write_protect(&mut self, _start: u32, _n: u32) -> Result<(), NvmError> {
        Ok(())
    }

    /// Protect the entire backend against writes.
    fn mass_write_protect(&mut self) -> Result<(), NvmError> {
        Ok(())
    }

    /// Remove write protection from `n` bytes starting at `start`.
    fn write_unprotect(&mut self, _start: u32, _n: u32) -> Result<(), NvmError> {
        Ok(())
    }

    /// Remove write protection from the entire backend.
    fn mass_write_unprotect(&mut self) -> Result<(), NvmError> {
        Ok(())
    }

    /// Acquire the backend's optional lock (and the lock of anything it owns). A no-op for
    /// backends that hold none.
    fn acquire(&mut self) -> Result<(), NvmError> {
        Ok(())
    }

    /// Release the lock acquired by [`Nvm::acquire`].
    fn release(&mut self) -> Result<(), NvmError> {
        Ok(())
    }
}

/// Checks `[start, start+n)` against `capacity`, returning [`NvmError::InvalidArgument`] on
/// overflow or out-of-bounds access. Shared by every backend and composing layer so the bounds
/// policy is enforced once.
pub(crate) fn check_range(start: u32, n: u32, capacity: u64) -> Result<(), NvmError> {
    let end = (start as u64)
        .checked_add(n as u64)
        .ok_or(NvmError::InvalidArgument)?;
    if end > capacity {
        return Err(NvmError::InvalidArgument);
    }
    Ok(())
}
