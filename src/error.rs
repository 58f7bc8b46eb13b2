use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

/// The single error kind reported by every operation in the stack.
///
/// Errors from an underlying backend propagate verbatim through composing layers; a failed
/// state-mark update in [`crate::Mirror`] or [`crate::Fee`] aborts the mutation in progress and is
/// healed by the recovery procedure run on the next [`crate::Nvm::start`] rather than retried
/// locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum NvmError {
    /// Called while the backend is in [`NvmState::Stop`], or a write/erase was attempted while
    /// another mutating operation on the same instance was already in progress.
    InvalidState,
    /// The requested range falls outside the backend's capacity, or violates its declared
    /// `write_alignment` / sector alignment.
    InvalidArgument,
    /// The underlying bus, file, or chip reported a hardware error.
    IoFailure,
    /// A wait-busy poll loop exceeded its deadline.
    Timeout,
    /// An on-flash format was found to be self-inconsistent (FEE magic mismatch, unrecognized
    /// state mark pattern that isn't explained by power loss).
    CorruptedFormat,
}

impl NorFlashError for NvmError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            NvmError::InvalidArgument => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl core::fmt::Display for NvmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            NvmError::InvalidState => "operation invalid in current backend state",
            NvmError::InvalidArgument => "range out of bounds or misaligned",
            NvmError::IoFailure => "underlying I/O failure",
            NvmError::Timeout => "wait-busy poll exceeded its deadline",
            NvmError::CorruptedFormat => "on-flash format is corrupted",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NvmError {}

/// Lifecycle state of a backend instance.
///
/// Every backend starts in `Stop`. [`crate::Nvm::start`] runs recovery (where applicable) and
/// moves it to `Ready`. Operations are legal only in `Ready`, transiently passing through
/// `Reading`/`Writing`/`Erasing` for the duration of the call that triggered them.
/// [`crate::Nvm::stop`] returns to `Stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NvmState {
    Stop,
    Ready,
    Reading,
    Writing,
    Erasing,
}
