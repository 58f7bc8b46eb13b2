use crate::nvm::check_range;
use crate::{Nvm, NvmError, NvmInfo, NvmState};
use std::fs::{File as StdFile, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A backend over a host file, used for desktop simulation of higher layers against an image
/// that survives process restarts (unlike [`crate::backends::Memory`]).
///
/// Same monotonic-write (bitwise AND) semantics as `Memory` — see its documentation.
pub struct File {
    file: StdFile,
    sector_size: u32,
    sector_count: u32,
    identification: [u8; 3],
    state: NvmState,
}

impl File {
    /// Open (or create) `path` as a backend of `sector_size * sector_count` bytes. A freshly
    /// created image is padded with `0xff` so the erased-state contract holds immediately; an
    /// existing image is opened as-is and its length must already match.
    pub fn open(
        path: impl AsRef<Path>,
        sector_size: u32,
        sector_count: u32,
    ) -> std::io::Result<Self> {
        let capacity = sector_size as u64 * sector_count as u64;
        let existed = path.as_ref().exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !existed {
            let filler = vec![0xffu8; sector_size as usize];
            for _ in 0..sector_count {
                file.write_all(&filler)?;
            }
            file.sync_all()?;
        } else {
            let len = file.metadata()?.len();
            assert_eq!(
                len, capacity,
                "existing file image length does not match sector_size * sector_count"
            );
        }

        Ok(Self {
            file,
            sector_size,
            sector_count,
            identification: [0xff, 0xff, 0xff],
            state: NvmState::Stop,
        })
    }

    /// Override the synthetic three-byte identification reported by [`Nvm::get_info`].
    pub fn with_identification(mut self, identification: [u8; 3]) -> Self {
        self.identification = identification;
        self
    }

    fn capacity(&self) -> u64 {
        self.sector_size as u64 * self.sector_count as u64
    }

    fn require_ready(&self) -> Result<(), NvmError> {
        if self.state != NvmState::Ready {
            return Err(NvmError::InvalidState);
        }
        Ok(())
    }
}

impl Nvm for File {
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
        self.file
            .seek(SeekFrom::Start(start as u64))
            .map_err(|_| NvmError::IoFailure)?;
        self.file.read_exact(buf).map_err(|_| NvmError::IoFailure)
    }

    fn write(&mut self, start: u32, data: &[u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, data.len() as u32, self.capacity())?;
        let mut current = vec![0u8; data.len()];
        self.file
            .seek(SeekFrom::Start(start as u64))
            .map_err(|_| NvmError::IoFailure)?;
        self.file
            .read_exact(&mut current)
            .map_err(|_| NvmError::IoFailure)?;
        for (cell, new) in current.iter_mut().zip(data) {
            *cell &= *new;
        }
        self.file
            .seek(SeekFrom::Start(start as u64))
            .map_err(|_| NvmError::IoFailure)?;
        self.file
            .write_all(&current)
            .map_err(|_| NvmError::IoFailure)
    }

    fn erase(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(start, n, self.capacity())?;
        if start % self.sector_size != 0 || n % self.sector_size != 0 {
            return Err(NvmError::InvalidArgument);
        }
        let filler = vec![0xffu8; n as usize];
        self.file
            .seek(SeekFrom::Start(start as u64))
            .map_err(|_| NvmError::IoFailure)?;
        self.file
            .write_all(&filler)
            .map_err(|_| NvmError::IoFailure)
    }

    fn mass_erase(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        let filler = vec![0xffu8; self.sector_size as usize];
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|_| NvmError::IoFailure)?;
        for _ in 0..self.sector_count {
            self.file
                .write_all(&filler)
                .map_err(|_| NvmError::IoFailure)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.file.sync_data().map_err(|_| NvmError::IoFailure)
    }

    fn get_info(&self) -> NvmInfo {
        NvmInfo {
            sector_size: self.sector_size,
            sector_count: self.sector_count,
            identification: self.identification,
            write_alignment: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_a_fresh_image() {
        let dir = std::env::temp_dir().join(format!("nvm-stack-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.bin");
        let _ = std::fs::remove_file(&path);

        let mut file = File::open(&path, 64, 4).unwrap();
        file.start().unwrap();
        let mut out = [0u8; 4];
        file.read(0, &mut out).unwrap();
        assert_eq!(out, [0xff; 4]);

        file.write(0, &[0x55, 0x55]).unwrap();
        file.sync().unwrap();
        file.read(0, &mut out).unwrap();
        assert_eq!(&out[..2], &[0x55, 0x55]);

        file.erase(0, 64).unwrap();
        file.read(0, &mut out).unwrap();
        assert_eq!(out, [0xff; 4]);

        std::fs::remove_file(&path).ok();
    }
}
