//! Host-side test tooling: a fault-injecting `Nvm` wrapper for exercising power-fail recovery.

use crate::{Nvm, NvmError, NvmInfo};

/// Wraps a backend and can simulate power loss after a chosen number of mutating primitive
/// calls (`write`, `erase`, `mass_erase`, `sync`).
///
/// [`FaultInjector::arm`] counts down across the wrapped primitives; the call that would be the
/// `(n+1)`th fails with [`NvmError::IoFailure`] without reaching the underlying backend, and every
/// call after that fails the same way until [`FaultInjector::disarm`] is called. This models a
/// power loss landing between two specific underlying operations, which is the granularity
/// [`crate::Mirror`] and [`crate::Fee`] need their recovery procedures tested against — a crash
/// inside a single Rust call can't be simulated any finer than at its call boundaries.
pub struct FaultInjector<B> {
    inner: B,
    countdown: Option<u32>,
    tripped: bool,
}

impl<B: Nvm> FaultInjector<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            countdown: None,
            tripped: false,
        }
    }

    /// Allow exactly `n` more mutating primitives to succeed, then fail every one after that.
    pub fn arm(&mut self, n: u32) {
        self.countdown = Some(n);
        self.tripped = false;
    }

    /// Stop injecting faults.
    pub fn disarm(&mut self) {
        self.countdown = None;
        self.tripped = false;
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn tick(&mut self) -> Result<(), NvmError> {
        if self.tripped {
            return Err(NvmError::IoFailure);
        }
        if let Some(remaining) = self.countdown {
            if remaining == 0 {
                self.tripped = true;
                return Err(NvmError::IoFailure);
            }
            self.countdown = Some(remaining - 1);
        }
        Ok(())
    }
}

impl<B: Nvm> Nvm for FaultInjector<B> {
    fn start(&mut self) -> Result<(), NvmError> {
        self.inner.start()
    }

    fn stop(&mut self) -> Result<(), NvmError> {
        self.inner.stop()
    }

    fn read(&mut self, start: u32, buf: &mut [u8]) -> Result<(), NvmError> {
        self.inner.read(start, buf)
    }

    fn write(&mut self, start: u32, buf: &[u8]) -> Result<(), NvmError> {
        self.tick()?;
        self.inner.write(start, buf)
    }

    fn erase(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.tick()?;
        self.inner.erase(start, n)
    }

    fn mass_erase(&mut self) -> Result<(), NvmError> {
        self.tick()?;
        self.inner.mass_erase()
    }

    fn sync(&mut self) -> Result<(), NvmError> {
        self.tick()?;
        self.inner.sync()
    }

    fn get_info(&self) -> NvmInfo {
        self.inner.get_info()
    }

    fn write_protect(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.inner.write_protect(start, n)
    }

    fn mass_write_protect(&mut self) -> Result<(), NvmError> {
        self.inner.mass_write_protect()
    }

    fn write_unprotect(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.inner.write_unprotect(start, n)
    }

    fn mass_write_unprotect(&mut self) -> Result<(), NvmError> {
        self.inner.mass_write_unprotect()
    }

    fn acquire(&mut self) -> Result<(), NvmError> {
        self.inner.acquire()
    }

    fn release(&mut self) -> Result<(), NvmError> {
        self.inner.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Memory;

    #[test]
    fn arms_and_fails_on_the_nth_plus_one_primitive() {
        let mut buf = [0xffu8; 32];
        let mem = Memory::new(&mut buf, 16);
        let mut injector = FaultInjector::new(mem);
        injector.start().unwrap();

        injector.arm(1);
        injector.erase(0, 16).unwrap();
        assert_eq!(injector.erase(16, 16), Err(NvmError::IoFailure));
        assert_eq!(injector.sync(), Err(NvmError::IoFailure));

        injector.disarm();
        injector.erase(16, 16).unwrap();
    }
}
