//! A command engine for JEDEC-compatible SPI NOR/EEPROM flash chips.
//!
//! Unlike the chip-specific driver this crate started from (one hard-coded opcode table for a
//! single Winbond part), [`JedecSpi`] takes its geometry and opcode table as data
//! ([`JedecConfig`] / [`JedecCommands`]), so the same command-sequencing engine — wait-busy,
//! write-enable, page splitting, block-protect bit math, JEDEC ID decoding — serves any chip in
//! the family by supplying a different configuration.

use crate::nvm::check_range;
use crate::{Nvm, NvmError, NvmInfo, NvmState};
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};

/// Maximum padding a single unaligned page-program request can require on either side. Bounds a
/// stack scratch buffer instead of requiring allocation; `page_alignment` is validated to fit
/// within it.
const MAX_ALIGN_PAD: usize = 32;

/// How many times [`JedecSpi`] polls the busy bit back-to-back before it starts yielding via
/// `DelayNs` between polls.
const IMMEDIATE_POLLS: u32 = 4;

/// Upper bound on busy polls (immediate + delayed) before a wait-busy loop reports
/// [`NvmError::Timeout`] instead of spinning forever against a wedged chip.
const MAX_POLLS: u32 = 1_000_000;

const STATUS_BUSY_BIT: u8 = 0b0000_0001;
const STATUS_WEL_BIT: u8 = 0b0000_0010;
/// Block-protect bits occupy bits 2.. of the status register on every JEDEC-family part this
/// engine has been used against.
const BP_SHIFT: u8 = 2;

/// Geometry and write-granularity parameters for one chip.
#[derive(Debug, Clone, Copy)]
pub struct JedecConfig {
    pub sector_count: u32,
    pub sector_size: u32,
    pub page_size: u32,
    /// `0` disables padding; writes must then already be page-sized chunks. Otherwise must be a
    /// power of two no greater than `page_size` (and no greater than [`MAX_ALIGN_PAD`]).
    pub page_alignment: u32,
    /// 3 or 4.
    pub addr_bytes: u8,
    /// Number of block-protect bits in the status register, 0–3.
    pub bp_bits: u8,
}

impl JedecConfig {
    pub fn validate(&self) -> Result<(), NvmError> {
        let ok = self.sector_count > 0
            && self.sector_size > 0
            && self.page_size > 0
            && self.page_size.is_power_of_two()
            && (self.addr_bytes == 3 || self.addr_bytes == 4)
            && self.bp_bits <= 3
            && (self.page_alignment == 0
                || (self.page_alignment.is_power_of_two()
                    && self.page_alignment <= self.page_size
                    && self.page_alignment as usize <= MAX_ALIGN_PAD));
        if ok {
            Ok(())
        } else {
            Err(NvmError::InvalidArgument)
        }
    }

    fn capacity(&self) -> u64 {
        self.sector_size as u64 * self.sector_count as u64
    }
}

/// Opcode table for one chip. The `standard()` constructor gives the opcodes common to most
/// 25-series parts (Winbond/Macronix/ISSI/Micron etc.); chips that diverge (no erase opcode,
/// AAI auto-increment programming, a fast-read dummy byte) are expressed by building a
/// `JedecCommands` directly.
#[derive(Debug, Clone, Copy)]
pub struct JedecCommands {
    pub read: u8,
    /// Number of dummy bytes clocked out after the address and before data starts, e.g. 1 for
    /// the 0x0b fast-read opcode.
    pub read_dummy_bytes: u8,
    /// `None` when the chip has no erase opcode at all; erase is then emulated by programming
    /// the whole sector to `0xff`.
    pub sector_erase: Option<u8>,
    pub page_program: u8,
    /// Auto-Address-Increment programming (opcode `0xad` on SST-style chips): after the first
    /// two-byte word (sent with the address), subsequent words are sent as opcode + two data
    /// bytes with no address, and an explicit write-disable is required after the last word.
    pub page_program_is_aai: bool,
    pub write_enable: u8,
    pub write_disable: u8,
    pub read_status: u8,
    pub write_status: u8,
    pub read_jedec_id: u8,
}

impl JedecCommands {
    /// Opcodes shared by most 25-series SPI NOR chips.
    pub const fn standard() -> Self {
        Self {
            read: 0x03,
            read_dummy_bytes: 0,
            sector_erase: Some(0x20),
            page_program: 0x02,
            page_program_is_aai: false,
            write_enable: 0x06,
            write_disable: 0x04,
            read_status: 0x05,
            write_status: 0x01,
            read_jedec_id: 0x9f,
        }
    }

    /// Like [`Self::standard`] but reading with the 0x0b fast-read opcode, which clocks one
    /// dummy byte between address and data.
    pub const fn standard_fast_read() -> Self {
        Self {
            read: 0x0b,
            read_dummy_bytes: 1,
            ..Self::standard()
        }
    }
}

/// Three-byte JEDEC manufacturer/device identification, decoded from an RDID response that may
/// carry leading `0x7f` manufacturer-continuation bytes.
pub struct Identification {
    bytes: [u8; 3],
    continuations: u8,
}

impl Identification {
    /// Decode an `Identification` from a raw RDID response, skipping any leading `0x7f`
    /// continuation bytes (e.g. `7F 7F 7F 7F 7F 7F C2 22 08` for a Cypress/Ramtron part).
    pub fn from_jedec_id(buf: &[u8]) -> Self {
        let mut start = 0;
        for (i, b) in buf.iter().enumerate() {
            if *b != 0x7f {
                start = i;
                break;
            }
        }
        let mut bytes = [0xff; 3];
        for (i, b) in buf[start..].iter().take(3).enumerate() {
            bytes[i] = *b;
        }
        Self {
            bytes,
            continuations: start as u8,
        }
    }

    pub fn mfr_code(&self) -> u8 {
        self.bytes[0]
    }

    pub fn device_id(&self) -> [u8; 2] {
        [self.bytes[1], self.bytes[2]]
    }

    pub fn continuation_count(&self) -> u8 {
        self.continuations
    }

    pub fn bytes(&self) -> [u8; 3] {
        self.bytes
    }
}

/// A JEDEC-compatible SPI NOR/EEPROM flash chip, driven purely through `embedded-hal` 1.0
/// [`SpiDevice`] and [`DelayNs`] — no GPIO pins are needed, since block protection here is the
/// software status-register mechanism, not a hardware `/WP` signal.
pub struct JedecSpi<SPI, DELAY> {
    spi: SPI,
    delay: DELAY,
    config: JedecConfig,
    commands: JedecCommands,
    bp: u8,
    state: NvmState,
}

impl<SPI, DELAY, E> JedecSpi<SPI, DELAY>
where
    SPI: SpiDevice<Error = E>,
    DELAY: DelayNs,
{
    pub fn new(
        spi: SPI,
        delay: DELAY,
        config: JedecConfig,
        commands: JedecCommands,
    ) -> Result<Self, NvmError> {
        config.validate()?;
        Ok(Self {
            spi,
            delay,
            config,
            commands,
            bp: 0,
            state: NvmState::Stop,
        })
    }

    /// Hand back the SPI device and delay provider, consuming `self`. Named `free` rather than
    /// `release` to avoid colliding with [`Nvm::release`]'s lock-release method.
    pub fn free(self) -> (SPI, DELAY) {
        (self.spi, self.delay)
    }

    fn capacity(&self) -> u64 {
        self.config.capacity()
    }

    fn require_ready(&self) -> Result<(), NvmError> {
        if self.state != NvmState::Ready {
            return Err(NvmError::InvalidState);
        }
        Ok(())
    }

    fn command_and_address(&self, command: u8, address: u32) -> [u8; 5] {
        let b = address.to_be_bytes();
        match self.config.addr_bytes {
            3 => [command, b[1], b[2], b[3], 0],
            _ => [command, b[0], b[1], b[2], b[3]],
        }
    }

    fn cmd_len(&self) -> usize {
        1 + self.config.addr_bytes as usize
    }

    fn transaction(&mut self, ops: &mut [Operation<'_, u8>]) -> Result<(), NvmError> {
        self.spi.transaction(ops).map_err(|_| {
            #[cfg(feature = "defmt")]
            defmt::error!("jedec spi transaction failed");
            NvmError::IoFailure
        })
    }

    fn read_status(&mut self) -> Result<u8, NvmError> {
        let mut buf = [self.commands.read_status, 0];
        self.transaction(&mut [Operation::TransferInPlace(&mut buf)])?;
        Ok(buf[1])
    }

    /// Polls the busy bit: a few times back-to-back, then yielding to `DELAY` between polls.
    fn wait_busy(&mut self) -> Result<(), NvmError> {
        for i in 0..MAX_POLLS {
            if self.read_status()? & STATUS_BUSY_BIT == 0 {
                return Ok(());
            }
            if i >= IMMEDIATE_POLLS {
                self.delay.delay_us(50);
            }
        }
        Err(NvmError::Timeout)
    }

    fn write_enable(&mut self) -> Result<(), NvmError> {
        self.transaction(&mut [Operation::Write(&[self.commands.write_enable])])?;
        if self.read_status()? & STATUS_WEL_BIT == 0 {
            return Err(NvmError::IoFailure);
        }
        Ok(())
    }

    fn write_disable(&mut self) -> Result<(), NvmError> {
        self.transaction(&mut [Operation::Write(&[self.commands.write_disable])])
    }

    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(address, buf.len() as u32, self.capacity())?;
        let cmd = self.command_and_address(self.commands.read, address);
        let cmd_len = self.cmd_len();
        if self.commands.read_dummy_bytes > 0 {
            let dummy = [0u8; 1];
            self.transaction(&mut [
                Operation::Write(&cmd[..cmd_len]),
                Operation::Write(&dummy[..self.commands.read_dummy_bytes as usize]),
                Operation::Read(buf),
            ])
        } else {
            self.transaction(&mut [Operation::Write(&cmd[..cmd_len]), Operation::Read(buf)])
        }
    }

    /// Programs `data` (which must already lie within a single page) at `address`, padding with
    /// `0xff` on either side when `page_alignment` requires it.
    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), NvmError> {
        let align = self.config.page_alignment;
        if align == 0 {
            return self.aligned_program(address, data);
        }
        let pad_front = address % align;
        let unaligned_len = pad_front + data.len() as u32;
        let pad_back = (align - unaligned_len % align) % align;
        if pad_front == 0 && pad_back == 0 {
            return self.aligned_program(address, data);
        }
        let total = (pad_front + data.len() as u32 + pad_back) as usize;
        let mut scratch = [0xffu8; MAX_ALIGN_PAD];
        if total > scratch.len() {
            return Err(NvmError::InvalidArgument);
        }
        scratch[pad_front as usize..pad_front as usize + data.len()].copy_from_slice(data);
        self.aligned_program(address - pad_front, &scratch[..total])
    }

    /// Issues the actual program command(s) for a chunk already known to be page-aligned and to
    /// fit within one page.
    fn aligned_program(&mut self, address: u32, data: &[u8]) -> Result<(), NvmError> {
        self.wait_busy()?;
        self.write_enable()?;
        let cmd = self.command_and_address(self.commands.page_program, address);
        let cmd_len = self.cmd_len();

        if self.commands.page_program_is_aai {
            if data.is_empty() || data.len() % 2 != 0 {
                return Err(NvmError::InvalidArgument);
            }
            self.transaction(&mut [
                Operation::Write(&cmd[..cmd_len]),
                Operation::Write(&data[..2]),
            ])?;
            self.wait_busy()?;
            for word in data[2..].chunks(2) {
                self.transaction(&mut [
                    Operation::Write(&[self.commands.page_program]),
                    Operation::Write(word),
                ])?;
                self.wait_busy()?;
            }
            self.write_disable()?;
        } else {
            self.transaction(&mut [Operation::Write(&cmd[..cmd_len]), Operation::Write(data)])?;
            self.wait_busy()?;
        }

        #[cfg(feature = "defmt")]
        defmt::trace!("jedec: programmed {} bytes at {:x}", data.len(), address);

        #[cfg(feature = "readback-check")]
        self.verify_readback(address, data)?;

        Ok(())
    }

    /// Re-reads `data.len()` bytes from `address` and compares against `data`, in bounded chunks
    /// so no allocation is needed regardless of page size. Enabled by the `readback-check`
    /// feature for callers who want paranoid verification of every program operation at the cost
    /// of doubling bus traffic.
    #[cfg(feature = "readback-check")]
    fn verify_readback(&mut self, address: u32, data: &[u8]) -> Result<(), NvmError> {
        const CHUNK: usize = 64;
        let mut buf = [0u8; CHUNK];
        let mut offset = 0usize;
        while offset < data.len() {
            let len = CHUNK.min(data.len() - offset);
            self.read(address + offset as u32, &mut buf[..len])?;
            if buf[..len] != data[offset..offset + len] {
                #[cfg(feature = "defmt")]
                defmt::error!("jedec: readback mismatch at {:x}", address + offset as u32);
                return Err(NvmError::IoFailure);
            }
            offset += len;
        }
        Ok(())
    }

    pub fn write(&mut self, mut address: u32, buf: &[u8]) -> Result<(), NvmError> {
        self.require_ready()?;
        check_range(address, buf.len() as u32, self.capacity())?;
        let mut offset = 0usize;
        while offset < buf.len() {
            let page_pos = address % self.config.page_size;
            let chunk_len =
                core::cmp::min(self.config.page_size - page_pos, (buf.len() - offset) as u32)
                    as usize;
            self.write_page(address, &buf[offset..offset + chunk_len])?;
            address += chunk_len as u32;
            offset += chunk_len;
        }
        Ok(())
    }

    pub fn erase_sector(&mut self, index: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        if index >= self.config.sector_count {
            return Err(NvmError::InvalidArgument);
        }
        let address = index * self.config.sector_size;

        match self.commands.sector_erase {
            Some(op) => {
                self.wait_busy()?;
                self.write_enable()?;
                let cmd = self.command_and_address(op, address);
                let cmd_len = self.cmd_len();
                self.transaction(&mut [Operation::Write(&cmd[..cmd_len])])?;
                self.wait_busy()?;
            }
            None => {
                #[cfg(feature = "defmt")]
                defmt::debug!("jedec: emulating erase of sector {} via program", index);
                const CHUNK: usize = 64;
                let filler = [0xffu8; CHUNK];
                let mut done = 0u32;
                while done < self.config.sector_size {
                    let len =
                        core::cmp::min(CHUNK as u32, self.config.sector_size - done) as usize;
                    self.write(address + done, &filler[..len])?;
                    done += len as u32;
                }
            }
        }

        #[cfg(feature = "defmt")]
        defmt::trace!("jedec: erased sector {}", index);
        Ok(())
    }

    fn max_bp(&self) -> u8 {
        if self.config.bp_bits == 0 {
            0
        } else {
            (1u8 << self.config.bp_bits) - 1
        }
    }

    fn first_protected_address(&self, bp: u8) -> u64 {
        if bp == 0 {
            return self.capacity();
        }
        let capacity = self.capacity();
        let protected = capacity * (1u64 << (bp - 1)) / (1u64 << self.config.bp_bits);
        capacity - protected
    }

    fn apply_bp(&mut self) -> Result<(), NvmError> {
        if self.config.bp_bits == 0 {
            return Ok(());
        }
        self.wait_busy()?;
        self.write_enable()?;
        let sr = self.read_status()?;
        let mask = self.max_bp() << BP_SHIFT;
        let new_sr = (sr & !mask) | (self.bp << BP_SHIFT);
        self.transaction(&mut [Operation::Write(&[self.commands.write_status, new_sr])])?;
        self.wait_busy()
    }

    pub fn identify(&mut self) -> Result<Identification, NvmError> {
        self.require_ready()?;
        let mut buf = [0u8; 12];
        self.transaction(&mut [
            Operation::Write(&[self.commands.read_jedec_id]),
            Operation::Read(&mut buf),
        ])?;
        Ok(Identification::from_jedec_id(&buf))
    }
}

impl<SPI, DELAY, E> Nvm for JedecSpi<SPI, DELAY>
where
    SPI: SpiDevice<Error = E>,
    DELAY: DelayNs,
{
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
        JedecSpi::read(self, start, buf)
    }

    fn write(&mut self, start: u32, buf: &[u8]) -> Result<(), NvmError> {
        JedecSpi::write(self, start, buf)
    }

    fn erase(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        if start % self.config.sector_size != 0 || n % self.config.sector_size != 0 {
            return Err(NvmError::InvalidArgument);
        }
        let first = start / self.config.sector_size;
        let count = n / self.config.sector_size;
        for index in first..first + count {
            self.erase_sector(index)?;
        }
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        for index in 0..self.config.sector_count {
            self.erase_sector(index)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), NvmError> {
        self.require_ready()
    }

    fn get_info(&self) -> NvmInfo {
        NvmInfo {
            sector_size: self.config.sector_size,
            sector_count: self.config.sector_count,
            identification: [0xff, 0xff, 0xff],
            write_alignment: 0,
        }
    }

    fn write_protect(&mut self, start: u32, _n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        let max_bp = self.max_bp();
        while self.bp < max_bp && self.first_protected_address(self.bp) > start as u64 {
            self.bp += 1;
        }
        self.apply_bp()
    }

    fn mass_write_protect(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.bp = self.max_bp();
        self.apply_bp()
    }

    fn write_unprotect(&mut self, start: u32, n: u32) -> Result<(), NvmError> {
        self.require_ready()?;
        let end = start as u64 + n as u64;
        while self.bp > 0 && self.first_protected_address(self.bp) < end {
            self.bp -= 1;
        }
        self.apply_bp()
    }

    fn mass_write_unprotect(&mut self) -> Result<(), NvmError> {
        self.require_ready()?;
        self.bp = 0;
        self.apply_bp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_skips_continuation_bytes() {
        let bytes = [0x7f, 0x7f, 0x7f, 0x7f, 0x7f, 0x7f, 0xc2, 0x22, 0x08];
        let ident = Identification::from_jedec_id(&bytes);
        assert_eq!(ident.mfr_code(), 0xc2);
        assert_eq!(ident.continuation_count(), 6);
        assert_eq!(ident.device_id(), [0x22, 0x08]);
    }

    #[test]
    fn identification_with_no_continuation() {
        let bytes = [0xef, 0x40, 0x18];
        let ident = Identification::from_jedec_id(&bytes);
        assert_eq!(ident.mfr_code(), 0xef);
        assert_eq!(ident.continuation_count(), 0);
    }

    #[test]
    fn config_rejects_bad_alignment() {
        let mut cfg = JedecConfig {
            sector_count: 16,
            sector_size: 4096,
            page_size: 256,
            page_alignment: 3,
            addr_bytes: 3,
            bp_bits: 2,
        };
        assert_eq!(cfg.validate(), Err(NvmError::InvalidArgument));
        cfg.page_alignment = 512;
        assert_eq!(cfg.validate(), Err(NvmError::InvalidArgument));
        cfg.page_alignment = 16;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn block_protect_boundary_halves_with_each_step() {
        // capacity 1 MiB, bp_bits = 2: bp=1 protects capacity/4 (last quarter), and
        // first_protected_address(1) should equal capacity - capacity/4.
        let cfg = JedecConfig {
            sector_count: 256,
            sector_size: 4096,
            page_size: 256,
            page_alignment: 0,
            addr_bytes: 3,
            bp_bits: 2,
        };
        let capacity = cfg.capacity();
        let fake = FakeJedec { cfg };
        assert_eq!(fake.first_protected_address(0), capacity);
        assert_eq!(fake.first_protected_address(1), capacity - capacity / 4);
        assert_eq!(fake.first_protected_address(2), capacity - capacity / 2);
        assert_eq!(fake.first_protected_address(3), capacity - capacity);
    }

    // Exercises the pure BP-bit arithmetic without needing a real SpiDevice.
    struct FakeJedec {
        cfg: JedecConfig,
    }

    impl FakeJedec {
        fn first_protected_address(&self, bp: u8) -> u64 {
            if bp == 0 {
                return self.cfg.capacity();
            }
            let capacity = self.cfg.capacity();
            let protected = capacity * (1u64 << (bp - 1)) / (1u64 << self.cfg.bp_bits);
            capacity - protected
        }
    }
}
