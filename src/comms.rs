//! Blocking driver for a 25-series SPI NOR flash on a raw
//! [`SpiBus`](embedded_hal::spi::SpiBus) with its
//! own select line.
//!
//! Every transaction asserts the select line inside a critical section, so an
//! interrupt handler sharing the bus cannot interleave a transfer with a
//! half-sent command frame. The line is deasserted again on every exit path.

use core::fmt::Debug;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi;

use crate::bus::BusControl;
use crate::commands::{
    address_bytes, crosses_page, device_id, page_chunks, Opcode, Status, GLOBAL_UNPROTECT,
    UNIQUE_ID_DUMMY_BYTES, UNIQUE_ID_LEN,
};
use crate::config::Config;
use crate::error::Error;
use crate::state::State;
use crate::traits::HardwareFlashDevice;

type FlashResult<T, SPI, CS> =
    Result<T, Error<<SPI as spi::ErrorType>::Error, <CS as digital::ErrorType>::Error>>;

pub struct SpiFlash<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    config: Config,
    state: State,
}

impl<SPI, CS, D> Debug for SpiFlash<SPI, CS, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpiFlash")
            .field("state", &self.state)
            .finish()
    }
}

impl<SPI, CS, D> SpiFlash<SPI, CS, D> {
    /// Binds the driver to a bus, a select line and a delay source. Nothing is
    /// sent until [`initialize`](Self::initialize).
    pub fn new(spi: SPI, cs: CS, delay: D, config: Config) -> Self {
        Self {
            spi,
            cs,
            delay,
            config,
            state: State::Uninitialized,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gives back the bus, select line and delay.
    pub fn release(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }
}

impl<SPI, CS, D> HardwareFlashDevice for SpiFlash<SPI, CS, D>
where
    SPI: BusControl,
    CS: OutputPin,
    D: DelayNs,
{
    type Error = Error<SPI::Error, CS::Error>;

    /// Burst read, see [`SpiFlash::read_bytes`].
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.read_bytes(addr, buf)
    }

    fn sector_erase(&mut self, addr: u32) -> Result<(), Self::Error> {
        self.block_erase_4k(addr)
    }

    fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.write_bytes(addr, data)
    }

    fn chip_erase(&mut self) -> Result<(), Self::Error> {
        SpiFlash::chip_erase(self)
    }
}

impl<SPI, CS, D> SpiFlash<SPI, CS, D>
where
    SPI: BusControl,
    CS: OutputPin,
    D: DelayNs,
{
    /// Brings up the select line and bus, checks the chip identity and clears
    /// all block protection bits.
    ///
    /// Protection defaults to on for many parts and nothing else in this
    /// driver manages it, so it is cleared here once. On an identity mismatch
    /// nothing is sent after the id read and the device stays
    /// [`State::Uninitialized`].
    pub fn initialize(&mut self) -> FlashResult<(), SPI, CS> {
        if self.state == State::Asleep {
            return Err(Error::InvalidState(self.state));
        }
        self.state = State::Uninitialized;

        self.cs.set_high().map_err(Error::Pin)?;
        self.spi.configure(&self.config.bus).map_err(Error::Spi)?;
        self.spi.start().map_err(Error::Spi)?;

        let found = self.read_id()?;
        if let Some(expected) = self.config.expected_id {
            if found != expected {
                warn!("flash id {:#x} does not match {:#x}", found, expected);
                return Err(Error::IdentityMismatch { expected, found });
            }
        }

        self.command(Opcode::WriteStatus, true, |spi| {
            spi.write(&[GLOBAL_UNPROTECT])
        })?;
        self.state = State::Idle;
        info!("flash {:#x} initialized", found);
        Ok(())
    }

    /// Stops the bus. The device has to be initialized again before use.
    pub fn end(&mut self) -> FlashResult<(), SPI, CS> {
        self.state = State::Uninitialized;
        self.spi.stop().map_err(Error::Spi)
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> FlashResult<Status, SPI, CS> {
        self.ensure_active()?;
        self.status()
    }

    /// Non-blocking check of the write-in-progress bit.
    pub fn busy(&mut self) -> FlashResult<bool, SPI, CS> {
        self.ensure_active()?;
        let busy = self.status()?.contains(Status::BUSY);
        self.state = if busy { State::Busy } else { State::Idle };
        Ok(busy)
    }

    /// Manufacturer and memory type bytes of the JEDEC id as one word.
    pub fn read_device_id(&mut self) -> FlashResult<u16, SPI, CS> {
        self.ensure_active()?;
        self.wait_ready()?;
        self.read_id()
    }

    /// Reads the 64-bit factory programmed unique id.
    pub fn read_unique_id(&mut self) -> FlashResult<[u8; UNIQUE_ID_LEN], SPI, CS> {
        self.ensure_active()?;
        let mut id = [0u8; UNIQUE_ID_LEN];
        self.command(Opcode::ReadUniqueId, false, |spi| {
            spi.write(&[0; UNIQUE_ID_DUMMY_BYTES])?;
            spi.read(&mut id)
        })?;
        Ok(id)
    }

    /// Reads one byte with the plain read instruction.
    ///
    /// Only 24 bits of `addr` are transferred, so the contents of parts
    /// smaller than 16 MiB are mirrored at multiples of their size.
    pub fn read_byte(&mut self, addr: u32) -> FlashResult<u8, SPI, CS> {
        self.ensure_active()?;
        let mut byte = [0u8; 1];
        self.command(Opcode::ArrayReadLowFreq, false, |spi| {
            spi.write(&address_bytes(addr))?;
            spi.read(&mut byte)
        })?;
        Ok(byte[0])
    }

    /// Fills `buf` starting at `addr` with the fast read instruction. The
    /// chip advances the address itself; an empty `buf` sends nothing.
    pub fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> FlashResult<(), SPI, CS> {
        self.ensure_active()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.command(Opcode::ArrayRead, false, |spi| {
            let [a2, a1, a0] = address_bytes(addr);
            // Address, then one don't care byte
            spi.write(&[a2, a1, a0, 0])?;
            spi.read(buf)
        })
    }

    /// Programs a single byte. The cell must have been erased; programming
    /// can only clear bits.
    pub fn write_byte(&mut self, addr: u32, value: u8) -> FlashResult<(), SPI, CS> {
        self.ensure_active()?;
        self.command(Opcode::PageProgram, true, |spi| {
            spi.write(&address_bytes(addr))?;
            spi.write(&[value])
        })?;
        self.state = State::Busy;
        Ok(())
    }

    /// Programs up to one page starting at `addr`.
    ///
    /// The chip's column counter wraps at the page boundary: bytes past the
    /// end of the page containing `addr` overwrite the start of that same
    /// page. Callers writing across pages must split the data themselves, or
    /// use [`write_pages`](Self::write_pages). With
    /// [`Config::check_page_boundary`] set such writes are rejected instead.
    ///
    /// The target bytes must have been erased.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> FlashResult<(), SPI, CS> {
        self.ensure_active()?;
        if data.is_empty() {
            return Ok(());
        }
        if self.config.check_page_boundary && crosses_page(addr, data.len(), self.config.page_size)
        {
            return Err(Error::PageBoundary {
                addr,
                len: data.len(),
            });
        }
        self.command(Opcode::PageProgram, true, |spi| {
            spi.write(&address_bytes(addr))?;
            spi.write(data)
        })?;
        self.state = State::Busy;
        Ok(())
    }

    /// Programs `data` of any length, one page program per page touched.
    pub fn write_pages(&mut self, addr: u32, data: &[u8]) -> FlashResult<(), SPI, CS> {
        for (addr, chunk) in page_chunks(addr, data, self.config.page_size) {
            self.write_bytes(addr, chunk)?;
        }
        Ok(())
    }

    /// Erases the whole array. Returns once the chip has accepted the
    /// command; poll [`busy`](Self::busy) or issue another command to wait
    /// for completion, which may take many seconds.
    pub fn chip_erase(&mut self) -> FlashResult<(), SPI, CS> {
        self.erase(Opcode::ChipErase, None)
    }

    /// Erases the 4 KiB sector containing `addr`.
    pub fn block_erase_4k(&mut self, addr: u32) -> FlashResult<(), SPI, CS> {
        self.erase(Opcode::BlockErase4K, Some(addr))
    }

    /// Erases the 32 KiB block containing `addr`.
    pub fn block_erase_32k(&mut self, addr: u32) -> FlashResult<(), SPI, CS> {
        self.erase(Opcode::BlockErase32K, Some(addr))
    }

    /// Erases the 64 KiB block containing `addr`.
    pub fn block_erase_64k(&mut self, addr: u32) -> FlashResult<(), SPI, CS> {
        self.erase(Opcode::BlockErase64K, Some(addr))
    }

    /// Enters deep power-down. Only [`wakeup`](Self::wakeup) is accepted
    /// afterwards.
    pub fn sleep(&mut self) -> FlashResult<(), SPI, CS> {
        self.ensure_active()?;
        self.command(Opcode::Sleep, false, |_| Ok(()))?;
        self.state = State::Asleep;
        debug!("flash entered deep power-down");
        Ok(())
    }

    /// Releases the chip from deep power-down and waits out the configured
    /// settling time. A sleeping chip does not answer status reads, so the
    /// busy-wait only runs when the driver is not in deep power-down.
    pub fn wakeup(&mut self) -> FlashResult<(), SPI, CS> {
        if !matches!(self.state, State::Asleep | State::Idle | State::Busy) {
            return Err(Error::InvalidState(self.state));
        }
        if self.state != State::Asleep {
            self.wait_ready()?;
        }
        self.transaction(|spi| spi.write(&[Opcode::Wake as u8]))?;
        self.delay.delay_us(self.config.wakeup_delay_us);
        if self.state == State::Asleep {
            self.state = State::Idle;
        }
        debug!("flash released from deep power-down");
        Ok(())
    }

    fn erase(&mut self, opcode: Opcode, addr: Option<u32>) -> FlashResult<(), SPI, CS> {
        self.ensure_active()?;
        self.command(opcode, true, |spi| match addr {
            Some(addr) => spi.write(&address_bytes(addr)),
            None => Ok(()),
        })?;
        self.state = State::Busy;
        Ok(())
    }

    fn ensure_active(&self) -> FlashResult<(), SPI, CS> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(Error::InvalidState(self.state))
        }
    }

    fn read_id(&mut self) -> FlashResult<u16, SPI, CS> {
        let mut id = [0u8; 2];
        self.transaction(|spi| {
            spi.write(&[Opcode::ReadId as u8])?;
            spi.read(&mut id)
        })?;
        Ok(device_id(id))
    }

    fn status(&mut self) -> FlashResult<Status, SPI, CS> {
        let mut status = [0u8; 1];
        self.transaction(|spi| {
            spi.write(&[Opcode::ReadStatus as u8])?;
            spi.read(&mut status)
        })?;
        Ok(Status::from_bits_truncate(status[0]))
    }

    /// Block until the status of the device is not busy, or the configured
    /// timeout runs out.
    fn wait_ready(&mut self) -> FlashResult<(), SPI, CS> {
        let max_polls = self.config.poll.max_polls();
        let interval_us = self.config.poll.interval_us;
        let mut polls: u32 = 0;
        while self.status()?.contains(Status::BUSY) {
            if max_polls.is_some_and(|max| polls >= max) {
                error!("flash still busy after {} polls", polls);
                return Err(Error::Timeout);
            }
            polls = polls.saturating_add(1);
            if interval_us > 0 {
                self.delay.delay_us(interval_us);
            }
        }
        if self.state == State::Busy {
            self.state = State::Idle;
        }
        Ok(())
    }

    /// Sends `opcode` once the chip is idle, then lets `body` append address
    /// and data bytes within the same selection.
    ///
    /// Write commands are preceded by a write enable in its own transaction,
    /// since the chip clears the latch at the end of every write or erase.
    fn command<R>(
        &mut self,
        opcode: Opcode,
        is_write: bool,
        body: impl FnOnce(&mut SPI) -> Result<R, SPI::Error>,
    ) -> FlashResult<R, SPI, CS> {
        if is_write {
            self.wait_ready()?;
            self.transaction(|spi| spi.write(&[Opcode::WriteEnable as u8]))?;
        }
        self.wait_ready()?;
        trace!("flash command {:?}", opcode);
        self.transaction(|spi| {
            spi.write(&[opcode as u8])?;
            body(spi)
        })
    }

    /// Runs `f` with the select line asserted and interrupts masked.
    fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut SPI) -> Result<R, SPI::Error>,
    ) -> FlashResult<R, SPI, CS> {
        let Self { spi, cs, state, .. } = self;
        let resume = *state;
        critical_section::with(|_| {
            let result = match cs.set_low() {
                Ok(()) => {
                    *state = State::Selected;
                    f(&mut *spi)
                        .and_then(|value| spi.flush().map(|()| value))
                        .map_err(Error::Spi)
                }
                Err(e) => Err(Error::Pin(e)),
            };
            let released = cs.set_high().map_err(Error::Pin);
            *state = resume;
            let value = result?;
            released?;
            Ok(value)
        })
    }
}
