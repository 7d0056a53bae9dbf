//! Async driver for a 25-series SPI NOR flash behind an
//! [`embedded_hal_async::spi::SpiDevice`].
//!
//! The `SpiDevice` owns the select line and arbitrates the shared bus, so each
//! command maps onto exactly one `SpiDevice::transaction`.

use core::fmt::Debug;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::{Operation, SpiDevice};

use crate::commands::{
    address_bytes, command_and_address, crosses_page, device_id, page_chunks, Opcode, Status,
    GLOBAL_UNPROTECT, UNIQUE_ID_DUMMY_BYTES, UNIQUE_ID_LEN,
};
use crate::config::Config;
use crate::error::Error;
use crate::state::State;
use crate::traits::AsyncHardwareFlashDevice;

pub struct AsyncSpiFlash<SPI, D> {
    spi: SPI,
    delay: D,
    config: Config,
    state: State,
}

impl<SPI, D> Debug for AsyncSpiFlash<SPI, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncSpiFlash")
            .field("state", &self.state)
            .finish()
    }
}

impl<SPI, D> AsyncSpiFlash<SPI, D> {
    pub fn new(spi: SPI, delay: D, config: Config) -> Self {
        Self {
            spi,
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

    pub fn release(self) -> (SPI, D) {
        (self.spi, self.delay)
    }
}

impl<SPI, D> AsyncHardwareFlashDevice for AsyncSpiFlash<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    type Error = Error<SPI::Error>;

    async fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        self.read_bytes(addr, buf).await
    }

    async fn sector_erase(&mut self, addr: u32) -> Result<(), Error<SPI::Error>> {
        self.block_erase_4k(addr).await
    }

    async fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI::Error>> {
        self.write_bytes(addr, data).await
    }

    async fn chip_erase(&mut self) -> Result<(), Error<SPI::Error>> {
        AsyncSpiFlash::chip_erase(self).await
    }
}

impl<SPI, D> AsyncSpiFlash<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Checks the chip identity and clears all block protection bits. On a
    /// mismatch nothing is sent after the id read.
    pub async fn initialize(&mut self) -> Result<(), Error<SPI::Error>> {
        if self.state == State::Asleep {
            return Err(Error::InvalidState(self.state));
        }
        self.state = State::Uninitialized;

        let found = self.read_id().await?;
        if let Some(expected) = self.config.expected_id {
            if found != expected {
                warn!("flash id {:#x} does not match {:#x}", found, expected);
                return Err(Error::IdentityMismatch { expected, found });
            }
        }

        self.prepare(true).await?;
        self.command(&[Opcode::WriteStatus as u8, GLOBAL_UNPROTECT])
            .await?;
        self.state = State::Idle;
        info!("flash {:#x} initialized", found);
        Ok(())
    }

    pub async fn read_status(&mut self) -> Result<Status, Error<SPI::Error>> {
        self.ensure_active()?;
        self.status().await
    }

    /// Non-blocking check of the write-in-progress bit.
    pub async fn busy(&mut self) -> Result<bool, Error<SPI::Error>> {
        self.ensure_active()?;
        let busy = self.status().await?.contains(Status::BUSY);
        self.state = if busy { State::Busy } else { State::Idle };
        Ok(busy)
    }

    pub async fn read_device_id(&mut self) -> Result<u16, Error<SPI::Error>> {
        self.ensure_active()?;
        self.wait_done().await?;
        self.read_id().await
    }

    pub async fn read_unique_id(&mut self) -> Result<[u8; UNIQUE_ID_LEN], Error<SPI::Error>> {
        self.ensure_active()?;
        self.prepare(false).await?;
        let mut header = [0u8; 1 + UNIQUE_ID_DUMMY_BYTES];
        header[0] = Opcode::ReadUniqueId as u8;
        let mut id = [0u8; UNIQUE_ID_LEN];
        self.command_with_response(&header, &mut id).await?;
        Ok(id)
    }

    pub async fn read_byte(&mut self, addr: u32) -> Result<u8, Error<SPI::Error>> {
        self.ensure_active()?;
        self.prepare(false).await?;
        let mut byte = [0u8; 1];
        self.command_with_response(
            &command_and_address(Opcode::ArrayReadLowFreq, addr),
            &mut byte,
        )
        .await?;
        Ok(byte[0])
    }

    /// Fast read into `buf`. Only 24 bits of `addr` are transferred.
    pub async fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        self.ensure_active()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.prepare(false).await?;
        let [a2, a1, a0] = address_bytes(addr);
        self.command_with_response(&[Opcode::ArrayRead as u8, a2, a1, a0, 0], buf)
            .await
    }

    pub async fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), Error<SPI::Error>> {
        self.ensure_active()?;
        self.prepare(true).await?;
        let [a2, a1, a0] = address_bytes(addr);
        self.command(&[Opcode::PageProgram as u8, a2, a1, a0, value])
            .await?;
        self.state = State::Busy;
        Ok(())
    }

    /// Page program. Bytes past the end of the page wrap to its start, as
    /// with [`SpiFlash::write_bytes`](crate::comms::SpiFlash::write_bytes).
    pub async fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI::Error>> {
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
        self.prepare(true).await?;
        self.spi
            .transaction(&mut [
                Operation::Write(&command_and_address(Opcode::PageProgram, addr)),
                Operation::Write(data),
            ])
            .await
            .map_err(Error::Spi)?;
        self.state = State::Busy;
        Ok(())
    }

    pub async fn write_pages(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI::Error>> {
        for (addr, chunk) in page_chunks(addr, data, self.config.page_size) {
            self.write_bytes(addr, chunk).await?;
        }
        Ok(())
    }

    /// Returns once the erase has been accepted.
    pub async fn chip_erase(&mut self) -> Result<(), Error<SPI::Error>> {
        self.ensure_active()?;
        self.prepare(true).await?;
        self.command(&[Opcode::ChipErase as u8]).await?;
        self.state = State::Busy;
        Ok(())
    }

    pub async fn block_erase_4k(&mut self, addr: u32) -> Result<(), Error<SPI::Error>> {
        self.erase(Opcode::BlockErase4K, addr).await
    }

    pub async fn block_erase_32k(&mut self, addr: u32) -> Result<(), Error<SPI::Error>> {
        self.erase(Opcode::BlockErase32K, addr).await
    }

    pub async fn block_erase_64k(&mut self, addr: u32) -> Result<(), Error<SPI::Error>> {
        self.erase(Opcode::BlockErase64K, addr).await
    }

    pub async fn sleep(&mut self) -> Result<(), Error<SPI::Error>> {
        self.ensure_active()?;
        self.prepare(false).await?;
        self.command(&[Opcode::Sleep as u8]).await?;
        self.state = State::Asleep;
        debug!("flash entered deep power-down");
        Ok(())
    }

    pub async fn wakeup(&mut self) -> Result<(), Error<SPI::Error>> {
        if !matches!(self.state, State::Asleep | State::Idle | State::Busy) {
            return Err(Error::InvalidState(self.state));
        }
        if self.state != State::Asleep {
            self.wait_done().await?;
        }
        self.command(&[Opcode::Wake as u8]).await?;
        self.delay.delay_us(self.config.wakeup_delay_us).await;
        if self.state == State::Asleep {
            self.state = State::Idle;
        }
        debug!("flash released from deep power-down");
        Ok(())
    }

    async fn erase(&mut self, opcode: Opcode, addr: u32) -> Result<(), Error<SPI::Error>> {
        self.ensure_active()?;
        self.prepare(true).await?;
        self.command(&command_and_address(opcode, addr)).await?;
        self.state = State::Busy;
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), Error<SPI::Error>> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(Error::InvalidState(self.state))
        }
    }

    /// Waits for the chip to go idle, setting the write enable latch first
    /// for write commands.
    async fn prepare(&mut self, is_write: bool) -> Result<(), Error<SPI::Error>> {
        if is_write {
            self.wait_done().await?;
            self.command(&[Opcode::WriteEnable as u8]).await?;
        }
        self.wait_done().await
    }

    /// Writes a command to the SPI bus
    async fn command(&mut self, bytes: &[u8]) -> Result<(), Error<SPI::Error>> {
        trace!("flash command {:#x}", bytes[0]);
        self.spi
            .transaction(&mut [Operation::Write(bytes)])
            .await
            .map_err(Error::Spi)
    }

    /// Writes a command and reads the response within the same selection
    async fn command_with_response(
        &mut self,
        instruction: &[u8],
        response: &mut [u8],
    ) -> Result<(), Error<SPI::Error>> {
        self.spi
            .transaction(&mut [Operation::Write(instruction), Operation::Read(response)])
            .await
            .map_err(Error::Spi)
    }

    async fn read_id(&mut self) -> Result<u16, Error<SPI::Error>> {
        let mut id = [0u8; 2];
        self.command_with_response(&[Opcode::ReadId as u8], &mut id)
            .await?;
        Ok(device_id(id))
    }

    async fn status(&mut self) -> Result<Status, Error<SPI::Error>> {
        let mut status = [0u8; 1];
        self.command_with_response(&[Opcode::ReadStatus as u8], &mut status)
            .await?;
        Ok(Status::from_bits_truncate(status[0]))
    }

    /// Block until the status of the device is not busy
    async fn wait_done(&mut self) -> Result<(), Error<SPI::Error>> {
        let max_polls = self.config.poll.max_polls();
        let interval_us = self.config.poll.interval_us;
        let mut polls: u32 = 0;
        while self.status().await?.contains(Status::BUSY) {
            if max_polls.is_some_and(|max| polls >= max) {
                error!("flash still busy after {} polls", polls);
                return Err(Error::Timeout);
            }
            polls = polls.saturating_add(1);
            if interval_us > 0 {
                self.delay.delay_us(interval_us).await;
            }
        }
        if self.state == State::Busy {
            self.state = State::Idle;
        }
        Ok(())
    }
}
