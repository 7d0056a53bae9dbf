//! Instruction set, status register layout and address framing shared by the
//! blocking and async drivers.
//!
//! Opcodes follow the common 25-series command set (Winbond W25Q, Macronix
//! MX25, Adesto AT25 and friends).

use core::num::NonZeroU32;

/// Program/read page size of virtually every 25-series part.
pub const PAGE_SIZE: u32 = 256;
/// Smallest erase unit.
pub const SECTOR_SIZE: u32 = 4 * 1024;
pub const BLOCK_32K_SIZE: u32 = 32 * 1024;
pub const BLOCK_64K_SIZE: u32 = 64 * 1024;

/// Number of bytes returned by [`Opcode::ReadUniqueId`].
pub const UNIQUE_ID_LEN: usize = 8;
/// Dummy bytes clocked between [`Opcode::ReadUniqueId`] and the id itself.
pub(crate) const UNIQUE_ID_DUMMY_BYTES: usize = 4;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// Erase the 4 KiB sector containing the address.
    BlockErase4K = 0x20,
    /// Erase the 32 KiB block containing the address.
    BlockErase32K = 0x52,
    /// Erase the 64 KiB block containing the address.
    BlockErase64K = 0xD8,
    ChipErase = 0x60,
    /// Read the 8-bit status register.
    ReadStatus = 0x05,
    /// Write the 8-bit status register.
    WriteStatus = 0x01,
    /// Fast read, needs one dummy byte after the address.
    ArrayRead = 0x0B,
    /// Plain read, usable at any clock rate.
    ArrayReadLowFreq = 0x03,
    /// Enter deep power-down.
    Sleep = 0xB9,
    /// Release from deep power-down.
    Wake = 0xAB,
    /// Byte/page program, 1 to 256 data bytes.
    PageProgram = 0x02,
    /// JEDEC id: manufacturer, memory type, capacity.
    ReadId = 0x9F,
    ReadUniqueId = 0x4B,
}

bitflags::bitflags! {
    /// Status register bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Erase or write in progress (WIP).
        const BUSY = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
        /// The block protection bits.
        const PROT = 0b0011_1100;
        /// **S**tatus **R**egister **W**rite **D**isable bit.
        const SRWD = 1 << 7;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Status {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Status({=u8:#x})", self.bits())
    }
}

/// Status register value written by `initialize()`: every protection bit clear.
pub(crate) const GLOBAL_UNPROTECT: u8 = 0x00;

/// Big-endian 24-bit address. Bits above 23 are dropped, which limits
/// 3-byte addressing to 16 MiB parts.
pub fn address_bytes(addr: u32) -> [u8; 3] {
    [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

/// Opcode followed by a 24-bit address.
pub fn command_and_address(opcode: Opcode, addr: u32) -> [u8; 4] {
    let [a2, a1, a0] = address_bytes(addr);
    [opcode as u8, a2, a1, a0]
}

/// Combines the first two bytes of the JEDEC id (manufacturer, memory type)
/// into the 16-bit identifier used for identity checks.
pub fn device_id(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// Returns `true` if `len` bytes written at `addr` run past the end of the
/// page that contains `addr` and would wrap back to its start.
pub fn crosses_page(addr: u32, len: usize, page_size: NonZeroU32) -> bool {
    let room = page_size.get() - (addr % page_size);
    len as u64 > u64::from(room)
}

/// Iterator over `(addr, chunk)` pairs with no chunk crossing a page boundary.
pub fn page_chunks(addr: u32, data: &[u8], page_size: NonZeroU32) -> PageChunks<'_> {
    PageChunks {
        addr,
        data,
        page_size,
    }
}

pub struct PageChunks<'a> {
    addr: u32,
    data: &'a [u8],
    page_size: NonZeroU32,
}

impl<'a> Iterator for PageChunks<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let room = (self.page_size.get() - (self.addr % self.page_size)) as usize;
        let (chunk, rest) = self.data.split_at(room.min(self.data.len()));
        let addr = self.addr;
        self.addr = self.addr.wrapping_add(chunk.len() as u32);
        self.data = rest;
        Some((addr, chunk))
    }
}
