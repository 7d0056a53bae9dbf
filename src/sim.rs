//! In-memory 25-series chip for the driver tests.
//!
//! Emulates the parts of the protocol the drivers depend on: write enable
//! latching, block protection, program-only-clears-bits, page wrap, a WIP
//! countdown and deep power-down. Every frame is recorded so tests can check
//! what went over the wire.

use std::cell::{RefCell, RefMut};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, ErrorKind, SpiBus};
use embedded_hal_async::spi::{Operation, SpiDevice};

use crate::bus::BusControl;
use crate::commands::{Opcode, Status, BLOCK_32K_SIZE, BLOCK_64K_SIZE, PAGE_SIZE, SECTOR_SIZE};
use crate::config::BusConfig;

pub const CAPACITY: usize = 64 * 1024;
/// Manufacturer 0xEF, memory type 0x40, capacity 0x10.
pub const JEDEC_ID: [u8; 3] = [0xEF, 0x40, 0x10];
pub const DEVICE_ID: u16 = 0xEF40;
pub const UNIQUE_ID: [u8; 8] = [0xD1, 0x58, 0x2C, 0x93, 0x17, 0x42, 0x0A, 0x6E];

/// Busy countdown that never expires.
pub const STUCK: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    Fault,
}

impl spi::Error for SimError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct Chip {
    pub memory: Vec<u8>,
    /// Non-volatile status bits (protection, SRWD).
    pub status: u8,
    pub wel: bool,
    /// Status reads left that will still report WIP.
    pub busy_polls: u32,
    /// Busy countdown loaded by each erase, program and status write.
    pub op_duration: u32,
    pub asleep: bool,
    pub selected: bool,
    pub asserts: usize,
    pub releases: usize,
    pub frames: Vec<Vec<u8>>,
    /// Commands other than a status read that arrived while busy.
    pub commands_while_busy: usize,
    /// Bytes clocked while the select line was deasserted.
    pub unselected_transfers: usize,
    pub bus_config: Option<BusConfig>,
    pub started: bool,
    pub delayed_ns: u64,
    /// Fail the transfer after this many more bytes.
    pub fail_after: Option<usize>,
    frame: Vec<u8>,
}

impl Chip {
    fn new() -> Self {
        Self {
            memory: vec![0xFF; CAPACITY],
            // Protected out of the box
            status: Status::PROT.bits(),
            wel: false,
            busy_polls: 0,
            op_duration: 3,
            asleep: false,
            selected: false,
            asserts: 0,
            releases: 0,
            frames: Vec::new(),
            commands_while_busy: 0,
            unselected_transfers: 0,
            bus_config: None,
            started: false,
            delayed_ns: 0,
            fail_after: None,
            frame: Vec::new(),
        }
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.frames.iter().map(|frame| frame[0]).collect()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame[0] == opcode as u8)
            .count()
    }

    fn select(&mut self) {
        self.asserts += 1;
        self.selected = true;
        self.frame.clear();
    }

    fn release(&mut self) {
        if !self.selected {
            return;
        }
        self.selected = false;
        self.releases += 1;
        self.execute();
    }

    fn exchange(&mut self, out: u8) -> Result<u8, SimError> {
        if !self.selected {
            self.unselected_transfers += 1;
            return Ok(0xFF);
        }
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                self.fail_after = None;
                return Err(SimError::Fault);
            }
            *left -= 1;
        }

        let idx = self.frame.len();
        self.frame.push(out);
        if self.asleep || idx == 0 {
            return Ok(0xFF);
        }

        let op = self.frame[0];
        let response = match op {
            op if op == Opcode::ReadStatus as u8 => self.status_byte(),
            op if op == Opcode::ReadId as u8 => JEDEC_ID.get(idx - 1).copied().unwrap_or(0xFF),
            op if op == Opcode::ArrayReadLowFreq as u8 && idx >= 4 => self.array(idx - 4),
            op if op == Opcode::ArrayRead as u8 && idx >= 5 => self.array(idx - 5),
            op if op == Opcode::ReadUniqueId as u8 && idx >= 5 => {
                UNIQUE_ID.get(idx - 5).copied().unwrap_or(0xFF)
            }
            _ => 0xFF,
        };
        Ok(response)
    }

    fn status_byte(&mut self) -> u8 {
        let mut status = self.status;
        if self.busy_polls > 0 {
            status |= Status::BUSY.bits();
            if self.busy_polls != STUCK {
                self.busy_polls -= 1;
            }
        }
        if self.wel {
            status |= Status::WEL.bits();
        }
        status
    }

    fn address(&self) -> usize {
        let addr = u32::from_be_bytes([0, self.frame[1], self.frame[2], self.frame[3]]);
        addr as usize % CAPACITY
    }

    fn array(&self, offset: usize) -> u8 {
        self.memory[(self.address() + offset) % CAPACITY]
    }

    fn execute(&mut self) {
        if self.frame.is_empty() {
            return;
        }
        self.frames.push(self.frame.clone());

        let op = self.frame[0];
        if self.asleep {
            if op == Opcode::Wake as u8 {
                self.asleep = false;
            }
            return;
        }
        if self.busy_polls > 0 && op != Opcode::ReadStatus as u8 {
            self.commands_while_busy += 1;
            return;
        }

        match op {
            op if op == Opcode::WriteEnable as u8 => self.wel = true,
            op if op == Opcode::WriteStatus as u8 => {
                if self.wel && self.frame.len() >= 2 {
                    self.status = self.frame[1] & (Status::PROT | Status::SRWD).bits();
                    self.start_operation();
                }
            }
            op if op == Opcode::PageProgram as u8 => {
                if self.writable() && self.frame.len() >= 5 {
                    self.program();
                    self.start_operation();
                }
            }
            op if op == Opcode::BlockErase4K as u8 => self.erase(SECTOR_SIZE as usize),
            op if op == Opcode::BlockErase32K as u8 => self.erase(BLOCK_32K_SIZE as usize),
            op if op == Opcode::BlockErase64K as u8 => self.erase(BLOCK_64K_SIZE as usize),
            op if op == Opcode::ChipErase as u8 || op == 0xC7 => {
                if self.writable() {
                    self.memory.fill(0xFF);
                    self.start_operation();
                }
            }
            op if op == Opcode::Sleep as u8 => self.asleep = true,
            _ => {}
        }
    }

    fn run(&mut self, operation: &mut Operation<'_, u8>) -> Result<(), SimError> {
        match operation {
            Operation::Read(words) => {
                for word in words.iter_mut() {
                    *word = self.exchange(0x00)?;
                }
            }
            Operation::Write(words) => {
                for word in words.iter() {
                    self.exchange(*word)?;
                }
            }
            Operation::Transfer(read, write) => {
                for i in 0..read.len().max(write.len()) {
                    let word = self.exchange(write.get(i).copied().unwrap_or(0x00))?;
                    if let Some(slot) = read.get_mut(i) {
                        *slot = word;
                    }
                }
            }
            Operation::TransferInPlace(words) => {
                for word in words.iter_mut() {
                    *word = self.exchange(*word)?;
                }
            }
            Operation::DelayNs(ns) => self.delayed_ns += u64::from(*ns),
        }
        Ok(())
    }

    fn writable(&self) -> bool {
        self.wel && self.status & Status::PROT.bits() == 0
    }

    fn start_operation(&mut self) {
        self.wel = false;
        self.busy_polls = self.op_duration;
    }

    fn program(&mut self) {
        let page = PAGE_SIZE as usize;
        let addr = self.address();
        let page_start = addr & !(page - 1);
        // The column counter wraps within the page latch
        let mut latch = vec![0xFFu8; page];
        for (i, byte) in self.frame[4..].iter().enumerate() {
            latch[(addr % page + i) % page] = *byte;
        }
        for (cell, byte) in self.memory[page_start..page_start + page].iter_mut().zip(latch) {
            *cell &= byte;
        }
    }

    fn erase(&mut self, size: usize) {
        if !self.writable() || self.frame.len() < 4 {
            return;
        }
        let start = self.address() & !(size - 1);
        self.memory[start..start + size].fill(0xFF);
        self.start_operation();
    }
}

/// Handle to a simulated chip; hands out the peripherals the drivers consume.
#[derive(Clone)]
pub struct Sim {
    chip: Rc<RefCell<Chip>>,
}

impl Sim {
    pub fn new() -> Self {
        Self {
            chip: Rc::new(RefCell::new(Chip::new())),
        }
    }

    pub fn chip(&self) -> RefMut<'_, Chip> {
        self.chip.borrow_mut()
    }

    pub fn bus(&self) -> SimBus {
        SimBus(self.chip.clone())
    }

    pub fn cs(&self) -> SimCs {
        SimCs(self.chip.clone())
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay(self.chip.clone())
    }

    pub fn device(&self) -> SimDevice {
        SimDevice(self.chip.clone())
    }
}

pub struct SimBus(Rc<RefCell<Chip>>);

impl spi::ErrorType for SimBus {
    type Error = SimError;
}

impl SpiBus<u8> for SimBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), SimError> {
        let mut chip = self.0.borrow_mut();
        for word in words {
            *word = chip.exchange(0x00)?;
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), SimError> {
        let mut chip = self.0.borrow_mut();
        for word in words {
            chip.exchange(*word)?;
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), SimError> {
        let mut chip = self.0.borrow_mut();
        for i in 0..read.len().max(write.len()) {
            let word = chip.exchange(write.get(i).copied().unwrap_or(0x00))?;
            if let Some(slot) = read.get_mut(i) {
                *slot = word;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), SimError> {
        let mut chip = self.0.borrow_mut();
        for word in words {
            *word = chip.exchange(*word)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SimError> {
        Ok(())
    }
}

impl BusControl for SimBus {
    fn configure(&mut self, config: &BusConfig) -> Result<(), SimError> {
        self.0.borrow_mut().bus_config = Some(*config);
        Ok(())
    }

    fn start(&mut self) -> Result<(), SimError> {
        self.0.borrow_mut().started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SimError> {
        self.0.borrow_mut().started = false;
        Ok(())
    }
}

pub struct SimCs(Rc<RefCell<Chip>>);

impl digital::ErrorType for SimCs {
    type Error = Infallible;
}

impl OutputPin for SimCs {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().select();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().release();
        Ok(())
    }
}

pub struct SimDelay(Rc<RefCell<Chip>>);

impl embedded_hal::delay::DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().delayed_ns += u64::from(ns);
    }
}

impl embedded_hal_async::delay::DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().delayed_ns += u64::from(ns);
    }
}

/// Select line and bus behind one `SpiDevice`.
pub struct SimDevice(Rc<RefCell<Chip>>);

impl spi::ErrorType for SimDevice {
    type Error = SimError;
}

impl SpiDevice<u8> for SimDevice {
    async fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), SimError> {
        let mut chip = self.0.borrow_mut();
        chip.select();
        let mut result = Ok(());
        for operation in operations.iter_mut() {
            result = chip.run(operation);
            if result.is_err() {
                break;
            }
        }
        chip.release();
        result
    }
}
