//! Runtime configuration shared by both drivers.

use core::num::NonZeroU32;

use embedded_hal::spi::{Mode, MODE_0};

use crate::commands::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Electrical parameters handed to [`BusControl::configure`](crate::bus::BusControl::configure).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusConfig {
    pub mode: Mode,
    pub bit_order: BitOrder,
    /// Divisor applied to the controller clock. 2 is the fastest setting
    /// most controllers offer.
    pub clock_divisor: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: MODE_0,
            bit_order: BitOrder::MsbFirst,
            clock_divisor: 2,
        }
    }
}

/// Upper bound on a busy-wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Poll until the chip clears WIP, however long that takes. A chip that
    /// never does hangs the caller.
    Never,
    /// Give up with [`Error::Timeout`](crate::error::Error::Timeout) after
    /// roughly this many microseconds.
    Micros(u32),
}

/// How the drivers wait for write-in-progress to clear.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between two status reads.
    pub interval_us: u32,
    pub timeout: Timeout,
}

impl PollConfig {
    /// Number of status reads allowed to show WIP before giving up, `None`
    /// when unbounded.
    pub fn max_polls(&self) -> Option<u32> {
        match self.timeout {
            Timeout::Never => None,
            Timeout::Micros(us) if self.interval_us > 0 => Some(us / self.interval_us),
            // Fall back to one poll per microsecond
            Timeout::Micros(us) => Some(us),
        }
    }
}

impl Default for PollConfig {
    /// Polls every 100us for up to 400s, enough for a full chip erase of a
    /// 16 MiB part.
    fn default() -> Self {
        Self {
            interval_us: 100,
            timeout: Timeout::Micros(400_000_000),
        }
    }
}

const DEFAULT_PAGE_SIZE: NonZeroU32 = match NonZeroU32::new(PAGE_SIZE) {
    Some(size) => size,
    None => NonZeroU32::MIN,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Identifier `initialize()` must read back, `None` to accept any chip.
    pub expected_id: Option<u16>,
    pub bus: BusConfig,
    pub poll: PollConfig,
    /// Program page size. The boundary check and
    /// [`SpiFlash::write_pages`](crate::comms::SpiFlash::write_pages) split on
    /// multiples of it.
    pub page_size: NonZeroU32,
    /// Reject page programs that would wrap within their page instead of
    /// passing them to the chip.
    pub check_page_boundary: bool,
    /// Settling time after a release from deep power-down (tRES1).
    pub wakeup_delay_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expected_id: None,
            bus: BusConfig::default(),
            poll: PollConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            check_page_boundary: false,
            wakeup_delay_us: 30,
        }
    }
}

impl Config {
    /// Sets the identifier to verify. `0` disables the check.
    pub fn expected_id(mut self, id: u16) -> Self {
        self.expected_id = (id != 0).then_some(id);
        self
    }

    pub fn bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Page size of the part. `0` selects the default of [`PAGE_SIZE`] bytes,
    /// any other value is rounded up to the next power of two.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size
            .checked_next_power_of_two()
            .and_then(NonZeroU32::new)
            .filter(|_| page_size != 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        self
    }

    pub fn check_page_boundary(mut self, check: bool) -> Self {
        self.check_page_boundary = check;
        self
    }

    pub fn wakeup_delay_us(mut self, us: u32) -> Self {
        self.wakeup_delay_us = us;
        self
    }
}
