//! `embedded-hal` driver for 25-series SPI NOR flash.
//!
//! Two front ends share one command set:
//!
//! * [`SpiFlash`] drives a raw [`SpiBus`](embedded_hal::spi::SpiBus) and a
//!   select line itself, masking interrupts for the length of every
//!   transaction so handlers sharing the bus cannot interleave.
//! * [`AsyncSpiFlash`] sits on an async
//!   [`SpiDevice`](embedded_hal_async::spi::SpiDevice), which owns selection
//!   and bus arbitration.
//!
//! Both block until the chip's write-in-progress bit clears before starting a
//! command, bounded by [`config::PollConfig`]. Erases return as soon as the
//! chip accepts them; completion is observed with `busy()` or by issuing the
//! next command.
//!
//! Callers are responsible for two properties the chip does not check:
//! bytes must be erased before they are programmed (programming only clears
//! bits), and a page program must not run past the end of its page (the chip
//! wraps back to the start of the page).
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod async_comms;
pub mod bus;
pub mod commands;
pub mod comms;
pub mod config;
pub mod error;
pub mod state;
pub mod traits;

#[cfg(test)]
mod sim;

pub use async_comms::AsyncSpiFlash;
pub use bus::BusControl;
pub use comms::SpiFlash;
pub use config::Config;
pub use error::Error;
pub use state::State;
