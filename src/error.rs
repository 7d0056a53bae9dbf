use core::convert::Infallible;

use crate::state::State;

/// The error type used by this library.
///
/// This can encapsulate an SPI or select-line error, and adds its own
/// protocol errors on top of that. The async driver owns no select line and
/// uses the default `P = Infallible`.
#[derive(Debug, PartialEq, Eq)]
pub enum Error<S, P = Infallible> {
    /// An SPI transfer failed.
    Spi(S),
    /// The select line could not be driven.
    Pin(P),
    /// `initialize()` read an identifier other than the configured one.
    IdentityMismatch { expected: u16, found: u16 },
    /// The chip kept reporting write-in-progress past the configured timeout.
    Timeout,
    /// The operation is not valid in the device's current state.
    InvalidState(State),
    /// A page program would have wrapped within its page. Only reported
    /// when the page boundary check is enabled.
    PageBoundary { addr: u32, len: usize },
}

#[cfg(feature = "defmt")]
impl<S, P> defmt::Format for Error<S, P> {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::Spi(_) => defmt::write!(fmt, "Error::Spi"),
            Error::Pin(_) => defmt::write!(fmt, "Error::Pin"),
            Error::IdentityMismatch { expected, found } => defmt::write!(
                fmt,
                "Error::IdentityMismatch {{ expected: {=u16:#x}, found: {=u16:#x} }}",
                expected,
                found
            ),
            Error::Timeout => defmt::write!(fmt, "Error::Timeout"),
            Error::InvalidState(state) => defmt::write!(fmt, "Error::InvalidState({})", state),
            Error::PageBoundary { addr, len } => defmt::write!(
                fmt,
                "Error::PageBoundary {{ addr: {=u32:#x}, len: {=usize} }}",
                addr,
                len
            ),
        }
    }
}
