use embedded_hal::spi::SpiBus;

use crate::config::BusConfig;

/// Bus bring-up hooks the blocking driver needs beyond [`SpiBus`].
///
/// HALs that fix mode, bit order and clock when the bus is constructed can
/// implement this with an empty `impl` block.
pub trait BusControl: SpiBus<u8> {
    /// Applies clock mode, bit order and clock divisor.
    fn configure(&mut self, config: &BusConfig) -> Result<(), Self::Error> {
        let _ = config;
        Ok(())
    }

    /// Enables the bus.
    fn start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Disables the bus.
    fn stop(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
