//! Minimal flash device interface, implemented by both drivers so callers can
//! stay generic over blocking/async front ends and bus setups.

pub trait HardwareFlashDevice {
    type Error;

    /// Reads flash contents into `data`, starting at `addr`.
    fn read(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Self::Error>;

    /// Sets the 4 KiB sector containing `addr` to all 1s (FFh). May return
    /// before the chip has finished.
    fn sector_erase(&mut self, addr: u32) -> Result<(), Self::Error>;

    /// Programs 1 to 256 previously erased bytes within one page.
    fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Sets the whole array to all 1s (FFh). May return before the chip has
    /// finished.
    fn chip_erase(&mut self) -> Result<(), Self::Error>;
}

/// Async counterpart of [`HardwareFlashDevice`].
#[allow(async_fn_in_trait)]
pub trait AsyncHardwareFlashDevice {
    type Error;

    async fn read(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Self::Error>;

    async fn sector_erase(&mut self, addr: u32) -> Result<(), Self::Error>;

    async fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    async fn chip_erase(&mut self) -> Result<(), Self::Error>;
}
