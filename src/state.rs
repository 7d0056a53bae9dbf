/// Lifecycle of a flash device as seen by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Constructed, or `initialize()` failed, or the bus was ended.
    Uninitialized,
    /// Ready for a new command.
    Idle,
    /// Select line asserted, a transaction is on the wire.
    Selected,
    /// An erase, program or status write was accepted and may still be running.
    Busy,
    /// Deep power-down. Only a wake-up is accepted.
    Asleep,
}

impl State {
    /// `true` for the states from which ordinary commands may be issued.
    pub fn is_active(self) -> bool {
        matches!(self, State::Idle | State::Busy)
    }
}
