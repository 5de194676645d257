pub mod bitbang;
pub mod sequencer;
pub mod spidev;

use crate::error::IspResult;

/// Low-level SPI access to the AVR target.
///
/// Every ISP command is one full-duplex 4-byte transaction; the active-low
/// RESET line gates programming mode. Implementations differ only in how
/// the bits reach the wire (hardware spidev vs. bit-banged GPIO).
pub trait IspTransport {
    /// Perform one full-duplex 4-byte transaction
    fn transact(&mut self, tx: [u8; 4]) -> IspResult<[u8; 4]>;

    /// Drive the target RESET line low (hold target in reset)
    fn reset_assert(&mut self) -> IspResult<()>;

    /// Drive the target RESET line high (let target run)
    fn reset_release(&mut self) -> IspResult<()>;
}
