use tracing::{debug, info, trace};

use crate::constants::{
    CHIP_ERASE_DELAY_MS, PAGE_COMMIT_DELAY_MS, PROGMODE_MAX_ATTEMPTS, PROGMODE_RETRY_DELAY_MS,
    RESET_SETTLE_MS,
};
use crate::error::IspResult;
use crate::isp::IspTransport;

// AVR serial programming instruction set (first transaction byte)
const ISP_PROGRAM_ENABLE: [u8; 4] = [0xac, 0x53, 0x00, 0x00];
const ISP_CHIP_ERASE: [u8; 4] = [0xac, 0x80, 0x00, 0x00];
const ISP_READ_SIGNATURE: u8 = 0x30;
const ISP_LOAD_PAGE_LOW: u8 = 0x40;
const ISP_LOAD_PAGE_HIGH: u8 = 0x48;
const ISP_COMMIT_PAGE: u8 = 0x4c;
const ISP_READ_LOW: u8 = 0x20;
const ISP_READ_HIGH: u8 = 0x28;

/// A programming-enable transaction succeeded when the target echoes the
/// second command byte back in the third response byte.
const PROGRAM_ENABLE_ECHO: u8 = 0x53;

/// Drives the AVR ISP command set on top of a raw 4-byte SPI transport.
pub struct AvrIsp {
    transport: Box<dyn IspTransport>,
}

impl AvrIsp {
    pub fn new(transport: Box<dyn IspTransport>) -> Self {
        AvrIsp { transport }
    }

    /// Raw transaction passthrough, used by the STK500v1 UNIVERSAL command.
    pub fn transact(&mut self, tx: [u8; 4]) -> IspResult<[u8; 4]> {
        let rx = self.transport.transact(tx)?;
        trace!("isp txn {:02x?} -> {:02x?}", tx, rx);
        Ok(rx)
    }

    /// Enter serial programming mode.
    ///
    /// Pulses RESET and then retries the programming-enable handshake; the
    /// target's oscillator needs time to stabilise after reset, so a single
    /// attempt is unreliable. Returns `Ok(false)` once the retry budget is
    /// exhausted, with RESET released so the target can run again.
    pub fn enter_programming_mode(&mut self) -> IspResult<bool> {
        self.transport.reset_release()?;
        sleep_ms(RESET_SETTLE_MS);
        self.transport.reset_assert()?;

        for attempt in 0..PROGMODE_MAX_ATTEMPTS {
            let rx = self.transact(ISP_PROGRAM_ENABLE)?;
            if rx[2] == PROGRAM_ENABLE_ECHO {
                info!("Entered programming mode (attempt {})", attempt + 1);
                return Ok(true);
            }
            sleep_ms(PROGMODE_RETRY_DELAY_MS);
        }

        debug!(
            "Programming enable not acknowledged after {} attempts",
            PROGMODE_MAX_ATTEMPTS
        );
        self.transport.reset_release()?;
        sleep_ms(RESET_SETTLE_MS);
        Ok(false)
    }

    /// Release RESET so the target leaves programming mode and runs.
    pub fn leave_programming_mode(&mut self) -> IspResult<()> {
        self.transport.reset_release()?;
        sleep_ms(RESET_SETTLE_MS);
        Ok(())
    }

    /// Erase the target's flash and EEPROM. The internal erase takes
    /// measurably longer than the SPI transaction, hence the settle delay.
    pub fn chip_erase(&mut self) -> IspResult<()> {
        self.transact(ISP_CHIP_ERASE)?;
        sleep_ms(CHIP_ERASE_DELAY_MS);
        Ok(())
    }

    /// Read the 3-byte device signature.
    pub fn read_signature(&mut self) -> IspResult<[u8; 3]> {
        let mut signature = [0u8; 3];
        for (i, byte) in signature.iter_mut().enumerate() {
            let rx = self.transact([ISP_READ_SIGNATURE, 0x00, i as u8, 0x00])?;
            *byte = rx[3];
        }
        debug!("Read signature {:02x?}", signature);
        Ok(signature)
    }

    /// Load one 16-bit word into the target's temporary page buffer.
    pub fn write_page_buffer_word(&mut self, word_address: u16, word: u16) -> IspResult<()> {
        let [addr_hi, addr_lo] = word_address.to_be_bytes();
        self.transact([ISP_LOAD_PAGE_LOW, addr_hi, addr_lo, word as u8])?;
        self.transact([ISP_LOAD_PAGE_HIGH, addr_hi, addr_lo, (word >> 8) as u8])?;
        Ok(())
    }

    /// Commit the page buffer to flash. Any word address within the target
    /// page selects it.
    pub fn commit_page(&mut self, word_address: u16) -> IspResult<()> {
        let [addr_hi, addr_lo] = word_address.to_be_bytes();
        self.transact([ISP_COMMIT_PAGE, addr_hi, addr_lo, 0x00])?;
        sleep_ms(PAGE_COMMIT_DELAY_MS);
        Ok(())
    }

    /// Read one 16-bit program word.
    pub fn read_program_word(&mut self, word_address: u16) -> IspResult<u16> {
        let [addr_hi, addr_lo] = word_address.to_be_bytes();
        let high = self.transact([ISP_READ_HIGH, addr_hi, addr_lo, 0x00])?[3];
        let low = self.transact([ISP_READ_LOW, addr_hi, addr_lo, 0x00])?[3];
        Ok(u16::from(high) << 8 | u16::from(low))
    }

    /// Read back consecutive words starting at `start` and compare against
    /// `expected`, stopping at the first mismatch.
    pub fn verify_page(&mut self, start: u16, expected: &[u16]) -> IspResult<bool> {
        for (i, &want) in expected.iter().enumerate() {
            let got = self.read_program_word(start + i as u16)?;
            if got != want {
                debug!(
                    "Verify mismatch at word {:#06x}: expected {:#06x}, read {:#06x}",
                    start + i as u16,
                    want,
                    got
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
