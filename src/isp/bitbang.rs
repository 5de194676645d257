use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};
use tracing::info;

use crate::error::{IspError, IspResult};
use crate::isp::IspTransport;

/// Default half-period delay in microseconds (~50 kHz clock, slow enough
/// for factory-fused targets running at 1 MHz off the internal oscillator).
const DEFAULT_HALF_PERIOD_US: u64 = 10;

/// Pin assignment for the bit-banged transport.
#[derive(Debug, Clone)]
pub struct GpioBitbangConfig {
    /// GPIO character device path (e.g. "/dev/gpiochip0")
    pub chip: String,
    pub sck: Offset,
    pub mosi: Offset,
    pub miso: Offset,
    pub reset: Offset,
    /// Half-period delay in microseconds
    pub half_period_us: u64,
}

impl GpioBitbangConfig {
    pub fn new(chip: impl Into<String>, sck: Offset, mosi: Offset, miso: Offset, reset: Offset) -> Self {
        GpioBitbangConfig {
            chip: chip.into(),
            sck,
            mosi,
            miso,
            reset,
            half_period_us: DEFAULT_HALF_PERIOD_US,
        }
    }

    pub fn with_half_period_us(mut self, us: u64) -> Self {
        self.half_period_us = us.max(1);
        self
    }
}

/// Software SPI over GPIO lines: mode 0 (clock idles low, sample on the
/// rising edge), MSB first. Useful when the hardware SPI peripheral is
/// unavailable or pin-constrained.
pub struct GpioBitbang {
    request: Request,
    config: GpioBitbangConfig,
}

impl GpioBitbang {
    pub fn open(config: GpioBitbangConfig) -> IspResult<Self> {
        if config.chip.is_empty() {
            return Err(IspError::ConfigurationError(
                "No GPIO chip specified for the bitbang transport".to_string(),
            ));
        }

        // SCK and MOSI idle low; RESET starts high so the target runs.
        let mut req_config = Config::default();
        req_config.with_line(config.sck).as_output(Value::Inactive);
        req_config.with_line(config.mosi).as_output(Value::Inactive);
        req_config.with_line(config.miso).as_input();
        req_config.with_line(config.reset).as_output(Value::Active);

        let request = Request::from_config(req_config)
            .on_chip(&config.chip)
            .with_consumer("avrlink")
            .request()
            .map_err(|e| IspError::Transport(format!("Failed to request GPIO lines: {e}")))?;

        info!(
            "Opened bitbang transport on {} (sck={}, mosi={}, miso={}, reset={})",
            config.chip, config.sck, config.mosi, config.miso, config.reset
        );

        Ok(GpioBitbang { request, config })
    }

    fn set_line(&mut self, offset: Offset, high: bool) -> IspResult<()> {
        let value = if high { Value::Active } else { Value::Inactive };
        self.request
            .set_value(offset, value)
            .map_err(|e| IspError::Transport(format!("Failed to set GPIO line {offset}: {e}")))?;
        Ok(())
    }

    fn get_miso(&self) -> IspResult<bool> {
        match self.request.value(self.config.miso) {
            Ok(value) => Ok(matches!(value, Value::Active)),
            Err(e) => Err(IspError::Transport(format!(
                "Failed to read MISO line: {e}"
            ))),
        }
    }

    fn half_period_delay(&self) {
        std::thread::sleep(std::time::Duration::from_micros(self.config.half_period_us));
    }

    fn transfer_byte(&mut self, tx_byte: u8) -> IspResult<u8> {
        let mut rx_byte = 0u8;

        for bit in (0..8).rev() {
            self.set_line(self.config.mosi, (tx_byte >> bit) & 0x01 != 0)?;
            self.half_period_delay();

            // Rising edge: target samples MOSI, we sample MISO
            self.set_line(self.config.sck, true)?;
            if self.get_miso()? {
                rx_byte |= 1 << bit;
            }
            self.half_period_delay();

            self.set_line(self.config.sck, false)?;
        }

        Ok(rx_byte)
    }
}

impl IspTransport for GpioBitbang {
    fn transact(&mut self, tx: [u8; 4]) -> IspResult<[u8; 4]> {
        let mut rx = [0u8; 4];
        for (i, &byte) in tx.iter().enumerate() {
            rx[i] = self.transfer_byte(byte)?;
        }
        Ok(rx)
    }

    fn reset_assert(&mut self) -> IspResult<()> {
        self.set_line(self.config.reset, false)
    }

    fn reset_release(&mut self) -> IspResult<()> {
        self.set_line(self.config.reset, true)
    }
}
