use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};
use tracing::info;

use crate::error::{IspError, IspResult};
use crate::isp::IspTransport;

/// Default SPI clock (100 kHz): safe for targets clocked down to ~1 MHz,
/// where the ISP clock must stay well below a quarter of the core clock.
const DEFAULT_SPEED_HZ: u32 = 100_000;

/// SPI mode 0: CPOL=0, CPHA=0, as required by AVR serial programming.
const SPI_MODE_0: u8 = 0;

mod ioctl {
    use nix::ioctl_write_ptr;

    const SPI_IOC_MAGIC: u8 = b'k';
    const SPI_IOC_TYPE_MODE: u8 = 1;
    const SPI_IOC_TYPE_BITS_PER_WORD: u8 = 3;
    const SPI_IOC_TYPE_MAX_SPEED_HZ: u8 = 4;

    ioctl_write_ptr!(spi_ioc_wr_mode, SPI_IOC_MAGIC, SPI_IOC_TYPE_MODE, u8);
    ioctl_write_ptr!(
        spi_ioc_wr_bits_per_word,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_BITS_PER_WORD,
        u8
    );
    ioctl_write_ptr!(
        spi_ioc_wr_max_speed_hz,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_MAX_SPEED_HZ,
        u32
    );

    /// Size of the kernel's struct spi_ioc_transfer
    pub const SPI_IOC_TRANSFER_SIZE: usize = 32;

    /// Calculate the ioctl number for SPI_IOC_MESSAGE(n)
    pub fn spi_ioc_message(n: u8) -> libc::c_ulong {
        let size = (n as usize) * SPI_IOC_TRANSFER_SIZE;
        // _IOW(SPI_IOC_MAGIC, 0, char[SPI_MSGSIZE(n)])
        ((1u32 << 30) | ((size as u32) << 16) | ((SPI_IOC_MAGIC as u32) << 8)) as libc::c_ulong
    }
}

/// Must match the kernel's struct spi_ioc_transfer layout.
#[repr(C)]
#[derive(Debug, Default, Clone)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    _pad: u8,
}

/// Configuration for the spidev-backed transport.
///
/// spidev has no notion of the target's RESET line, so that is driven
/// through a separate GPIO character device line.
#[derive(Debug, Clone)]
pub struct SpidevConfig {
    /// spidev path (e.g. "/dev/spidev0.0")
    pub device: String,
    /// SPI clock speed in Hz
    pub speed_hz: u32,
    /// GPIO character device path for the RESET line (e.g. "/dev/gpiochip0")
    pub reset_chip: String,
    /// RESET line offset on that chip
    pub reset_line: Offset,
}

impl SpidevConfig {
    pub fn new(device: impl Into<String>, reset_chip: impl Into<String>, reset_line: Offset) -> Self {
        SpidevConfig {
            device: device.into(),
            speed_hz: DEFAULT_SPEED_HZ,
            reset_chip: reset_chip.into(),
            reset_line,
        }
    }

    pub fn with_speed(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }
}

/// Hardware SPI transport using Linux's spidev interface.
pub struct SpidevTransport {
    file: File,
    speed_hz: u32,
    reset: Request,
    reset_line: Offset,
}

impl SpidevTransport {
    pub fn open(config: &SpidevConfig) -> IspResult<Self> {
        if config.device.is_empty() {
            return Err(IspError::ConfigurationError(
                "No spidev device specified".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|e| IspError::Transport(format!("Failed to open {}: {e}", config.device)))?;

        let fd = file.as_raw_fd();

        let mode = SPI_MODE_0;
        unsafe {
            ioctl::spi_ioc_wr_mode(fd, &mode)
                .map_err(|e| IspError::Transport(format!("Failed to set SPI mode: {e}")))?;
        }

        let bits: u8 = 8;
        unsafe {
            ioctl::spi_ioc_wr_bits_per_word(fd, &bits)
                .map_err(|e| IspError::Transport(format!("Failed to set bits per word: {e}")))?;
        }

        let speed = config.speed_hz;
        unsafe {
            ioctl::spi_ioc_wr_max_speed_hz(fd, &speed)
                .map_err(|e| IspError::Transport(format!("Failed to set SPI speed: {e}")))?;
        }

        // RESET starts high so the target runs until programming begins.
        let mut reset_config = Config::default();
        reset_config
            .with_line(config.reset_line)
            .as_output(Value::Active);
        let reset = Request::from_config(reset_config)
            .on_chip(&config.reset_chip)
            .with_consumer("avrlink")
            .request()
            .map_err(|e| IspError::Transport(format!("Failed to request RESET line: {e}")))?;

        info!(
            "Opened {} (mode 0, {} kHz), reset on {}:{}",
            config.device,
            speed / 1000,
            config.reset_chip,
            config.reset_line
        );

        Ok(SpidevTransport {
            file,
            speed_hz: speed,
            reset,
            reset_line: config.reset_line,
        })
    }

    fn set_reset(&mut self, high: bool) -> IspResult<()> {
        let value = if high { Value::Active } else { Value::Inactive };
        self.reset
            .set_value(self.reset_line, value)
            .map_err(|e| IspError::Transport(format!("Failed to set RESET line: {e}")))?;
        Ok(())
    }
}

impl IspTransport for SpidevTransport {
    fn transact(&mut self, tx: [u8; 4]) -> IspResult<[u8; 4]> {
        let mut rx = [0u8; 4];
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            ..Default::default()
        };

        let fd = self.file.as_raw_fd();
        let ret =
            unsafe { libc::ioctl(fd, ioctl::spi_ioc_message(1), &raw const transfer) };
        if ret < 0 {
            return Err(IspError::Transport(format!(
                "SPI transfer failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(rx)
    }

    fn reset_assert(&mut self) -> IspResult<()> {
        self.set_reset(false)
    }

    fn reset_release(&mut self) -> IspResult<()> {
        self.set_reset(true)
    }
}
