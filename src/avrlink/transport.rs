use avrlink::IspTransport;
use avrlink::error::{IspError, IspResult};
use avrlink::isp::bitbang::{GpioBitbang, GpioBitbangConfig};
use avrlink::isp::spidev::{SpidevConfig, SpidevTransport};
use clap::{Args, ValueEnum};

#[derive(Debug, Clone, ValueEnum)]
pub(crate) enum TransportKind {
    /// Hardware SPI via /dev/spidevX.Y, RESET on a GPIO line
    Spidev,

    /// Software SPI bit-banged over GPIO lines
    Bitbang,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct TransportOptions {
    /// ISP transport to drive the target with
    #[clap(short, long, value_enum, default_value = "spidev")]
    transport: TransportKind,

    /// spidev device path (spidev transport)
    #[clap(long, default_value = "/dev/spidev0.0")]
    spidev: String,

    /// SPI clock speed in Hz (spidev transport)
    #[clap(long)]
    spi_speed: Option<u32>,

    /// GPIO character device path (RESET line, and all lines for bitbang)
    #[clap(long, default_value = "/dev/gpiochip0")]
    gpiochip: String,

    /// RESET line offset
    #[clap(long, default_value_t = 25)]
    reset: u32,

    /// SCK line offset (bitbang transport)
    #[clap(long)]
    sck: Option<u32>,

    /// MOSI line offset (bitbang transport)
    #[clap(long)]
    mosi: Option<u32>,

    /// MISO line offset (bitbang transport)
    #[clap(long)]
    miso: Option<u32>,

    /// Bitbang half-period in microseconds
    #[clap(long)]
    half_period: Option<u64>,
}

pub(crate) fn build_transport(opts: &TransportOptions) -> IspResult<Box<dyn IspTransport>> {
    match opts.transport {
        TransportKind::Spidev => {
            let mut config = SpidevConfig::new(&opts.spidev, &opts.gpiochip, opts.reset);
            if let Some(speed) = opts.spi_speed {
                config = config.with_speed(speed);
            }
            Ok(Box::new(SpidevTransport::open(&config)?))
        }
        TransportKind::Bitbang => {
            let (Some(sck), Some(mosi), Some(miso)) = (opts.sck, opts.mosi, opts.miso) else {
                return Err(IspError::ConfigurationError(
                    "Bitbang transport needs --sck, --mosi and --miso line offsets".to_string(),
                ));
            };
            let mut config = GpioBitbangConfig::new(&opts.gpiochip, sck, mosi, miso, opts.reset);
            if let Some(us) = opts.half_period {
                config = config.with_half_period_us(us);
            }
            Ok(Box::new(GpioBitbang::open(config)?))
        }
    }
}
