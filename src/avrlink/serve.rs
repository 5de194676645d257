use avrlink::Bridge;
use avrlink::error::IspResult;
use clap::Parser;

use crate::transport::{TransportOptions, build_transport};

#[derive(Parser, Debug, Clone)]
pub(crate) struct ServeOptions {
    /// Host-facing serial port to listen on
    #[clap(short, long)]
    serial: String,

    /// Baud rate
    #[clap(short, long, default_value_t = 115200)]
    baudrate: u32,

    #[clap(flatten)]
    transport: TransportOptions,
}

pub(crate) fn handle_serve(opts: ServeOptions) -> IspResult<()> {
    let transport = build_transport(&opts.transport)?;
    let mut bridge = Bridge::open(&opts.serial, opts.baudrate, transport)?;
    bridge.run()
}
