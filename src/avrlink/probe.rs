use avrlink::error::IspResult;
use avrlink::{AvrIsp, lookup_device};
use clap::Parser;
use tracing::warn;

use crate::transport::{TransportOptions, build_transport};

#[derive(Parser, Debug, Clone)]
pub(crate) struct ProbeOptions {
    #[clap(flatten)]
    transport: TransportOptions,
}

pub(crate) fn handle_probe(opts: ProbeOptions) -> IspResult<()> {
    let transport = build_transport(&opts.transport)?;
    let mut isp = AvrIsp::new(transport);

    if !isp.enter_programming_mode()? {
        warn!("Target did not acknowledge programming mode");
        return Ok(());
    }

    let signature = isp.read_signature()?;
    match lookup_device(signature) {
        Some(device) => println!(
            "{:02x} {:02x} {:02x}  {} ({} bytes flash, {} byte pages)",
            signature[0], signature[1], signature[2], device.name, device.flash_size, device.page_size
        ),
        None => println!(
            "{:02x} {:02x} {:02x}  unknown device",
            signature[0], signature[1], signature[2]
        ),
    }

    isp.leave_programming_mode()?;
    Ok(())
}
