use avrlink::error::IspResult;
use clap::{Parser, command};
use probe::{ProbeOptions, handle_probe};
use serve::{ServeOptions, handle_serve};

mod probe;
mod serve;
mod transport;

#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
enum Cli {
    /// Bridge STK500v1 commands from a serial port to an ISP target
    #[command(name = "serve", alias = "s")]
    Serve(ServeOptions),

    /// Enter programming mode, read the target signature, and report it
    #[command(name = "probe", alias = "p")]
    Probe(ProbeOptions),
}

fn main() -> IspResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli {
        Cli::Serve(opts) => handle_serve(opts)?,
        Cli::Probe(opts) => handle_probe(opts)?,
    }

    Ok(())
}
