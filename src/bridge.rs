use tracing::{info, trace};

use crate::constants::{SERIAL_CHUNK_SIZE, SERIAL_TIMEOUT_MS};
use crate::error::{IspError, IspResult};
use crate::isp::IspTransport;
use crate::protocol::ResponseSink;
use crate::protocol::stk500v1::Stk500v1;
use std::io::{Read, Write};

/// Wires the host-facing serial port to the STK500v1 engine: a poll loop
/// reads whatever bytes are available and feeds them in, and the engine
/// writes its responses back through the same port.
pub struct Bridge {
    port: Box<dyn serialport::SerialPort>,
    engine: Stk500v1,
}

struct SerialSink<'a> {
    port: &'a mut Box<dyn serialport::SerialPort>,
}

impl ResponseSink for SerialSink<'_> {
    fn write(&mut self, bytes: &[u8]) -> IspResult<()> {
        self.port
            .write_all(bytes)
            .map_err(|e| IspError::Channel(format!("Failed to write response: {e}")))?;
        trace!("Sent bytes {:02x?}", bytes);
        Ok(())
    }

    fn flush(&mut self) -> IspResult<()> {
        self.port
            .flush()
            .map_err(|e| IspError::Channel(format!("Failed to flush response: {e}")))
    }
}

impl Bridge {
    pub fn open(port: &str, baud: u32, transport: Box<dyn IspTransport>) -> IspResult<Self> {
        let port = serialport::new(port, baud)
            .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()
            .map_err(|e| IspError::Channel(format!("{e:?}")))?;

        let mut engine = Stk500v1::new(transport);
        engine.init();

        Ok(Bridge { port, engine })
    }

    /// Run the poll loop until the serial port fails or the engine halts
    /// (erase ceiling). Restarting the process is the only way to clear a
    /// halt, mirroring the power-cycle requirement of the original device.
    pub fn run(&mut self) -> IspResult<()> {
        info!("Bridge running, waiting for host commands");
        let mut chunk = [0u8; SERIAL_CHUNK_SIZE];

        loop {
            let n = self
                .port
                .read(&mut chunk)
                // Timeout just means no data yet
                .or_else(|e| {
                    if e.kind() == std::io::ErrorKind::TimedOut {
                        Ok(0)
                    } else {
                        Err(e)
                    }
                })
                .map_err(|e| IspError::Channel(format!("Failed to read from host: {e}")))?;

            if n > 0 {
                trace!("Received bytes {:02x?}", &chunk[..n]);
                let mut sink = SerialSink {
                    port: &mut self.port,
                };
                self.engine.feed(&chunk[..n], &mut sink)?;
            }
        }
    }
}
