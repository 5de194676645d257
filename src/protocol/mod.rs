pub mod stk500v1;

use crate::error::IspResult;

/// Ordered byte channel carrying responses back to the host tool.
///
/// `flush` marks a response boundary: the engine flushes after every
/// complete response so nothing is left buffered across `feed` calls.
pub trait ResponseSink {
    fn write(&mut self, bytes: &[u8]) -> IspResult<()>;
    fn flush(&mut self) -> IspResult<()>;
}
