use tracing::{debug, error, info, trace, warn};

use crate::constants::{
    DEFAULT_PAGE_SIZE_BYTES, ERASE_CEILING, HARDWARE_VERSION, MAX_PAGE_BYTES, RX_BUF_SIZE,
    SOFTWARE_VERSION_MAJOR, SOFTWARE_VERSION_MINOR,
};
use crate::devices::lookup_device;
use crate::error::{IspError, IspResult};
use crate::isp::IspTransport;
use crate::isp::sequencer::AvrIsp;
use crate::protocol::ResponseSink;

// STK500v1 command set used by avrdude -c arduino
pub const CMND_STK_GET_SYNC: u8 = 0x30;
pub const CMND_STK_GET_SIGN_ON: u8 = 0x31;
pub const CMND_STK_SET_PARAMETER: u8 = 0x40;
pub const CMND_STK_GET_PARAMETER: u8 = 0x41;
pub const CMND_STK_SET_DEVICE: u8 = 0x42;
pub const CMND_STK_SET_DEVICE_EXT: u8 = 0x45;
pub const CMND_STK_ENTER_PROGMODE: u8 = 0x50;
pub const CMND_STK_LEAVE_PROGMODE: u8 = 0x51;
pub const CMND_STK_CHIP_ERASE: u8 = 0x52;
pub const CMND_STK_CHECK_AUTOINC: u8 = 0x53;
pub const CMND_STK_LOAD_ADDRESS: u8 = 0x55;
pub const CMND_STK_UNIVERSAL: u8 = 0x56;
pub const CMND_STK_PROG_FLASH: u8 = 0x60; // legacy byte write, not implemented
pub const CMND_STK_PROG_DATA: u8 = 0x61; // legacy EEPROM write, not implemented
pub const CMND_STK_PROG_PAGE: u8 = 0x64;
pub const CMND_STK_READ_FLASH: u8 = 0x70; // legacy byte read, not implemented
pub const CMND_STK_READ_DATA: u8 = 0x71; // legacy EEPROM read, not implemented
pub const CMND_STK_READ_PAGE: u8 = 0x74;
pub const CMND_STK_READ_SIGN: u8 = 0x75;

pub const SYNC_CRC_EOP: u8 = 0x20;

pub const RESP_STK_OK: u8 = 0x10;
pub const RESP_STK_FAILED: u8 = 0x11;
pub const RESP_STK_INSYNC: u8 = 0x14;
pub const RESP_STK_NOSYNC: u8 = 0x15;

pub const PARM_STK_HW_VER: u8 = 0x80;
pub const PARM_STK_SW_MAJOR: u8 = 0x81;
pub const PARM_STK_SW_MINOR: u8 = 0x82;

const SIGN_ON_REPLY: &[u8] = b"AVR ISP";

/// Per-power-on programming state, exclusively owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammerSession {
    pub current_word_address: u32,
    pub programming_mode: bool,
    pub page_size_bytes: u16,
    pub words_per_page: u16,
    pub erase_count: u32,
}

impl ProgrammerSession {
    fn new() -> Self {
        ProgrammerSession {
            current_word_address: 0,
            programming_mode: false,
            page_size_bytes: DEFAULT_PAGE_SIZE_BYTES,
            words_per_page: DEFAULT_PAGE_SIZE_BYTES / 2,
            erase_count: 0,
        }
    }
}

/// Bounded receive FIFO. Bytes past capacity are dropped, matching the
/// original wire behavior, but the loss is counted and logged.
struct RxBuffer {
    buf: Vec<u8>,
    dropped: u64,
}

impl RxBuffer {
    fn new() -> Self {
        RxBuffer {
            buf: Vec::with_capacity(RX_BUF_SIZE),
            dropped: 0,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let free = RX_BUF_SIZE - self.buf.len();
        let to_copy = data.len().min(free);
        self.buf.extend_from_slice(&data[..to_copy]);
        let truncated = data.len() - to_copy;
        if truncated > 0 {
            self.dropped += truncated as u64;
            warn!(
                "Receive buffer full: dropped {} bytes ({} total this session)",
                truncated, self.dropped
            );
        }
    }

    fn drop_front(&mut self, n: usize) {
        self.buf.drain(..n.min(self.buf.len()));
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Outcome of the per-command frame length lookup.
enum FrameLen {
    /// Total frame length including command byte and terminator
    Known(usize),
    /// Variable-length frame whose size field is not fully buffered yet
    NeedMore,
    /// First byte cannot start a frame; drop it and resynchronize
    Desync,
}

/// Expected total frame length for the command at the front of `buf`.
fn expected_frame_len(buf: &[u8]) -> FrameLen {
    match buf[0] {
        CMND_STK_GET_SYNC
        | CMND_STK_GET_SIGN_ON
        | CMND_STK_ENTER_PROGMODE
        | CMND_STK_LEAVE_PROGMODE
        | CMND_STK_CHIP_ERASE
        | CMND_STK_CHECK_AUTOINC
        | CMND_STK_READ_SIGN
        | CMND_STK_READ_FLASH
        | CMND_STK_READ_DATA => FrameLen::Known(2),
        CMND_STK_GET_PARAMETER | CMND_STK_PROG_DATA => FrameLen::Known(3),
        CMND_STK_SET_PARAMETER | CMND_STK_LOAD_ADDRESS | CMND_STK_PROG_FLASH => FrameLen::Known(4),
        CMND_STK_SET_DEVICE => FrameLen::Known(22),
        CMND_STK_SET_DEVICE_EXT => FrameLen::Known(7),
        CMND_STK_UNIVERSAL => FrameLen::Known(6),
        CMND_STK_READ_PAGE => FrameLen::Known(5),
        CMND_STK_PROG_PAGE => {
            // cmd + size_hi + size_lo + memtype must be buffered before the
            // total length is knowable.
            if buf.len() < 4 {
                return FrameLen::NeedMore;
            }
            let size = usize::from(buf[1]) << 8 | usize::from(buf[2]);
            if size > MAX_PAGE_BYTES {
                return FrameLen::Desync;
            }
            FrameLen::Known(1 + 3 + size + 1)
        }
        _ => FrameLen::Desync,
    }
}

/// STK500v1 protocol engine: frames an unbounded chunked byte stream into
/// commands, drives the ISP sequencer, and emits framed responses.
///
/// Fully cooperative: `feed` never blocks. When a frame is incomplete the
/// frame loop simply returns, keeping the partial bytes buffered for the
/// next call.
pub struct Stk500v1 {
    session: ProgrammerSession,
    rx: RxBuffer,
    isp: AvrIsp,
    halted: bool,
}

impl Stk500v1 {
    pub fn new(transport: Box<dyn IspTransport>) -> Self {
        Stk500v1 {
            session: ProgrammerSession::new(),
            rx: RxBuffer::new(),
            isp: AvrIsp::new(transport),
            halted: false,
        }
    }

    /// Reset to a fresh session and discard any buffered input.
    pub fn init(&mut self) {
        self.session = ProgrammerSession::new();
        self.rx.clear();
        self.halted = false;
    }

    pub fn session(&self) -> &ProgrammerSession {
        &self.session
    }

    /// Bytes lost to receive-buffer truncation since construction.
    pub fn dropped_bytes(&self) -> u64 {
        self.rx.dropped
    }

    /// Append bytes and process every complete frame currently buffered,
    /// writing responses through `sink`.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn ResponseSink) -> IspResult<()> {
        if self.halted {
            return Err(IspError::EraseLimitReached);
        }

        self.rx.push(data);

        loop {
            if self.rx.len() == 0 {
                return Ok(());
            }

            // Stray terminators are common after a previous desync.
            if self.rx.as_slice()[0] == SYNC_CRC_EOP {
                self.rx.drop_front(1);
                continue;
            }

            let needed = match expected_frame_len(self.rx.as_slice()) {
                FrameLen::Known(n) => n,
                FrameLen::NeedMore => return Ok(()),
                FrameLen::Desync => {
                    trace!("Dropping unframeable byte {:#04x}", self.rx.as_slice()[0]);
                    self.rx.drop_front(1);
                    continue;
                }
            };

            if self.rx.len() < needed {
                return Ok(());
            }

            let slice = self.rx.as_slice();
            if slice[needed - 1] != SYNC_CRC_EOP {
                // Corrupt frame: discard through the next terminator if one
                // is buffered, otherwise a single byte, and tell the host.
                debug!(
                    "Bad terminator {:#04x} for command {:#04x}, resynchronizing",
                    slice[needed - 1],
                    slice[0]
                );
                match slice.iter().position(|&b| b == SYNC_CRC_EOP) {
                    Some(idx) => self.rx.drop_front(idx + 1),
                    None => self.rx.drop_front(1),
                }
                resp_nosync(sink)?;
                continue;
            }

            let cmd = slice[0];
            let payload = slice[1..needed - 1].to_vec();
            self.rx.drop_front(needed);
            self.handle_frame(cmd, &payload, sink)?;
        }
    }

    fn handle_frame(
        &mut self,
        cmd: u8,
        payload: &[u8],
        sink: &mut dyn ResponseSink,
    ) -> IspResult<()> {
        trace!("Frame {:#04x}, payload {} bytes", cmd, payload.len());

        match cmd {
            CMND_STK_GET_SYNC => resp_ok(sink),

            CMND_STK_GET_SIGN_ON => resp_data(sink, SIGN_ON_REPLY),

            CMND_STK_GET_PARAMETER => {
                if payload.len() != 1 {
                    return resp_failed(sink);
                }
                resp_data(sink, &[parameter_value(payload[0])])
            }

            CMND_STK_SET_PARAMETER => {
                // Accepted and ignored; parameters are informational only.
                if payload.len() != 2 {
                    return resp_failed(sink);
                }
                resp_ok(sink)
            }

            // The device is auto-detected from its signature, so host
            // device descriptors are accepted and ignored.
            CMND_STK_SET_DEVICE | CMND_STK_SET_DEVICE_EXT => resp_ok(sink),

            CMND_STK_ENTER_PROGMODE => {
                if self.isp.enter_programming_mode()? {
                    self.session.programming_mode = true;
                    self.cache_device_params()?;
                    resp_ok(sink)
                } else {
                    resp_failed(sink)
                }
            }

            CMND_STK_LEAVE_PROGMODE => {
                self.session.programming_mode = false;
                self.isp.leave_programming_mode()?;
                info!("Left programming mode");
                resp_ok(sink)
            }

            CMND_STK_CHIP_ERASE => {
                if self.session.erase_count >= ERASE_CEILING {
                    error!(
                        "Erase ceiling of {} reached; halting to protect flash",
                        ERASE_CEILING
                    );
                    self.halted = true;
                    return Err(IspError::EraseLimitReached);
                }
                self.isp.chip_erase()?;
                self.session.erase_count += 1;
                resp_ok(sink)
            }

            CMND_STK_CHECK_AUTOINC => resp_data(sink, &[1]),

            CMND_STK_LOAD_ADDRESS => {
                if payload.len() != 2 {
                    return resp_failed(sink);
                }
                // Word address, low byte first
                self.session.current_word_address =
                    u32::from(payload[1]) << 8 | u32::from(payload[0]);
                resp_ok(sink)
            }

            CMND_STK_READ_SIGN => {
                let signature = self.isp.read_signature()?;
                resp_data(sink, &signature)
            }

            CMND_STK_UNIVERSAL => {
                if payload.len() != 4 {
                    return resp_failed(sink);
                }
                let rx = self
                    .isp
                    .transact([payload[0], payload[1], payload[2], payload[3]])?;
                resp_data(sink, &[rx[3]])
            }

            CMND_STK_PROG_PAGE => self.prog_page(payload, sink),

            CMND_STK_READ_PAGE => self.read_page(payload, sink),

            _ => {
                debug!("Unsupported command {:#04x}", cmd);
                resp_failed(sink)
            }
        }
    }

    /// Re-derive page geometry from the detected signature. Unknown parts
    /// keep the current (default) geometry.
    fn cache_device_params(&mut self) -> IspResult<()> {
        let signature = self.isp.read_signature()?;
        match lookup_device(signature) {
            Some(device) if device.page_size != 0 => {
                info!(
                    "Detected {} ({} byte pages)",
                    device.name, device.page_size
                );
                self.session.page_size_bytes = device.page_size;
                self.session.words_per_page = device.page_size / 2;
            }
            _ => {
                debug!(
                    "Unknown signature {:02x?}, keeping {} byte default page size",
                    signature, self.session.page_size_bytes
                );
            }
        }
        Ok(())
    }

    fn prog_page(&mut self, payload: &[u8], sink: &mut dyn ResponseSink) -> IspResult<()> {
        if payload.len() < 3 {
            return resp_failed(sink);
        }
        let size = usize::from(payload[0]) << 8 | usize::from(payload[1]);
        let memtype = payload[2];
        let data = &payload[3..];

        if !(memtype == b'F' || memtype == b'f') || size != data.len() {
            return resp_failed(sink);
        }
        if size > usize::from(self.session.page_size_bytes) || size > MAX_PAGE_BYTES {
            return resp_failed(sink);
        }

        // Flash is word-addressed; avrdude sends even sizes for flash.
        let words = size / 2;
        for j in 0..words {
            let word = u16::from(data[j * 2 + 1]) << 8 | u16::from(data[j * 2]);
            self.isp.write_page_buffer_word(j as u16, word)?;
        }
        self.isp.commit_page(self.session.current_word_address as u16)?;
        self.session.current_word_address += words as u32;

        debug!(
            "Programmed {} words, address now {:#06x}",
            words, self.session.current_word_address
        );
        resp_ok(sink)
    }

    fn read_page(&mut self, payload: &[u8], sink: &mut dyn ResponseSink) -> IspResult<()> {
        if payload.len() != 3 {
            return resp_failed(sink);
        }
        let size = usize::from(payload[0]) << 8 | usize::from(payload[1]);
        let memtype = payload[2];

        if !(memtype == b'F' || memtype == b'f') || size == 0 || size > MAX_PAGE_BYTES {
            return resp_failed(sink);
        }

        let mut bytes = Vec::with_capacity(size);
        for off in 0..size {
            let word = self
                .isp
                .read_program_word((self.session.current_word_address + (off / 2) as u32) as u16)?;
            bytes.push(if off & 1 == 1 {
                (word >> 8) as u8
            } else {
                word as u8
            });
        }
        self.session.current_word_address += size.div_ceil(2) as u32;

        resp_data(sink, &bytes)
    }
}

fn parameter_value(param: u8) -> u8 {
    // Values are informational for the host tool; keep them stable.
    match param {
        PARM_STK_HW_VER => HARDWARE_VERSION,
        PARM_STK_SW_MAJOR => SOFTWARE_VERSION_MAJOR,
        PARM_STK_SW_MINOR => SOFTWARE_VERSION_MINOR,
        _ => 0x00,
    }
}

fn resp_ok(sink: &mut dyn ResponseSink) -> IspResult<()> {
    sink.write(&[RESP_STK_INSYNC, RESP_STK_OK])?;
    sink.flush()
}

fn resp_failed(sink: &mut dyn ResponseSink) -> IspResult<()> {
    sink.write(&[RESP_STK_INSYNC, RESP_STK_FAILED])?;
    sink.flush()
}

fn resp_nosync(sink: &mut dyn ResponseSink) -> IspResult<()> {
    sink.write(&[RESP_STK_NOSYNC])?;
    sink.flush()
}

/// Success response with payload bytes between the in-sync and ok markers.
fn resp_data(sink: &mut dyn ResponseSink, payload: &[u8]) -> IspResult<()> {
    sink.write(&[RESP_STK_INSYNC])?;
    sink.write(payload)?;
    sink.write(&[RESP_STK_OK])?;
    sink.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_len(bytes: &[u8]) -> FrameLen {
        expected_frame_len(bytes)
    }

    #[test]
    fn fixed_frame_lengths() {
        assert!(matches!(frame_len(&[CMND_STK_GET_SYNC]), FrameLen::Known(2)));
        assert!(matches!(
            frame_len(&[CMND_STK_LOAD_ADDRESS]),
            FrameLen::Known(4)
        ));
        assert!(matches!(
            frame_len(&[CMND_STK_SET_DEVICE]),
            FrameLen::Known(22)
        ));
        assert!(matches!(
            frame_len(&[CMND_STK_SET_DEVICE_EXT]),
            FrameLen::Known(7)
        ));
        assert!(matches!(frame_len(&[CMND_STK_UNIVERSAL]), FrameLen::Known(6)));
        assert!(matches!(frame_len(&[CMND_STK_READ_PAGE]), FrameLen::Known(5)));
    }

    #[test]
    fn prog_page_length_needs_size_field() {
        assert!(matches!(
            frame_len(&[CMND_STK_PROG_PAGE, 0x00]),
            FrameLen::NeedMore
        ));
        assert!(matches!(
            frame_len(&[CMND_STK_PROG_PAGE, 0x00, 0x04, b'F']),
            FrameLen::Known(9)
        ));
    }

    #[test]
    fn prog_page_oversized_is_desync() {
        assert!(matches!(
            frame_len(&[CMND_STK_PROG_PAGE, 0x01, 0x01, b'F']),
            FrameLen::Desync
        ));
    }

    #[test]
    fn unknown_command_is_desync() {
        assert!(matches!(frame_len(&[0x00]), FrameLen::Desync));
        assert!(matches!(frame_len(&[0xff]), FrameLen::Desync));
    }

    #[test]
    fn rx_buffer_truncates_and_counts() {
        let mut rx = RxBuffer::new();
        rx.push(&vec![0xaa; RX_BUF_SIZE + 100]);
        assert_eq!(rx.len(), RX_BUF_SIZE);
        assert_eq!(rx.dropped, 100);

        rx.drop_front(50);
        assert_eq!(rx.len(), RX_BUF_SIZE - 50);
        rx.push(&[0xbb; 60]);
        assert_eq!(rx.len(), RX_BUF_SIZE);
        assert_eq!(rx.dropped, 110);
    }

    #[test]
    fn parameter_values_are_stable() {
        assert_eq!(parameter_value(PARM_STK_HW_VER), 0x02);
        assert_eq!(parameter_value(PARM_STK_SW_MAJOR), 0x01);
        assert_eq!(parameter_value(PARM_STK_SW_MINOR), 0x12);
        assert_eq!(parameter_value(0x83), 0x00);
    }
}
