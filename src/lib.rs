pub use bridge::Bridge;
pub use devices::{DeviceProfile, lookup_device};
pub use isp::IspTransport;
pub use isp::sequencer::AvrIsp;
pub use protocol::ResponseSink;
pub use protocol::stk500v1::{ProgrammerSession, Stk500v1};

pub mod bridge;
pub(crate) mod constants;
pub mod devices;
pub mod error;
pub mod isp;
pub mod protocol;
