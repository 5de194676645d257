/// Profile of an AVR part that avrlink knows how to program.
///
/// The signature is the 3-byte identifier read over ISP; page geometry
/// drives the PROG_PAGE size checks in the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub signature: [u8; 3],
    pub name: &'static str,
    pub flash_size: u32,
    pub page_size: u16,
}

static DEVICES: &[DeviceProfile] = &[
    DeviceProfile {
        signature: [0x1e, 0x95, 0x0f],
        name: "ATmega328P",
        flash_size: 32768,
        page_size: 128,
    },
    DeviceProfile {
        signature: [0x1e, 0x93, 0x0b],
        name: "ATtiny85",
        flash_size: 8192,
        page_size: 64,
    },
    // (Add more devices here as needed)
];

/// Look up a device profile by its 3-byte signature. Unknown signatures
/// are a normal outcome; the caller keeps its default page geometry.
pub fn lookup_device(signature: [u8; 3]) -> Option<&'static DeviceProfile> {
    DEVICES.iter().find(|d| d.signature == signature)
}
