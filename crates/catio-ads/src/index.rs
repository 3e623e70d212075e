//! Index groups used by the I/O server and EtherCAT master devices.
//!
//! Groups in the 0xF000 range are served by the I/O server (port 300).
//! The master diagnostic groups are served by each EtherCAT device at its
//! own NetId on port 0xFFFF.

// Symbol access.

/// Get a symbol handle by name (ReadWrite, write data = name).
pub const SYM_HNDBYNAME: u32 = 0xF003;
/// Read/write a value by symbol handle (offset = handle).
pub const SYM_VALBYHND: u32 = 0xF005;
/// Release a symbol handle (write data = handle).
pub const SYM_RELEASEHND: u32 = 0xF006;
/// Full symbol table upload.
pub const SYM_UPLOAD: u32 = 0xF00B;
/// Symbol count and upload length (8 bytes).
pub const SYM_UPLOADINFO: u32 = 0xF00C;
/// Extended upload info (24 bytes).
pub const SYM_UPLOADINFO2: u32 = 0xF00F;

// Process image.

/// Input process image (offset = byte offset).
pub const IO_RW_I: u32 = 0xF020;
/// Size of the input process image.
pub const IO_SIZE_I: u32 = 0xF025;
/// Output process image (offset = byte offset).
pub const IO_RW_Q: u32 = 0xF030;
/// Size of the output process image.
pub const IO_SIZE_Q: u32 = 0xF035;

/// Sum-read (ReadWrite, offset = item count).
pub const SUMUP_READ: u32 = 0xF080;

// I/O devices.

/// Device state base; device `n` lives at `IO_DEVICE_STATE_BASE + n`.
pub const IO_DEVICE_STATE_BASE: u32 = 0x5000;
/// On the base group: `u16` count followed by that many `u16` device ids.
pub const IO_DEVICE_IDS: u32 = 0x0002;
/// On a device group: null-terminated device name.
pub const IO_DEVICE_NAME: u32 = 0x0001;
/// On a device group: 6-byte NetId of the device.
pub const IO_DEVICE_NETID: u32 = 0x0005;
/// On a device group: `u16` device type.
pub const IO_DEVICE_TYPE: u32 = 0x0007;

/// Device type code of an EtherCAT master.
pub const DEVICE_TYPE_ETHERCAT: u16 = 94;

// EtherCAT master diagnostics.

/// Master EtherCAT state (`u16`).
pub const MASTER_STATE: u32 = 0x0003;
/// Number of slaves (`u32`).
pub const SLAVE_COUNT: u32 = 0x0006;
/// Slave addresses (`u16` each).
pub const SLAVE_ADDRESSES: u32 = 0x0007;
/// Slave identity (offset = address, 16 bytes).
pub const SLAVE_IDENTITY: u32 = 0x0009;
/// Slave state and link status (offset 0 = all, else one address; 2 bytes each).
pub const SLAVE_STATES: u32 = 0x000A;
/// Frame counters (24 bytes).
pub const FRAME_COUNTERS: u32 = 0x000C;
/// CRC counters for ports A-D (offset 0 = all, else one address; 16 bytes each).
pub const SLAVE_CRC: u32 = 0x0012;

/// CoE SDO access; offset = `index << 16 | subindex`, port = slave address.
pub const COE_SDO: u32 = 0xF302;

/// Pack a CoE object address into an index offset.
#[must_use]
pub fn coe_offset(index: u16, subindex: u8) -> u32 {
    u32::from(index) << 16 | u32::from(subindex)
}

/// Split an index offset into a CoE object address.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn coe_address(offset: u32) -> (u16, u8) {
    ((offset >> 16) as u16, (offset & 0xFF) as u8)
}
