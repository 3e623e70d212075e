//! EtherCAT inventory: master devices and their slave terminals.
//!
//! The wire layouts of the master diagnostic groups live here next to the
//! types they fill, so discovery and the server share one definition.

use crate::codec::ByteReader;
use catio_common::error::{AdsError, AdsResult};
use catio_common::net_id::{AmsAddr, NetId, PORT_ETHERCAT_MASTER};
use catio_common::time::FileTime;
use serde::{Deserialize, Serialize};

/// EtherCAT address of the first slave; the rest follow in bus order.
pub const SLAVE_ADDRESS_BASE: u16 = 1001;

/// AL status bit flagging an error on the slave.
pub const AL_STATUS_ERROR: u8 = 0x10;

/// EtherCAT address of the slave at `position` in bus order.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn slave_address(position: usize) -> u16 {
    SLAVE_ADDRESS_BASE.wrapping_add(position as u16)
}

/// EtherCAT state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum EcatState {
    /// Initial state after power-on.
    #[default]
    Init = 0x01,
    /// Pre-operational: mailbox communication available.
    PreOp = 0x02,
    /// Bootstrap: firmware update mode.
    Bootstrap = 0x03,
    /// Safe-operational: inputs active, outputs safe.
    SafeOp = 0x04,
    /// Operational: full I/O active.
    Op = 0x08,
}

impl EcatState {
    /// Parse state from a raw AL status byte; the error bit is ignored.
    #[must_use]
    pub fn from_al_status(status: u8) -> Option<Self> {
        match status & 0x0F {
            0x01 => Some(Self::Init),
            0x02 => Some(Self::PreOp),
            0x03 => Some(Self::Bootstrap),
            0x04 => Some(Self::SafeOp),
            0x08 => Some(Self::Op),
            _ => None,
        }
    }
}

impl std::fmt::Display for EcatState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::PreOp => write!(f, "PRE_OP"),
            Self::Bootstrap => write!(f, "BOOTSTRAP"),
            Self::SafeOp => write!(f, "SAFE_OP"),
            Self::Op => write!(f, "OP"),
        }
    }
}

/// EtherCAT identity object (CoE 0x1018).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Vendor ID.
    pub vendor_id: u32,
    /// Product code.
    pub product_code: u32,
    /// Revision number.
    pub revision: u32,
    /// Serial number.
    pub serial: u32,
}

impl Identity {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Create a new identity.
    #[must_use]
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// Serialize to the wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, value) in bytes
            .chunks_exact_mut(4)
            .zip(self.fields())
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Parse from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            vendor_id: r.u32()?,
            product_code: r.u32()?,
            revision: r.u32()?,
            serial: r.u32()?,
        })
    }

    /// Fields in CoE subindex order (1..=4).
    #[must_use]
    pub fn fields(&self) -> [u32; 4] {
        [self.vendor_id, self.product_code, self.revision, self.serial]
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "V:{:#010x} P:{:#010x} R:{:#010x}",
            self.vendor_id, self.product_code, self.revision
        )
    }
}

/// CRC error counters of ports A to D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CrcCounters {
    /// One counter per port.
    pub ports: [u32; 4],
}

impl CrcCounters {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Serialize to the wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(self.ports) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Parse from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            ports: [r.u32()?, r.u32()?, r.u32()?, r.u32()?],
        })
    }

    /// Sum over all ports.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.ports.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Master frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameCounters {
    /// Time of the last cycle.
    pub system_time: FileTime,
    /// Cyclic frames sent.
    pub cyclic_sent: u32,
    /// Cyclic frames lost.
    pub cyclic_lost: u32,
    /// Acyclic frames sent.
    pub acyclic_sent: u32,
    /// Acyclic frames lost.
    pub acyclic_lost: u32,
}

impl FrameCounters {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    /// Serialize to the wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.system_time.ticks().to_le_bytes());
        bytes[8..12].copy_from_slice(&self.cyclic_sent.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.cyclic_lost.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.acyclic_sent.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.acyclic_lost.to_le_bytes());
        bytes
    }

    /// Parse from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            system_time: FileTime(r.u64()?),
            cyclic_sent: r.u32()?,
            cyclic_lost: r.u32()?,
            acyclic_sent: r.u32()?,
            acyclic_lost: r.u32()?,
        })
    }

    /// Account for one cyclic frame sent at `time`.
    pub fn record_cycle(&mut self, time: FileTime) {
        self.system_time = time;
        self.cyclic_sent = self.cyclic_sent.wrapping_add(1);
    }

    /// Account for one acyclic (mailbox) frame.
    pub fn record_acyclic(&mut self) {
        self.acyclic_sent = self.acyclic_sent.wrapping_add(1);
    }
}

/// One slave terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slave {
    /// EtherCAT address.
    pub address: u16,
    /// Terminal name.
    pub name: String,
    /// Identity object.
    pub identity: Identity,
    /// Raw AL status byte.
    pub state: u8,
    /// Raw link status byte.
    pub link_status: u8,
    /// Port CRC counters.
    pub crc: CrcCounters,
}

impl Slave {
    /// Parsed EtherCAT state.
    #[must_use]
    pub fn ecat_state(&self) -> Option<EcatState> {
        EcatState::from_al_status(self.state)
    }

    /// Returns true if the AL status carries the error flag.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.state & AL_STATUS_ERROR != 0
    }
}

/// One EtherCAT master device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// I/O server device id.
    pub id: u16,
    /// Display name.
    pub name: String,
    /// Device type code.
    pub type_code: u16,
    /// NetId the master answers on.
    pub net_id: NetId,
    /// Master identity.
    pub identity: Identity,
    /// Slaves in bus order.
    pub slaves: Vec<Slave>,
    /// Frame counters.
    pub frame_counters: FrameCounters,
    /// Master EtherCAT state.
    pub master_state: u16,
}

impl Device {
    /// Endpoint of the master diagnostics.
    #[must_use]
    pub fn master_addr(&self) -> AmsAddr {
        AmsAddr::new(self.net_id, PORT_ETHERCAT_MASTER)
    }

    /// Slave by EtherCAT address.
    #[must_use]
    pub fn slave(&self, address: u16) -> Option<&Slave> {
        self.slaves.iter().find(|s| s.address == address)
    }

    /// Mutable slave by EtherCAT address.
    pub fn slave_mut(&mut self, address: u16) -> Option<&mut Slave> {
        self.slaves.iter_mut().find(|s| s.address == address)
    }

    /// Encode the states of all slaves, two bytes each.
    #[must_use]
    pub fn encode_states(&self) -> Vec<u8> {
        self.slaves
            .iter()
            .flat_map(|s| [s.state, s.link_status])
            .collect()
    }

    /// Encode the CRC counters of all slaves.
    #[must_use]
    pub fn encode_crc(&self) -> Vec<u8> {
        self.slaves.iter().flat_map(|s| s.crc.to_bytes()).collect()
    }

    /// Update slave states in place from a full states read.
    pub fn apply_states(&mut self, data: &[u8]) -> AdsResult<()> {
        self.expect_len(data, 2, "states")?;
        for (slave, raw) in self.slaves.iter_mut().zip(data.chunks_exact(2)) {
            slave.state = raw[0];
            slave.link_status = raw[1];
        }
        Ok(())
    }

    /// Update CRC counters in place from a full CRC read.
    pub fn apply_crc(&mut self, data: &[u8]) -> AdsResult<()> {
        self.expect_len(data, CrcCounters::SIZE, "CRC counters")?;
        for (slave, raw) in self
            .slaves
            .iter_mut()
            .zip(data.chunks_exact(CrcCounters::SIZE))
        {
            slave.crc = CrcCounters::from_bytes(raw)?;
        }
        Ok(())
    }

    /// Update frame counters in place.
    pub fn apply_frame_counters(&mut self, data: &[u8]) -> AdsResult<()> {
        self.frame_counters = FrameCounters::from_bytes(data)?;
        Ok(())
    }

    fn expect_len(&self, data: &[u8], per_slave: usize, what: &str) -> AdsResult<()> {
        let expected = self.slaves.len() * per_slave;
        if data.len() == expected {
            Ok(())
        } else {
            Err(AdsError::InvalidPayload(format!(
                "device {} {what}: expected {expected} bytes, got {}",
                self.id,
                data.len()
            )))
        }
    }
}

/// The complete inventory of one I/O server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTree {
    /// Devices in id order.
    pub devices: Vec<Device>,
}

impl DeviceTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device by id.
    #[must_use]
    pub fn device(&self, id: u16) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Mutable device by id.
    pub fn device_mut(&mut self, id: u16) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    /// Device answering on `net_id`.
    #[must_use]
    pub fn device_by_net_id(&self, net_id: NetId) -> Option<&Device> {
        self.devices.iter().find(|d| d.net_id == net_id)
    }

    /// Mutable device answering on `net_id`.
    pub fn device_by_net_id_mut(&mut self, net_id: NetId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.net_id == net_id)
    }

    /// Device ids in order.
    #[must_use]
    pub fn device_ids(&self) -> Vec<u16> {
        self.devices.iter().map(|d| d.id).collect()
    }

    /// Total number of slaves across all devices.
    #[must_use]
    pub fn slave_count(&self) -> usize {
        self.devices.iter().map(|d| d.slaves.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with_slaves(n: usize) -> Device {
        Device {
            id: 1,
            name: "Device 1".into(),
            type_code: 94,
            net_id: NetId::new(10, 0, 0, 1, 2, 1),
            identity: Identity::default(),
            slaves: (0..n)
                .map(|i| Slave {
                    address: slave_address(i),
                    name: format!("Term {}", slave_address(i)),
                    identity: Identity::new(2, 0x044C_2C52, 0x0012_0000, 0),
                    state: EcatState::PreOp as u8,
                    link_status: 0,
                    crc: CrcCounters::default(),
                })
                .collect(),
            frame_counters: FrameCounters::default(),
            master_state: EcatState::Op as u16,
        }
    }

    #[test]
    fn test_sequential_addresses() {
        let device = device_with_slaves(3);
        let addresses: Vec<u16> = device.slaves.iter().map(|s| s.address).collect();
        assert_eq!(addresses, vec![1001, 1002, 1003]);
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(EcatState::from_al_status(0x08), Some(EcatState::Op));
        assert_eq!(EcatState::from_al_status(0x14), Some(EcatState::SafeOp));
        assert_eq!(EcatState::from_al_status(0x00), None);
        assert_eq!(EcatState::Op.to_string(), "OP");
    }

    #[test]
    fn test_apply_states_in_place() {
        let mut device = device_with_slaves(2);
        device.apply_states(&[0x08, 0x01, 0x14, 0x00]).unwrap();
        assert_eq!(device.slaves[0].ecat_state(), Some(EcatState::Op));
        assert_eq!(device.slaves[0].link_status, 1);
        assert!(device.slaves[1].has_error());
        assert!(device.apply_states(&[0x08]).is_err());
    }

    #[test]
    fn test_apply_crc() {
        let mut device = device_with_slaves(2);
        let mut data = CrcCounters::default().to_bytes().to_vec();
        data.extend_from_slice(&CrcCounters { ports: [1, 2, 3, 4] }.to_bytes());
        device.apply_crc(&data).unwrap();
        assert_eq!(device.slaves[1].crc.total(), 10);
        assert_eq!(device.encode_crc(), data);
    }

    #[test]
    fn test_frame_counters_layout() {
        let mut counters = FrameCounters::default();
        counters.record_cycle(FileTime(0x0102_0304_0506_0708));
        counters.record_acyclic();
        let bytes = counters.to_bytes();
        assert_eq!(bytes.len(), FrameCounters::SIZE);
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(FrameCounters::from_bytes(&bytes).unwrap(), counters);
    }

    #[test]
    fn test_identity_layout() {
        let identity = Identity::new(2, 0x0C20_3052, 0x0014_0000, 77);
        let bytes = identity.to_bytes();
        assert_eq!(&bytes[4..8], &0x0C20_3052u32.to_le_bytes());
        assert_eq!(Identity::from_bytes(&bytes).unwrap(), identity);
    }

    #[test]
    fn test_tree_lookup() {
        let tree = DeviceTree {
            devices: vec![device_with_slaves(3)],
        };
        assert_eq!(tree.slave_count(), 3);
        assert!(tree.device(1).is_some());
        assert!(tree.device(2).is_none());
        let device = tree.device_by_net_id(NetId::new(10, 0, 0, 1, 2, 1)).unwrap();
        assert_eq!(device.slave(1002).unwrap().name, "Term 1002");
        assert_eq!(device.master_addr().port, PORT_ETHERCAT_MASTER);
    }
}
