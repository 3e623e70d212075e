//! CoE object dictionaries served over index group 0xF302.

use crate::device::Identity;
use crate::index;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use catio_common::net_id::AmsAddr;
use std::collections::{BTreeMap, HashMap};

/// Identity object.
pub const OBJ_IDENTITY: u16 = 0x1018;
/// Manufacturer device name.
pub const OBJ_DEVICE_NAME: u16 = 0x1008;

/// Objects of one CoE node, keyed by index and subindex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDictionary {
    objects: BTreeMap<(u16, u8), Vec<u8>>,
}

impl ObjectDictionary {
    /// Dictionary with the identity and device name objects.
    #[must_use]
    pub fn for_node(name: &str, identity: &Identity) -> Self {
        let mut dict = Self::default();
        dict.insert(OBJ_DEVICE_NAME, 0, name.as_bytes().to_vec());
        dict.insert(OBJ_IDENTITY, 0, vec![4]);
        for (subindex, value) in (1u8..).zip(identity.fields()) {
            dict.insert(OBJ_IDENTITY, subindex, value.to_le_bytes().to_vec());
        }
        dict
    }

    /// Store an object entry.
    pub fn insert(&mut self, index: u16, subindex: u8, data: Vec<u8>) {
        self.objects.insert((index, subindex), data);
    }

    /// Object entry data.
    #[must_use]
    pub fn get(&self, index: u16, subindex: u8) -> Option<&[u8]> {
        self.objects.get(&(index, subindex)).map(Vec::as_slice)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the dictionary holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Every CoE node the server answers for, keyed by AMS endpoint.
///
/// Slaves are addressed with their EtherCAT address as AMS port, the
/// master with port 0xFFFF.
#[derive(Debug, Clone, Default)]
pub struct CoeStore {
    nodes: HashMap<AmsAddr, ObjectDictionary>,
}

impl CoeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    pub fn insert(&mut self, addr: AmsAddr, dict: ObjectDictionary) {
        self.nodes.insert(addr, dict);
    }

    /// Returns true if `addr` is a known node.
    #[must_use]
    pub fn contains(&self, addr: &AmsAddr) -> bool {
        self.nodes.contains_key(addr)
    }

    /// Read up to `length` bytes of the object addressed by `offset`.
    pub fn read(&self, addr: &AmsAddr, offset: u32, length: usize) -> AdsResult<Vec<u8>> {
        let dict = self
            .nodes
            .get(addr)
            .ok_or(AdsError::Protocol(AdsErrorCode::TargetPortNotFound))?;
        let (index, subindex) = index::coe_address(offset);
        let data = dict
            .get(index, subindex)
            .ok_or(AdsError::Protocol(AdsErrorCode::NotFound))?;
        Ok(data[..data.len().min(length)].to_vec())
    }

    /// Overwrite an existing object entry.
    pub fn write(&mut self, addr: &AmsAddr, offset: u32, data: &[u8]) -> AdsResult<()> {
        let dict = self
            .nodes
            .get_mut(addr)
            .ok_or(AdsError::Protocol(AdsErrorCode::TargetPortNotFound))?;
        let key = index::coe_address(offset);
        match dict.objects.get_mut(&key) {
            Some(entry) => {
                *entry = data.to_vec();
                Ok(())
            }
            None => Err(AdsError::Protocol(AdsErrorCode::NotFound)),
        }
    }
}
