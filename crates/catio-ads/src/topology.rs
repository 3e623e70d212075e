//! Builds the served device tree, process image, symbols and CoE objects
//! from the terminal topology configuration.

use crate::coe::{CoeStore, ObjectDictionary};
use crate::device::{
    slave_address, CrcCounters, Device, DeviceTree, EcatState, FrameCounters, Identity, Slave,
};
use crate::image::ProcessImage;
use crate::index;
use crate::symbols::SymbolEntry;
use catio_common::config::{DeviceConfig, Direction, TerminalConfig, TopologyConfig};
use catio_common::net_id::{AmsAddr, PORT_ETHERCAT_MASTER};
use std::collections::BTreeMap;
use tracing::debug;

/// Symbol flag marking a persistent, readable variable.
pub const SYMBOL_FLAGS: u32 = 0x0008;

/// Product code the simulated master reports.
const MASTER_PRODUCT_CODE: u32 = 0x0000_0001;

/// Everything the I/O server serves.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Devices and slaves.
    pub tree: DeviceTree,
    /// Process data.
    pub image: ProcessImage,
    /// Channel symbols by name.
    pub symbols: BTreeMap<String, SymbolEntry>,
    /// CoE object dictionaries of masters and slaves.
    pub coe: CoeStore,
}

impl Topology {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &TopologyConfig) -> Self {
        config
            .devices
            .iter()
            .fold(TopologyBuilder::new(), |builder, device| builder.device(device))
            .build()
    }

    /// Symbol by name.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<&SymbolEntry> {
        self.symbols.get(name)
    }

    /// Symbols in name order.
    #[must_use]
    pub fn symbol_list(&self) -> Vec<SymbolEntry> {
        self.symbols.values().cloned().collect()
    }
}

/// Incremental topology builder.
///
/// Device ids count from 1, slave addresses from 1001 per device, and
/// channel offsets are packed per direction in declaration order.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    devices: Vec<Device>,
    symbols: BTreeMap<String, SymbolEntry>,
    coe: CoeStore,
    input_size: u32,
    output_size: u32,
}

impl TopologyBuilder {
    /// Start an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one device with its terminals.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn device(mut self, config: &DeviceConfig) -> Self {
        let id = self.devices.len() as u16 + 1;
        let identity = Identity::new(2, MASTER_PRODUCT_CODE, 0, u32::from(id));
        self.coe.insert(
            AmsAddr::new(config.net_id, PORT_ETHERCAT_MASTER),
            ObjectDictionary::for_node(&config.name, &identity),
        );

        let slaves = config
            .slaves
            .iter()
            .enumerate()
            .map(|(position, terminal)| {
                let address = slave_address(position);
                self.add_terminal(config, address, terminal)
            })
            .collect::<Vec<_>>();

        debug!(id, name = %config.name, slaves = slaves.len(), "Topology device added");
        self.devices.push(Device {
            id,
            name: config.name.clone(),
            type_code: index::DEVICE_TYPE_ETHERCAT,
            net_id: config.net_id,
            identity,
            slaves,
            frame_counters: FrameCounters::default(),
            master_state: EcatState::Op as u16,
        });
        self
    }

    fn add_terminal(&mut self, device: &DeviceConfig, address: u16, terminal: &TerminalConfig) -> Slave {
        let identity = Identity::new(
            terminal.vendor_id,
            terminal.product_code,
            terminal.revision,
            terminal.serial,
        );
        self.coe.insert(
            AmsAddr::new(device.net_id, address),
            ObjectDictionary::for_node(&terminal.name, &identity),
        );

        for channel in &terminal.channels {
            #[allow(clippy::cast_possible_truncation)]
            let size = channel.data_type.size() as u32;
            let (index_group, cursor) = match channel.direction {
                Direction::Input => (index::IO_RW_I, &mut self.input_size),
                Direction::Output => (index::IO_RW_Q, &mut self.output_size),
            };
            let name = format!("{}.{}.{}", device.name, terminal.name, channel.name);
            let entry = SymbolEntry {
                name: name.clone(),
                index_group,
                index_offset: *cursor,
                size,
                data_type: channel.data_type.code(),
                flags: SYMBOL_FLAGS,
                type_name: channel.data_type.type_name().to_string(),
                comment: format!("Term {address}"),
            };
            *cursor += size;
            self.symbols.insert(name, entry);
        }

        Slave {
            address,
            name: terminal.name.clone(),
            identity,
            state: EcatState::Op as u8,
            link_status: 0,
            crc: CrcCounters::default(),
        }
    }

    /// Finish and size the process image.
    #[must_use]
    pub fn build(self) -> Topology {
        Topology {
            tree: DeviceTree {
                devices: self.devices,
            },
            image: ProcessImage::new(self.input_size as usize, self.output_size as usize),
            symbols: self.symbols,
            coe: self.coe,
        }
    }
}
