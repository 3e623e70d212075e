//! AMS/ADS protocol engine for Beckhoff TwinCAT EtherCAT I/O servers.
//!
//! This crate provides:
//! - [`codec`] AMS/TCP framing and the AMS header
//! - [`command`] ADS command payloads and [`index`] group constants
//! - [`client`] a single-connection ADS client with one request in flight
//! - [`scan`] EtherCAT device tree discovery and diagnostics polling
//! - [`notification`] notification stream decoding, averaging and diffing
//! - [`server`] a simulated I/O server built from a [`topology`]
//! - [`route`] the UDP route service

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod coe;
pub mod command;
pub mod device;
pub mod dispatch;
pub mod image;
pub mod index;
pub mod notification;
pub mod route;
pub mod scan;
pub mod server;
pub mod symbols;
pub mod topology;

pub use client::{AdsClient, ClientOptions};
pub use codec::{AmsFrame, AmsHeader};
pub use command::{AdsState, CommandId, Payload, TransmissionMode};
pub use device::{Device, DeviceTree, EcatState, Identity, Slave};
pub use notification::{ChangeSet, FieldSpec, FieldValue, NotificationMonitor, NotificationReducer};
pub use scan::{discover, poll};
pub use server::{AdsServer, RunningServer, ServerState, SharedState};
pub use symbols::{SymbolEntry, SymbolTable};
pub use topology::{Topology, TopologyBuilder};
