//! Server-side request dispatch.
//!
//! Requests are routed by target NetId: the server's own NetId reaches the
//! I/O server groups, a device NetId reaches that master's diagnostics on
//! port 0xFFFF or a slave's CoE objects on the slave's address. Bad input
//! is answered with the matching ADS code, never a panic.

use crate::broadcast::NotificationHub;
use crate::codec::{AmsFrame, AmsHeader};
use crate::command::{
    encode_sum_read_results, AckResponse, AddNotificationRequest, AddNotificationResponse,
    CommandId, DeleteNotificationRequest, Payload, ReadDeviceInfoResponse, ReadRequest,
    ReadResponse, ReadStateResponse, ReadWriteRequest, SumReadRequest, WriteControlRequest,
    WriteRequest,
};
use crate::device::{Device, Slave};
use crate::index;
use crate::server::{ServerState, SharedState};
use crate::symbols::{encode_symbol_upload, encode_upload_info2, SymbolHandles, UploadInfo};
use catio_common::config::Direction;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use catio_common::net_id::{AmsAddr, NetId, PORT_ETHERCAT_MASTER};
use std::sync::{Arc, PoisonError};
use tracing::{debug, trace};

/// Version reported by ReadDeviceInfo.
pub const VERSION: (u8, u8, u16) = (3, 1, 4024);

/// Addressed part of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The I/O server itself.
    Server,
    /// Diagnostics of the master with this NetId.
    Master(NetId),
    /// CoE node of one slave.
    Slave(NetId, u16),
}

impl Endpoint {
    /// Resolve the target of a request.
    pub fn route(state: &ServerState, target: AmsAddr) -> Result<Self, AdsErrorCode> {
        if target.net_id == state.net_id {
            return Ok(Self::Server);
        }
        let device = state
            .topology
            .tree
            .device_by_net_id(target.net_id)
            .ok_or(AdsErrorCode::TargetMachineNotFound)?;
        if target.port == PORT_ETHERCAT_MASTER {
            Ok(Self::Master(device.net_id))
        } else if device.slave(target.port).is_some() {
            Ok(Self::Slave(device.net_id, target.port))
        } else {
            Err(AdsErrorCode::TargetPortNotFound)
        }
    }
}

fn invalid_group() -> AdsError {
    AdsError::Protocol(AdsErrorCode::InvalidGroup)
}

fn region(group: u32) -> Option<Direction> {
    match group {
        index::IO_RW_I => Some(Direction::Input),
        index::IO_RW_Q => Some(Direction::Output),
        _ => None,
    }
}

/// Keep at most `length` bytes.
fn fit(mut data: Vec<u8>, length: usize) -> Vec<u8> {
    data.truncate(length);
    data
}

fn u16_list(values: impl Iterator<Item = u16>) -> Vec<u8> {
    values.flat_map(u16::to_le_bytes).collect()
}

/// Read `length` bytes of `group`/`offset` on `endpoint`.
///
/// Shared by request handling and notification sampling; handle-based
/// groups are resolved by the caller.
pub fn read_index(
    state: &ServerState,
    endpoint: &Endpoint,
    group: u32,
    offset: u32,
    length: usize,
) -> AdsResult<Vec<u8>> {
    match endpoint {
        Endpoint::Server => read_server(state, group, offset, length),
        Endpoint::Master(net_id) => {
            let device = state
                .topology
                .tree
                .device_by_net_id(*net_id)
                .ok_or(AdsError::Protocol(AdsErrorCode::TargetMachineNotFound))?;
            read_master(state, device, group, offset, length)
        }
        Endpoint::Slave(net_id, address) => {
            if group != index::COE_SDO {
                return Err(invalid_group());
            }
            state
                .topology
                .coe
                .read(&AmsAddr::new(*net_id, *address), offset, length)
        }
    }
}

fn read_server(state: &ServerState, group: u32, offset: u32, length: usize) -> AdsResult<Vec<u8>> {
    let topology = &state.topology;
    if let Some(direction) = region(group) {
        return Ok(topology
            .image
            .read(direction, offset as usize, length)?
            .to_vec());
    }

    #[allow(clippy::cast_possible_truncation)]
    let data = match group {
        index::IO_SIZE_I => (topology.image.size(Direction::Input) as u32)
            .to_le_bytes()
            .to_vec(),
        index::IO_SIZE_Q => (topology.image.size(Direction::Output) as u32)
            .to_le_bytes()
            .to_vec(),
        index::SYM_UPLOADINFO => state.upload_info().encode(),
        index::SYM_UPLOADINFO2 => encode_upload_info2(state.upload_info()),
        index::SYM_UPLOAD => {
            let upload = encode_symbol_upload(&topology.symbol_list());
            if length < upload.len() {
                return Err(AdsError::Protocol(AdsErrorCode::InvalidSize));
            }
            upload
        }
        index::IO_DEVICE_STATE_BASE => {
            if offset != index::IO_DEVICE_IDS {
                return Err(AdsError::Protocol(AdsErrorCode::InvalidOffset));
            }
            let ids = topology.tree.device_ids();
            let mut data = u16_list(std::iter::once(ids.len() as u16));
            data.extend(u16_list(ids.into_iter()));
            data
        }
        g if g > index::IO_DEVICE_STATE_BASE && g <= index::IO_DEVICE_STATE_BASE + 0x0FFF => {
            let id = (g - index::IO_DEVICE_STATE_BASE) as u16;
            let device = topology.tree.device(id).ok_or_else(invalid_group)?;
            match offset {
                index::IO_DEVICE_NAME => {
                    let mut name = device.name.as_bytes().to_vec();
                    name.push(0);
                    name
                }
                index::IO_DEVICE_NETID => device.net_id.octets().to_vec(),
                index::IO_DEVICE_TYPE => device.type_code.to_le_bytes().to_vec(),
                _ => return Err(AdsError::Protocol(AdsErrorCode::InvalidOffset)),
            }
        }
        _ => return Err(invalid_group()),
    };
    Ok(fit(data, length))
}

/// Slaves selected by a states/CRC offset: 0 means all, else one address.
fn select_slaves(device: &Device, offset: u32) -> AdsResult<Vec<&Slave>> {
    if offset == 0 {
        return Ok(device.slaves.iter().collect());
    }
    u16::try_from(offset)
        .ok()
        .and_then(|address| device.slave(address))
        .map(|slave| vec![slave])
        .ok_or(AdsError::Protocol(AdsErrorCode::InvalidOffset))
}

fn read_master(
    state: &ServerState,
    device: &Device,
    group: u32,
    offset: u32,
    length: usize,
) -> AdsResult<Vec<u8>> {
    #[allow(clippy::cast_possible_truncation)]
    let data = match group {
        index::MASTER_STATE => device.master_state.to_le_bytes().to_vec(),
        index::SLAVE_COUNT => (device.slaves.len() as u32).to_le_bytes().to_vec(),
        index::SLAVE_ADDRESSES => u16_list(device.slaves.iter().map(|s| s.address)),
        index::SLAVE_IDENTITY => u16::try_from(offset)
            .ok()
            .and_then(|address| device.slave(address))
            .map(|slave| slave.identity.to_bytes().to_vec())
            .ok_or(AdsError::Protocol(AdsErrorCode::InvalidOffset))?,
        index::SLAVE_STATES => select_slaves(device, offset)?
            .into_iter()
            .flat_map(|s| [s.state, s.link_status])
            .collect(),
        index::SLAVE_CRC => select_slaves(device, offset)?
            .into_iter()
            .flat_map(|s| s.crc.to_bytes())
            .collect(),
        index::FRAME_COUNTERS => device.frame_counters.to_bytes().to_vec(),
        index::COE_SDO => {
            return state
                .topology
                .coe
                .read(&device.master_addr(), offset, length)
        }
        _ => return Err(invalid_group()),
    };
    Ok(fit(data, length))
}

fn read_u32(data: &[u8]) -> AdsResult<u32> {
    data.get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(AdsError::Protocol(AdsErrorCode::InvalidSize))
}

/// Per-connection request handler.
#[derive(Debug)]
pub struct Dispatcher {
    connection: u64,
    state: SharedState,
    hub: Arc<NotificationHub>,
    handles: SymbolHandles,
}

impl Dispatcher {
    /// Create a handler for one connection.
    #[must_use]
    pub fn new(connection: u64, state: SharedState, hub: Arc<NotificationHub>) -> Self {
        Self {
            connection,
            state,
            hub,
            handles: SymbolHandles::new(),
        }
    }

    /// Live symbol handles of this connection.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Answer one request frame.
    ///
    /// Returns `None` for frames that take no response.
    pub fn handle(&mut self, frame: &AmsFrame) -> Option<(AmsHeader, Vec<u8>)> {
        let header = &frame.header;
        if header.is_response() {
            trace!(invoke_id = header.invoke_id, "Ignoring response frame");
            return None;
        }
        let Some(command) = header.command() else {
            debug!(command = header.command_id, "Unsupported command");
            return Some((header.response(AdsErrorCode::ServiceNotSupported), Vec::new()));
        };
        if matches!(command, CommandId::Invalid | CommandId::DeviceNotification) {
            return None;
        }

        let endpoint = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            Endpoint::route(&state, header.target)
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(code) => {
                debug!(target = %header.target, %code, "Unroutable request");
                return Some((header.response(code), Vec::new()));
            }
        };

        trace!(%command, invoke_id = header.invoke_id, ?endpoint, "Dispatching request");
        let payload = self.dispatch(command, endpoint, header, &frame.payload);
        Some((header.response(AdsErrorCode::NoError), payload))
    }

    fn dispatch(
        &mut self,
        command: CommandId,
        endpoint: Endpoint,
        header: &AmsHeader,
        payload: &[u8],
    ) -> Vec<u8> {
        match command {
            CommandId::Read => {
                let response = match ReadRequest::decode(payload)
                    .and_then(|req| self.read(&endpoint, &req))
                {
                    Ok(data) => ReadResponse {
                        result: AdsErrorCode::NoError,
                        data,
                    },
                    Err(e) => ReadResponse::error(e.error_code()),
                };
                response.encode()
            }
            CommandId::Write => {
                let result = WriteRequest::decode(payload).and_then(|req| self.write(&endpoint, &req));
                ack(result)
            }
            CommandId::ReadWrite => {
                let response = match ReadWriteRequest::decode(payload)
                    .and_then(|req| self.read_write(&endpoint, &req))
                {
                    Ok(data) => ReadResponse {
                        result: AdsErrorCode::NoError,
                        data,
                    },
                    Err(e) => ReadResponse::error(e.error_code()),
                };
                response.encode()
            }
            CommandId::ReadState => {
                let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
                ReadStateResponse {
                    result: AdsErrorCode::NoError,
                    ads_state: state.ads_state,
                    device_state: state.device_state,
                }
                .encode()
            }
            CommandId::ReadDeviceInfo => {
                let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
                let name = match endpoint {
                    Endpoint::Server => state.device_name.clone(),
                    Endpoint::Master(net_id) | Endpoint::Slave(net_id, _) => state
                        .topology
                        .tree
                        .device_by_net_id(net_id)
                        .map(|d| d.name.clone())
                        .unwrap_or_default(),
                };
                let (major, minor, build) = VERSION;
                ReadDeviceInfoResponse {
                    result: AdsErrorCode::NoError,
                    major,
                    minor,
                    build,
                    name,
                }
                .encode()
            }
            CommandId::WriteControl => {
                let result = WriteControlRequest::decode(payload).map(|req| {
                    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                    state.ads_state = req.ads_state;
                    state.device_state = req.device_state;
                    debug!(ads_state = ?req.ads_state, "State changed by WriteControl");
                });
                ack(result)
            }
            CommandId::AddNotification => {
                let response = match AddNotificationRequest::decode(payload)
                    .and_then(|req| self.add_notification(endpoint, header, req))
                {
                    Ok(handle) => AddNotificationResponse {
                        result: AdsErrorCode::NoError,
                        handle,
                    },
                    Err(e) => AddNotificationResponse {
                        result: e.error_code(),
                        handle: 0,
                    },
                };
                response.encode()
            }
            CommandId::DeleteNotification => {
                let result = DeleteNotificationRequest::decode(payload)
                    .and_then(|req| self.hub.unsubscribe(self.connection, req.handle));
                ack(result)
            }
            CommandId::Invalid | CommandId::DeviceNotification => Vec::new(),
        }
    }

    fn read(&self, endpoint: &Endpoint, request: &ReadRequest) -> AdsResult<Vec<u8>> {
        let length = request.length as usize;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if *endpoint == Endpoint::Server && request.index_group == index::SYM_VALBYHND {
            let entry = self.handles.resolve(request.index_offset)?;
            let value = read_index(
                &state,
                endpoint,
                entry.index_group,
                entry.index_offset,
                entry.size as usize,
            )?;
            return Ok(fit(value, length));
        }
        read_index(&state, endpoint, request.index_group, request.index_offset, length)
    }

    fn write(&mut self, endpoint: &Endpoint, request: &WriteRequest) -> AdsResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *endpoint {
            Endpoint::Server => match request.index_group {
                index::SYM_RELEASEHND => self.handles.release(read_u32(&request.data)?),
                index::SYM_VALBYHND => {
                    let entry = self.handles.resolve(request.index_offset)?;
                    if request.data.len() != entry.size as usize {
                        return Err(AdsError::Protocol(AdsErrorCode::InvalidSize));
                    }
                    let direction = region(entry.index_group).ok_or_else(invalid_group)?;
                    state
                        .topology
                        .image
                        .write(direction, entry.index_offset as usize, &request.data)
                }
                group => match region(group) {
                    Some(direction) => state.topology.image.write(
                        direction,
                        request.index_offset as usize,
                        &request.data,
                    ),
                    None if read_server(&state, group, request.index_offset, 0).is_ok() => {
                        Err(AdsError::Protocol(AdsErrorCode::InvalidAccess))
                    }
                    None => Err(invalid_group()),
                },
            },
            Endpoint::Master(net_id) => {
                if request.index_group != index::COE_SDO {
                    return Err(AdsError::Protocol(AdsErrorCode::InvalidAccess));
                }
                state.topology.coe.write(
                    &AmsAddr::new(net_id, PORT_ETHERCAT_MASTER),
                    request.index_offset,
                    &request.data,
                )
            }
            Endpoint::Slave(net_id, address) => {
                if request.index_group != index::COE_SDO {
                    return Err(invalid_group());
                }
                state.topology.coe.write(
                    &AmsAddr::new(net_id, address),
                    request.index_offset,
                    &request.data,
                )
            }
        }
    }

    fn read_write(&mut self, endpoint: &Endpoint, request: &ReadWriteRequest) -> AdsResult<Vec<u8>> {
        let read_length = request.read_length as usize;
        match (endpoint, request.index_group) {
            (Endpoint::Server, index::SYM_HNDBYNAME) => {
                if read_length < 4 {
                    return Err(AdsError::Protocol(AdsErrorCode::InvalidSize));
                }
                let name = symbol_name(&request.data);
                let entry = {
                    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
                    state
                        .topology
                        .symbol(&name)
                        .cloned()
                        .ok_or(AdsError::Protocol(AdsErrorCode::SymbolNotFound))?
                };
                let handle = self.handles.allocate(entry)?;
                debug!(connection = self.connection, %name, handle, "Symbol handle allocated");
                Ok(handle.to_le_bytes().to_vec())
            }
            (_, index::SUMUP_READ) => {
                let sum = SumReadRequest::from_read_write(request)?;
                let results: Vec<AdsResult<Vec<u8>>> = sum
                    .items
                    .iter()
                    .map(|item| self.read(endpoint, item))
                    .collect();
                let data = encode_sum_read_results(&sum, &results);
                Ok(fit(data, read_length))
            }
            (_, group) => {
                let write = WriteRequest {
                    index_group: group,
                    index_offset: request.index_offset,
                    data: request.data.clone(),
                };
                self.write(endpoint, &write)?;
                self.read(
                    endpoint,
                    &ReadRequest {
                        index_group: group,
                        index_offset: request.index_offset,
                        length: request.read_length,
                    },
                )
            }
        }
    }

    fn add_notification(
        &self,
        endpoint: Endpoint,
        header: &AmsHeader,
        mut request: AddNotificationRequest,
    ) -> AdsResult<u32> {
        if endpoint == Endpoint::Server && request.index_group == index::SYM_VALBYHND {
            let entry = self.handles.resolve(request.index_offset)?;
            request.index_group = entry.index_group;
            request.index_offset = entry.index_offset;
        }
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            read_index(
                &state,
                &endpoint,
                request.index_group,
                request.index_offset,
                request.length as usize,
            )?;
        }
        self.hub
            .subscribe(self.connection, header.source, header.target, endpoint, request)
    }
}

/// Symbol name from handle request data, without trailing nulls.
fn symbol_name(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn ack(result: AdsResult<()>) -> Vec<u8> {
    AckResponse {
        result: match result {
            Ok(()) => AdsErrorCode::NoError,
            Err(e) => e.error_code(),
        },
    }
    .encode()
}

impl ServerState {
    /// Symbol count and upload length.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn upload_info(&self) -> UploadInfo {
        let symbols = self.topology.symbol_list();
        UploadInfo {
            symbol_count: symbols.len() as u32,
            symbol_length: encode_symbol_upload(&symbols).len() as u32,
        }
    }
}
