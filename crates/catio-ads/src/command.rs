//! ADS command catalog and per-command payload layouts.
//!
//! Every request and response payload has an explicit struct with an
//! `encode`/`decode` pair implementing [`Payload`].

use crate::codec::{ByteReader, MAX_FRAME_SIZE};
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use std::time::Duration;

/// ADS command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    /// Reserved (0).
    Invalid = 0,
    /// Read device name and version (1).
    ReadDeviceInfo = 1,
    /// Read by index group/offset (2).
    Read = 2,
    /// Write by index group/offset (3).
    Write = 3,
    /// Read ADS and device state (4).
    ReadState = 4,
    /// Change ADS and device state (5).
    WriteControl = 5,
    /// Create a notification handle (6).
    AddNotification = 6,
    /// Release a notification handle (7).
    DeleteNotification = 7,
    /// Unsolicited notification stream (8).
    DeviceNotification = 8,
    /// Write then read in one exchange (9).
    ReadWrite = 9,
}

/// Shape of the response a command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Result code plus server-computed data.
    Variable,
    /// Result code only.
    Acknowledge,
    /// No response at all.
    None,
}

impl CommandId {
    /// Parse a command id.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::ReadDeviceInfo),
            2 => Some(Self::Read),
            3 => Some(Self::Write),
            4 => Some(Self::ReadState),
            5 => Some(Self::WriteControl),
            6 => Some(Self::AddNotification),
            7 => Some(Self::DeleteNotification),
            8 => Some(Self::DeviceNotification),
            9 => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// What a peer answers to this command with.
    #[must_use]
    pub fn response_kind(self) -> ResponseKind {
        match self {
            Self::Read
            | Self::ReadWrite
            | Self::ReadDeviceInfo
            | Self::ReadState
            | Self::AddNotification => ResponseKind::Variable,
            Self::Write | Self::WriteControl | Self::DeleteNotification => {
                ResponseKind::Acknowledge
            }
            Self::DeviceNotification | Self::Invalid => ResponseKind::None,
        }
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Invalid => "Invalid",
            Self::ReadDeviceInfo => "ReadDeviceInfo",
            Self::Read => "Read",
            Self::Write => "Write",
            Self::ReadState => "ReadState",
            Self::WriteControl => "WriteControl",
            Self::AddNotification => "AddNotification",
            Self::DeleteNotification => "DeleteNotification",
            Self::DeviceNotification => "DeviceNotification",
            Self::ReadWrite => "ReadWrite",
        };
        f.write_str(name)
    }
}

/// ADS state machine states reported by ReadState.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum AdsState {
    Invalid = 0,
    Idle = 1,
    Reset = 2,
    Init = 3,
    Start = 4,
    Run = 5,
    Stop = 6,
    SaveConfig = 7,
    LoadConfig = 8,
    PowerFailure = 9,
    PowerGood = 10,
    Error = 11,
    Shutdown = 12,
    Suspend = 13,
    Resume = 14,
    Config = 15,
    Reconfig = 16,
}

impl AdsState {
    /// Parse a state value.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Invalid,
            1 => Self::Idle,
            2 => Self::Reset,
            3 => Self::Init,
            4 => Self::Start,
            5 => Self::Run,
            6 => Self::Stop,
            7 => Self::SaveConfig,
            8 => Self::LoadConfig,
            9 => Self::PowerFailure,
            10 => Self::PowerGood,
            11 => Self::Error,
            12 => Self::Shutdown,
            13 => Self::Suspend,
            14 => Self::Resume,
            15 => Self::Config,
            16 => Self::Reconfig,
            _ => return None,
        })
    }
}

/// When the server generates notification samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TransmissionMode {
    /// No transmission.
    NoTrans = 0,
    /// Client polls cyclically.
    ClientCycle = 1,
    /// Client polls on change.
    ClientOnChange = 2,
    /// Server samples every cycle.
    ServerCycle = 3,
    /// Server samples only when the value changed.
    ServerOnChange = 4,
}

impl TransmissionMode {
    /// Parse a mode value.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::NoTrans),
            1 => Some(Self::ClientCycle),
            2 => Some(Self::ClientOnChange),
            3 => Some(Self::ServerCycle),
            4 => Some(Self::ServerOnChange),
            _ => None,
        }
    }
}

/// Explicit encode/decode pair for one payload layout.
pub trait Payload: Sized {
    /// Serialize to the wire form.
    fn encode(&self) -> Vec<u8>;

    /// Parse from the wire form.
    fn decode(bytes: &[u8]) -> AdsResult<Self>;
}

/// Turn a response result field into an error unless it is zero.
pub fn check_result(result: AdsErrorCode) -> AdsResult<()> {
    if result.is_ok() {
        Ok(())
    } else {
        Err(AdsError::Protocol(result))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn put_sized(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Read request: 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Index group.
    pub index_group: u32,
    /// Index offset.
    pub index_offset: u32,
    /// Bytes to read.
    pub length: u32,
}

impl Payload for ReadRequest {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        put_u32(&mut out, self.index_group);
        put_u32(&mut out, self.index_offset);
        put_u32(&mut out, self.length);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            index_group: r.u32()?,
            index_offset: r.u32()?,
            length: r.u32()?,
        })
    }
}

/// Read response: result, length, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    /// ADS result code.
    pub result: AdsErrorCode,
    /// Data read.
    pub data: Vec<u8>,
}

impl ReadResponse {
    /// Error response carrying no data.
    #[must_use]
    pub fn error(result: AdsErrorCode) -> Self {
        Self {
            result,
            data: Vec::new(),
        }
    }
}

impl Payload for ReadResponse {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        put_u32(&mut out, self.result.as_u32());
        put_sized(&mut out, &self.data);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            result: r.u32()?.into(),
            data: r.sized()?.to_vec(),
        })
    }
}

/// Write request: group, offset, length, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Index group.
    pub index_group: u32,
    /// Index offset.
    pub index_offset: u32,
    /// Data to write.
    pub data: Vec<u8>,
}

impl Payload for WriteRequest {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.data.len());
        put_u32(&mut out, self.index_group);
        put_u32(&mut out, self.index_offset);
        put_sized(&mut out, &self.data);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            index_group: r.u32()?,
            index_offset: r.u32()?,
            data: r.sized()?.to_vec(),
        })
    }
}

/// Result-only acknowledgement, shared by Write, WriteControl and
/// DeleteNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckResponse {
    /// ADS result code.
    pub result: AdsErrorCode,
}

impl Payload for AckResponse {
    fn encode(&self) -> Vec<u8> {
        self.result.as_u32().to_le_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        Ok(Self {
            result: ByteReader::new(bytes).u32()?.into(),
        })
    }
}

/// Write response.
pub type WriteResponse = AckResponse;
/// WriteControl response.
pub type WriteControlResponse = AckResponse;
/// DeleteNotification response.
pub type DeleteNotificationResponse = AckResponse;
/// ReadWrite response, same layout as Read.
pub type ReadWriteResponse = ReadResponse;

/// ReadWrite request: group, offset, read length, write length, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWriteRequest {
    /// Index group.
    pub index_group: u32,
    /// Index offset.
    pub index_offset: u32,
    /// Bytes expected back.
    pub read_length: u32,
    /// Data written before reading.
    pub data: Vec<u8>,
}

impl Payload for ReadWriteRequest {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.data.len());
        put_u32(&mut out, self.index_group);
        put_u32(&mut out, self.index_offset);
        put_u32(&mut out, self.read_length);
        put_sized(&mut out, &self.data);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            index_group: r.u32()?,
            index_offset: r.u32()?,
            read_length: r.u32()?,
            data: r.sized()?.to_vec(),
        })
    }
}

/// ReadState response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStateResponse {
    /// ADS result code.
    pub result: AdsErrorCode,
    /// ADS state.
    pub ads_state: AdsState,
    /// Device specific state.
    pub device_state: u16,
}

impl Payload for ReadStateResponse {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        put_u32(&mut out, self.result.as_u32());
        out.extend_from_slice(&(self.ads_state as u16).to_le_bytes());
        out.extend_from_slice(&self.device_state.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        let result = r.u32()?.into();
        let raw = r.u16()?;
        Ok(Self {
            result,
            ads_state: AdsState::from_u16(raw).ok_or_else(|| {
                AdsError::InvalidPayload(format!("unknown ADS state {raw}"))
            })?,
            device_state: r.u16()?,
        })
    }
}

/// Length of the device name field in ReadDeviceInfo.
pub const DEVICE_NAME_LEN: usize = 16;

/// ReadDeviceInfo response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDeviceInfoResponse {
    /// ADS result code.
    pub result: AdsErrorCode,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Device name, at most 16 bytes on the wire.
    pub name: String,
}

impl Payload for ReadDeviceInfoResponse {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + DEVICE_NAME_LEN);
        put_u32(&mut out, self.result.as_u32());
        out.push(self.major);
        out.push(self.minor);
        out.extend_from_slice(&self.build.to_le_bytes());
        let mut name = [0u8; DEVICE_NAME_LEN];
        let raw = self.name.as_bytes();
        let n = raw.len().min(DEVICE_NAME_LEN);
        name[..n].copy_from_slice(&raw[..n]);
        out.extend_from_slice(&name);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        let result = r.u32()?.into();
        let major = r.u8()?;
        let minor = r.u8()?;
        let build = r.u16()?;
        let raw = r.bytes(DEVICE_NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(Self {
            result,
            major,
            minor,
            build,
            name: String::from_utf8_lossy(&raw[..end]).into_owned(),
        })
    }
}

/// WriteControl request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteControlRequest {
    /// Requested ADS state.
    pub ads_state: AdsState,
    /// Requested device state.
    pub device_state: u16,
    /// Additional data.
    pub data: Vec<u8>,
}

impl Payload for WriteControlRequest {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        out.extend_from_slice(&(self.ads_state as u16).to_le_bytes());
        out.extend_from_slice(&self.device_state.to_le_bytes());
        put_sized(&mut out, &self.data);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        let raw = r.u16()?;
        let ads_state = AdsState::from_u16(raw)
            .ok_or(AdsError::Protocol(AdsErrorCode::InvalidParameter))?;
        Ok(Self {
            ads_state,
            device_state: r.u16()?,
            data: r.sized()?.to_vec(),
        })
    }
}

/// AddNotification request: 40 bytes, 16 of them reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddNotificationRequest {
    /// Index group.
    pub index_group: u32,
    /// Index offset.
    pub index_offset: u32,
    /// Bytes per sample.
    pub length: u32,
    /// Transmission mode.
    pub mode: TransmissionMode,
    /// Latest time after which a sample is pushed; whole milliseconds.
    pub max_delay: Duration,
    /// Sampling interval; whole milliseconds.
    pub cycle_time: Duration,
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

impl Payload for AddNotificationRequest {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        put_u32(&mut out, self.index_group);
        put_u32(&mut out, self.index_offset);
        put_u32(&mut out, self.length);
        put_u32(&mut out, self.mode as u32);
        put_u32(&mut out, duration_ms(self.max_delay));
        put_u32(&mut out, duration_ms(self.cycle_time));
        out.extend_from_slice(&[0u8; 16]);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        let index_group = r.u32()?;
        let index_offset = r.u32()?;
        let length = r.u32()?;
        let mode = TransmissionMode::from_u32(r.u32()?)
            .ok_or(AdsError::Protocol(AdsErrorCode::TransModeNotSupported))?;
        let max_delay = Duration::from_millis(u64::from(r.u32()?));
        let cycle_time = Duration::from_millis(u64::from(r.u32()?));
        r.skip(16)?;
        Ok(Self {
            index_group,
            index_offset,
            length,
            mode,
            max_delay,
            cycle_time,
        })
    }
}

/// AddNotification response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddNotificationResponse {
    /// ADS result code.
    pub result: AdsErrorCode,
    /// Server-assigned notification handle.
    pub handle: u32,
}

impl Payload for AddNotificationResponse {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        put_u32(&mut out, self.result.as_u32());
        put_u32(&mut out, self.handle);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            result: r.u32()?.into(),
            handle: r.u32()?,
        })
    }
}

/// DeleteNotification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteNotificationRequest {
    /// Handle to release.
    pub handle: u32,
}

impl Payload for DeleteNotificationRequest {
    fn encode(&self) -> Vec<u8> {
        self.handle.to_le_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        Ok(Self {
            handle: ByteReader::new(bytes).u32()?,
        })
    }
}

/// Sum-read: many reads in one ReadWrite on group 0xF080.
///
/// The index offset carries the item count, the write data is the list of
/// 12-byte read requests and the answer is one result code per item
/// followed by each item's data at its full requested length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SumReadRequest {
    /// Individual reads.
    pub items: Vec<ReadRequest>,
}

impl SumReadRequest {
    /// Bytes the answer occupies.
    #[must_use]
    pub fn read_length(&self) -> u32 {
        self.items
            .iter()
            .fold(0u32, |total, item| total.saturating_add(item.length.saturating_add(4)))
    }

    /// Wrap into the ReadWrite request sent on the wire.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_read_write(&self) -> ReadWriteRequest {
        ReadWriteRequest {
            index_group: crate::index::SUMUP_READ,
            index_offset: self.items.len() as u32,
            read_length: self.read_length(),
            data: self.items.iter().flat_map(|item| item.encode()).collect(),
        }
    }

    /// Parse the item list from ReadWrite write data.
    pub fn from_read_write(request: &ReadWriteRequest) -> AdsResult<Self> {
        let mut r = ByteReader::new(&request.data);
        let count = request.index_offset as usize;
        if r.remaining() != count * 12 {
            return Err(AdsError::Protocol(AdsErrorCode::InvalidSize));
        }
        let items = (0..count)
            .map(|_| ReadRequest::decode(r.bytes(12)?))
            .collect::<AdsResult<Vec<_>>>()?;
        let sum = Self { items };
        if sum.read_length() as usize > MAX_FRAME_SIZE {
            return Err(AdsError::Protocol(AdsErrorCode::InvalidSize));
        }
        Ok(sum)
    }

    /// Split answer data into one result per item.
    pub fn decode_results(&self, data: &[u8]) -> AdsResult<Vec<AdsResult<Vec<u8>>>> {
        let mut r = ByteReader::new(data);
        let codes = self
            .items
            .iter()
            .map(|_| r.u32().map(AdsErrorCode::from_u32))
            .collect::<AdsResult<Vec<_>>>()?;
        self.items
            .iter()
            .zip(codes)
            .map(|(item, code)| {
                let bytes = r.bytes(item.length as usize)?;
                Ok(check_result(code).map(|()| bytes.to_vec()))
            })
            .collect()
    }
}

/// Encode sum-read answer data from per-item results.
///
/// Failed items still occupy their requested length, zero filled.
#[must_use]
pub fn encode_sum_read_results(
    request: &SumReadRequest,
    results: &[AdsResult<Vec<u8>>],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(request.read_length() as usize);
    for result in results {
        let code = match result {
            Ok(_) => AdsErrorCode::NoError,
            Err(e) => e.error_code(),
        };
        put_u32(&mut out, code.as_u32());
    }
    for (item, result) in request.items.iter().zip(results) {
        let mut data = match result {
            Ok(bytes) => bytes.clone(),
            Err(_) => Vec::new(),
        };
        data.resize(item.length as usize, 0);
        out.extend_from_slice(&data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids() {
        for raw in 0..=9u16 {
            let id = CommandId::from_u16(raw).unwrap();
            assert_eq!(id as u16, raw);
        }
        assert_eq!(CommandId::from_u16(10), None);
        assert_eq!(CommandId::Read.response_kind(), ResponseKind::Variable);
        assert_eq!(CommandId::Write.response_kind(), ResponseKind::Acknowledge);
        assert_eq!(
            CommandId::DeviceNotification.response_kind(),
            ResponseKind::None
        );
    }

    #[test]
    fn test_read_response_layout() {
        let response = ReadResponse {
            result: AdsErrorCode::NoError,
            data: vec![0xAA, 0xBB],
        };
        let bytes = response.encode();
        assert_eq!(bytes, vec![0, 0, 0, 0, 2, 0, 0, 0, 0xAA, 0xBB]);
        assert_eq!(ReadResponse::decode(&bytes).unwrap(), response);

        let error = ReadResponse::error(AdsErrorCode::InvalidGroup).encode();
        assert_eq!(error, vec![0x02, 0x07, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_read_response_short_data_rejected() {
        let bytes = [0, 0, 0, 0, 4, 0, 0, 0, 1];
        assert!(matches!(
            ReadResponse::decode(&bytes),
            Err(AdsError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_add_notification_layout() {
        let request = AddNotificationRequest {
            index_group: 0xF020,
            index_offset: 4,
            length: 4,
            mode: TransmissionMode::ServerCycle,
            max_delay: Duration::from_millis(100),
            cycle_time: Duration::from_millis(10),
        };
        let bytes = request.encode();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[16..20], &100u32.to_le_bytes());
        assert_eq!(AddNotificationRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_unknown_transmission_mode() {
        let mut bytes = AddNotificationRequest {
            index_group: 1,
            index_offset: 0,
            length: 1,
            mode: TransmissionMode::ServerOnChange,
            max_delay: Duration::ZERO,
            cycle_time: Duration::ZERO,
        }
        .encode();
        bytes[12] = 42;
        assert_eq!(
            AddNotificationRequest::decode(&bytes),
            Err(AdsError::Protocol(AdsErrorCode::TransModeNotSupported))
        );
    }

    #[test]
    fn test_device_info_name_padding() {
        let info = ReadDeviceInfoResponse {
            result: AdsErrorCode::NoError,
            major: 3,
            minor: 1,
            build: 4024,
            name: "TCatIoServer".into(),
        };
        let bytes = info.encode();
        assert_eq!(bytes.len(), 24);
        assert_eq!(ReadDeviceInfoResponse::decode(&bytes).unwrap(), info);
    }

    #[test]
    fn test_read_state() {
        let state = ReadStateResponse {
            result: AdsErrorCode::NoError,
            ads_state: AdsState::Run,
            device_state: 0,
        };
        assert_eq!(ReadStateResponse::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn test_sum_read() {
        let request = SumReadRequest {
            items: vec![
                ReadRequest {
                    index_group: 0xF020,
                    index_offset: 0,
                    length: 2,
                },
                ReadRequest {
                    index_group: 0x9999,
                    index_offset: 0,
                    length: 4,
                },
            ],
        };
        let wire = request.to_read_write();
        assert_eq!(wire.index_offset, 2);
        assert_eq!(wire.read_length, 14);
        assert_eq!(SumReadRequest::from_read_write(&wire).unwrap(), request);

        let results = vec![
            Ok(vec![1, 2]),
            Err(AdsError::Protocol(AdsErrorCode::InvalidGroup)),
        ];
        let data = encode_sum_read_results(&request, &results);
        assert_eq!(data.len(), 14);

        let decoded = request.decode_results(&data).unwrap();
        assert_eq!(decoded[0], Ok(vec![1, 2]));
        assert_eq!(
            decoded[1],
            Err(AdsError::Protocol(AdsErrorCode::InvalidGroup))
        );
    }

    #[test]
    fn test_sum_read_rejects_oversized_items() {
        let request = SumReadRequest {
            items: vec![
                ReadRequest {
                    index_group: 0xF020,
                    index_offset: 0,
                    length: u32::MAX,
                },
                ReadRequest {
                    index_group: 0xF020,
                    index_offset: 0,
                    length: 8,
                },
            ],
        };
        let wire = request.to_read_write();
        assert_eq!(wire.read_length, u32::MAX);
        assert_eq!(
            SumReadRequest::from_read_write(&wire),
            Err(AdsError::Protocol(AdsErrorCode::InvalidSize))
        );
    }
}
