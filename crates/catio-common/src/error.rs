//! Error taxonomy and ADS return codes.

use thiserror::Error;

/// ADS return codes carried in the AMS header error field and in the
/// result field of every ADS response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdsErrorCode {
    /// No error (0x000).
    NoError,
    /// Target port not found, ADS server not started (0x006).
    TargetPortNotFound,
    /// Target machine not found, no route (0x007).
    TargetMachineNotFound,
    /// Unknown command id (0x008).
    UnknownCommand,
    /// General device error (0x700).
    DeviceError,
    /// Service not supported by the server (0x701).
    ServiceNotSupported,
    /// Invalid index group (0x702).
    InvalidGroup,
    /// Invalid index offset (0x703).
    InvalidOffset,
    /// Reading or writing not permitted (0x704).
    InvalidAccess,
    /// Parameter size not correct (0x705).
    InvalidSize,
    /// Invalid data values (0x706).
    InvalidData,
    /// Device is not ready to operate (0x707).
    NotReady,
    /// Device is busy (0x708).
    Busy,
    /// Invalid operating system context (0x709).
    InvalidContext,
    /// Insufficient memory (0x70A).
    NoMemory,
    /// Invalid parameter values (0x70B).
    InvalidParameter,
    /// Not found (0x70C).
    NotFound,
    /// Symbol not found (0x710).
    SymbolNotFound,
    /// Invalid state (0x712).
    InvalidState,
    /// Transmission mode not supported (0x713).
    TransModeNotSupported,
    /// Notification handle is invalid (0x714).
    NotifyHandleInvalid,
    /// No more handles available (0x716).
    NoMoreHandles,
    /// Device has a timeout (0x719).
    Timeout,
    /// Interface query failed (0x71A).
    NoInterface,
    /// Wrong interface requested (0x71B).
    InvalidInterface,
    /// Any code without a dedicated variant.
    Other(u32),
}

impl AdsErrorCode {
    /// Parse a return code from its wire value.
    #[must_use]
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x000 => Self::NoError,
            0x006 => Self::TargetPortNotFound,
            0x007 => Self::TargetMachineNotFound,
            0x008 => Self::UnknownCommand,
            0x700 => Self::DeviceError,
            0x701 => Self::ServiceNotSupported,
            0x702 => Self::InvalidGroup,
            0x703 => Self::InvalidOffset,
            0x704 => Self::InvalidAccess,
            0x705 => Self::InvalidSize,
            0x706 => Self::InvalidData,
            0x707 => Self::NotReady,
            0x708 => Self::Busy,
            0x709 => Self::InvalidContext,
            0x70A => Self::NoMemory,
            0x70B => Self::InvalidParameter,
            0x70C => Self::NotFound,
            0x710 => Self::SymbolNotFound,
            0x712 => Self::InvalidState,
            0x713 => Self::TransModeNotSupported,
            0x714 => Self::NotifyHandleInvalid,
            0x716 => Self::NoMoreHandles,
            0x719 => Self::Timeout,
            0x71A => Self::NoInterface,
            0x71B => Self::InvalidInterface,
            other => Self::Other(other),
        }
    }

    /// Wire value of this return code.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::NoError => 0x000,
            Self::TargetPortNotFound => 0x006,
            Self::TargetMachineNotFound => 0x007,
            Self::UnknownCommand => 0x008,
            Self::DeviceError => 0x700,
            Self::ServiceNotSupported => 0x701,
            Self::InvalidGroup => 0x702,
            Self::InvalidOffset => 0x703,
            Self::InvalidAccess => 0x704,
            Self::InvalidSize => 0x705,
            Self::InvalidData => 0x706,
            Self::NotReady => 0x707,
            Self::Busy => 0x708,
            Self::InvalidContext => 0x709,
            Self::NoMemory => 0x70A,
            Self::InvalidParameter => 0x70B,
            Self::NotFound => 0x70C,
            Self::SymbolNotFound => 0x710,
            Self::InvalidState => 0x712,
            Self::TransModeNotSupported => 0x713,
            Self::NotifyHandleInvalid => 0x714,
            Self::NoMoreHandles => 0x716,
            Self::Timeout => 0x719,
            Self::NoInterface => 0x71A,
            Self::InvalidInterface => 0x71B,
            Self::Other(value) => value,
        }
    }

    /// Returns true for the success code.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::NoError
    }
}

impl From<u32> for AdsErrorCode {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl std::fmt::Display for AdsErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NoError => "no error",
            Self::TargetPortNotFound => "target port not found",
            Self::TargetMachineNotFound => "target machine not found",
            Self::UnknownCommand => "unknown command",
            Self::DeviceError => "device error",
            Self::ServiceNotSupported => "service not supported",
            Self::InvalidGroup => "invalid index group",
            Self::InvalidOffset => "invalid index offset",
            Self::InvalidAccess => "invalid access",
            Self::InvalidSize => "invalid size",
            Self::InvalidData => "invalid data",
            Self::NotReady => "device not ready",
            Self::Busy => "device busy",
            Self::InvalidContext => "invalid context",
            Self::NoMemory => "out of memory",
            Self::InvalidParameter => "invalid parameter",
            Self::NotFound => "not found",
            Self::SymbolNotFound => "symbol not found",
            Self::InvalidState => "invalid state",
            Self::TransModeNotSupported => "transmission mode not supported",
            Self::NotifyHandleInvalid => "notification handle invalid",
            Self::NoMoreHandles => "no more handles",
            Self::Timeout => "device timeout",
            Self::NoInterface => "no interface",
            Self::InvalidInterface => "invalid interface",
            Self::Other(_) => "unknown error",
        };
        write!(f, "{text} ({:#x})", self.as_u32())
    }
}

/// Errors raised by the ADS protocol engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdsError {
    /// Malformed envelope or header; the connection must be closed.
    #[error("framing error: {0}")]
    Framing(String),

    /// The peer answered with a non-zero ADS return code.
    #[error("ADS error: {0}")]
    Protocol(AdsErrorCode),

    /// Connection refused, reset or closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response or frame completion within the configured time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The connection or notification path is not established yet.
    #[error("not ready: {0}")]
    NotReady(String),

    /// A payload could not be decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration or address parsing error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid connection state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl AdsError {
    /// ADS return code a server answers with when this error is hit while
    /// handling a request.
    #[must_use]
    pub fn error_code(&self) -> AdsErrorCode {
        match self {
            Self::Protocol(code) => *code,
            Self::InvalidPayload(_) | Self::Framing(_) => AdsErrorCode::InvalidSize,
            Self::Timeout(_) => AdsErrorCode::Timeout,
            Self::NotReady(_) => AdsErrorCode::NotReady,
            Self::Config(_) => AdsErrorCode::InvalidParameter,
            Self::Transport(_) | Self::InvalidStateTransition { .. } => AdsErrorCode::DeviceError,
        }
    }

    /// Returns true if the connection can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::Transport(_))
    }
}

impl From<AdsErrorCode> for AdsError {
    fn from(code: AdsErrorCode) -> Self {
        Self::Protocol(code)
    }
}

impl From<std::io::Error> for AdsError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::config::ConfigError> for AdsError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience type alias for ADS operations.
pub type AdsResult<T> = Result<T, AdsError>;
