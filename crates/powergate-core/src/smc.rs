//! Register client for the hardware system management controller.
//!
//! Registers are addressed by a four-character key ([`FourCc`]) and carry a
//! fixed encoding ([`KeyInfo`]). Every operation builds one 80-byte
//! [`ParamStruct`], issues exactly one blocking call through the controller
//! transport, and validates both the transport return code and the result
//! byte embedded in the reply.
//!
//! ```text
//! SmcClient ──encode──▶ [80 bytes] ──SmcTransport──▶ controller
//!     ▲                                                  │
//!     └──────────decode + validate◀── [80 bytes] ◀───────┘
//! ```
//!
//! A client that never opened (absent controller) answers every operation
//! with [`SmcError::Unsupported`] without touching any transport.

pub mod device;
pub mod param;

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

pub use device::DeviceService;
pub use param::{PARAM_STRUCT_SIZE, ParamStruct};

/// Transport-level success code.
pub const KERN_SUCCESS: i32 = 0;

/// Generic transport failure (`kIOReturnError`).
pub const IO_RETURN_ERROR: i32 = 0xE000_02BC_u32 as i32;

/// Method selectors understood by the controller user client.
pub mod selector {
    pub const USER_CLIENT_OPEN: u32 = 0;
    pub const USER_CLIENT_CLOSE: u32 = 1;
    pub const HANDLE_EVENT: u32 = 2;
}

/// Errors from register operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SmcError {
    #[error("hardware controller is not available on this host")]
    Unsupported,

    #[error("controller reply is {actual} bytes, expected {expected}")]
    InvalidDataSize { expected: usize, actual: usize },

    #[error("controller call failed (kern_return {kern_return:#x}, smc result {smc_result:#04x})")]
    Native { kern_return: i32, smc_result: u8 },

    #[error("invalid register key {0:?}: expected four ASCII characters")]
    InvalidKey(String),
}

/// A four-character code packed big-endian into a `u32`.
///
/// Used both for register keys and for data type tags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc(u32);

/// Register key.
pub type SmcKey = FourCc;

impl FourCc {
    /// `ui8 `: unsigned 8-bit integer.
    pub const UI8: FourCc = FourCc::new(*b"ui8 ");
    /// `hex_`: raw bytes.
    pub const HEX: FourCc = FourCc::new(*b"hex_");

    pub const fn new(code: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(code))
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl FromStr for FourCc {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| SmcError::InvalidKey(s.to_string()))?;
        if !bytes.iter().all(u8::is_ascii) {
            return Err(SmcError::InvalidKey(s.to_string()));
        }
        Ok(Self::new(bytes))
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.bytes() {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc(\"{self}\")")
    }
}

/// Encoding of a register: declared size, type tag, attribute bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyInfo {
    pub data_size: u32,
    pub data_type: FourCc,
    pub attributes: u8,
}

impl KeyInfo {
    /// Whether this encoding is a single unsigned byte.
    pub fn is_u8(&self) -> bool {
        self.data_type == FourCc::UI8 && self.data_size == 1
    }
}

/// A register value interpreted per its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    U8(u8),
    Hex(Vec<u8>),
}

impl RegisterValue {
    /// Interpret exactly `info.data_size` bytes of `payload`.
    pub fn decode(info: &KeyInfo, payload: &[u8]) -> Result<Self, SmcError> {
        let size = info.data_size as usize;
        if size > payload.len() {
            return Err(SmcError::InvalidDataSize {
                expected: size,
                actual: payload.len(),
            });
        }
        if info.is_u8() {
            Ok(Self::U8(payload[0]))
        } else {
            Ok(Self::Hex(payload[..size].to_vec()))
        }
    }
}

/// One blocking method call into the controller.
///
/// Returns the output structure bytes, or the transport return code on
/// failure.
pub trait SmcTransport: Send + Sync {
    fn call_method(&self, selector: u32, input: &[u8]) -> Result<Vec<u8>, i32>;
}

/// Resolves the controller service to a transport, once per process.
pub trait SmcService {
    /// Returns `None` when the controller is absent on this host.
    fn connect(&self) -> Option<Box<dyn SmcTransport>>;
}

/// Client for the controller's register protocol.
pub struct SmcClient {
    transport: Option<Box<dyn SmcTransport>>,
}

impl Default for SmcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SmcClient {
    /// A client that is not yet connected.
    pub fn new() -> Self {
        Self { transport: None }
    }

    /// Resolve the controller service and open a user client.
    ///
    /// Fails closed: on any failure the client stays unopened and every
    /// operation reports [`SmcError::Unsupported`].
    pub fn open(&mut self, service: &dyn SmcService) -> bool {
        if self.transport.is_some() {
            return true;
        }

        if !param::validate_layout() {
            tracing::error!("parameter structure layout mismatch, refusing to open controller");
            return false;
        }

        let Some(transport) = service.connect() else {
            warn!("hardware controller service not found");
            return false;
        };

        if let Err(kern_return) = transport.call_method(selector::USER_CLIENT_OPEN, &[]) {
            warn!(kern_return, "failed to open controller user client");
            return false;
        }

        debug!("hardware controller opened");
        self.transport = Some(transport);
        true
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Release the controller. Later operations report `Unsupported`.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(kern_return) = transport.call_method(selector::USER_CLIENT_CLOSE, &[]) {
                warn!(kern_return, "failed to close controller user client");
            }
            debug!("hardware controller closed");
        }
    }

    /// Query the encoding of `key`.
    pub fn get_key_info(&self, key: SmcKey) -> Result<KeyInfo, SmcError> {
        let reply = self.call(&ParamStruct::key_info_request(key))?;
        Ok(reply.key_info)
    }

    pub fn read_u8(&self, key: SmcKey) -> Result<u8, SmcError> {
        let reply = self.call(&ParamStruct::read_request(key, 1))?;
        Ok(reply.payload[0])
    }

    pub fn write_u8(&self, key: SmcKey, value: u8) -> Result<(), SmcError> {
        self.call(&ParamStruct::write_u8_request(key, value))?;
        Ok(())
    }

    /// Read a register of any encoding, using its declared size.
    pub fn read_value(&self, key: SmcKey) -> Result<RegisterValue, SmcError> {
        let info = self.get_key_info(key)?;
        if info.data_size as usize > param::PAYLOAD_LEN {
            return Err(SmcError::InvalidDataSize {
                expected: param::PAYLOAD_LEN,
                actual: info.data_size as usize,
            });
        }
        let reply = self.call(&ParamStruct::read_request(key, info.data_size))?;
        RegisterValue::decode(&info, &reply.payload)
    }

    fn call(&self, params: &ParamStruct) -> Result<ParamStruct, SmcError> {
        let transport = self.transport.as_ref().ok_or(SmcError::Unsupported)?;

        let output = transport
            .call_method(selector::HANDLE_EVENT, &params.encode())
            .map_err(|kern_return| SmcError::Native {
                kern_return,
                smc_result: 0,
            })?;

        let reply = ParamStruct::decode(&output)?;
        if reply.result != param::RESULT_SUCCESS {
            return Err(SmcError::Native {
                kern_return: KERN_SUCCESS,
                smc_result: reply.result,
            });
        }
        Ok(reply)
    }
}

impl Drop for SmcClient {
    fn drop(&mut self) {
        self.close();
    }
}
