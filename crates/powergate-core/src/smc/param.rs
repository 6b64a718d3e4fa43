//! Fixed-layout parameter structure exchanged with the hardware controller.
//!
//! The controller expects an 80-byte structure in host byte order:
//!
//! ```text
//! offset  size  field
//!      0     4  key (FourCC)
//!      4     6  version (major, minor, build, reserved, release u16)
//!     12    16  power-limit data
//!     28     4  key info: data size
//!     32     4  key info: data type (FourCC)
//!     36     1  key info: attributes (+3 padding)
//!     40     1  result
//!     41     1  status
//!     42     1  data8 (operation selector)
//!     44     4  data32
//!     48    32  payload bytes
//! ```

use super::{FourCc, KeyInfo, SmcError};

/// Byte stride of one parameter structure.
pub const PARAM_STRUCT_SIZE: usize = 80;

/// Size of the payload region.
pub const PAYLOAD_LEN: usize = 32;

/// Operation selector stored in `data8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    ReadKey = 5,
    WriteKey = 6,
    GetKeyInfo = 9,
}

/// Controller result code meaning success.
pub const RESULT_SUCCESS: u8 = 0x00;

/// Controller result code for an unknown key.
pub const RESULT_KEY_NOT_FOUND: u8 = 0x84;

mod offset {
    pub const KEY: usize = 0;
    pub const VERSION: usize = 4;
    pub const POWER_LIMIT: usize = 12;
    pub const INFO_SIZE: usize = 28;
    pub const INFO_TYPE: usize = 32;
    pub const INFO_ATTRIBUTES: usize = 36;
    pub const RESULT: usize = 40;
    pub const STATUS: usize = 41;
    pub const DATA8: usize = 42;
    pub const DATA32: usize = 44;
    pub const PAYLOAD: usize = 48;
}

/// Assert at compile time that a structure stride matches the controller's.
///
/// # Example
///
/// ```
/// use powergate_core::smc::param;
/// param::assert_stride::<80>();
/// ```
pub const fn assert_stride<const N: usize>() {
    assert!(
        N == PARAM_STRUCT_SIZE,
        "parameter structure stride must be exactly 80 bytes"
    );
}

const _: () = assert_stride::<{ offset::PAYLOAD + PAYLOAD_LEN }>();
const _: () = assert!(offset::VERSION + 6 <= offset::POWER_LIMIT);
const _: () = assert!(offset::POWER_LIMIT + 16 == offset::INFO_SIZE);

/// Decoded parameter structure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamStruct {
    pub key: FourCc,
    pub version: [u8; 6],
    pub power_limit: [u8; 16],
    pub key_info: KeyInfo,
    pub result: u8,
    pub status: u8,
    pub data8: u8,
    pub data32: u32,
    pub payload: [u8; PAYLOAD_LEN],
}

impl ParamStruct {
    /// Request for the encoding of `key`.
    pub fn key_info_request(key: FourCc) -> Self {
        Self {
            key,
            data8: Operation::GetKeyInfo as u8,
            ..Self::default()
        }
    }

    /// Request reading `size` bytes from `key`.
    pub fn read_request(key: FourCc, size: u32) -> Self {
        Self {
            key,
            key_info: KeyInfo {
                data_size: size,
                ..KeyInfo::default()
            },
            data8: Operation::ReadKey as u8,
            ..Self::default()
        }
    }

    /// Request writing a single byte to `key`.
    pub fn write_u8_request(key: FourCc, value: u8) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = value;
        Self {
            key,
            key_info: KeyInfo {
                data_size: 1,
                ..KeyInfo::default()
            },
            data8: Operation::WriteKey as u8,
            payload,
            ..Self::default()
        }
    }

    /// The operation selector, if it is one the controller understands.
    pub fn operation(&self) -> Option<Operation> {
        match self.data8 {
            5 => Some(Operation::ReadKey),
            6 => Some(Operation::WriteKey),
            9 => Some(Operation::GetKeyInfo),
            _ => None,
        }
    }

    pub fn encode(&self) -> [u8; PARAM_STRUCT_SIZE] {
        let mut buf = [0u8; PARAM_STRUCT_SIZE];
        put(&mut buf, offset::KEY, &self.key.as_u32().to_ne_bytes());
        put(&mut buf, offset::VERSION, &self.version);
        put(&mut buf, offset::POWER_LIMIT, &self.power_limit);
        put(&mut buf, offset::INFO_SIZE, &self.key_info.data_size.to_ne_bytes());
        put(
            &mut buf,
            offset::INFO_TYPE,
            &self.key_info.data_type.as_u32().to_ne_bytes(),
        );
        buf[offset::INFO_ATTRIBUTES] = self.key_info.attributes;
        buf[offset::RESULT] = self.result;
        buf[offset::STATUS] = self.status;
        buf[offset::DATA8] = self.data8;
        put(&mut buf, offset::DATA32, &self.data32.to_ne_bytes());
        put(&mut buf, offset::PAYLOAD, &self.payload);
        buf
    }

    /// Decode a structure, rejecting anything that is not exactly one stride.
    pub fn decode(data: &[u8]) -> Result<Self, SmcError> {
        if data.len() != PARAM_STRUCT_SIZE {
            return Err(SmcError::InvalidDataSize {
                expected: PARAM_STRUCT_SIZE,
                actual: data.len(),
            });
        }

        let mut version = [0u8; 6];
        version.copy_from_slice(&data[offset::VERSION..offset::VERSION + 6]);
        let mut power_limit = [0u8; 16];
        power_limit.copy_from_slice(&data[offset::POWER_LIMIT..offset::POWER_LIMIT + 16]);
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&data[offset::PAYLOAD..]);

        Ok(Self {
            key: FourCc::from_u32(u32_at(data, offset::KEY)),
            version,
            power_limit,
            key_info: KeyInfo {
                data_size: u32_at(data, offset::INFO_SIZE),
                data_type: FourCc::from_u32(u32_at(data, offset::INFO_TYPE)),
                attributes: data[offset::INFO_ATTRIBUTES],
            },
            result: data[offset::RESULT],
            status: data[offset::STATUS],
            data8: data[offset::DATA8],
            data32: u32_at(data, offset::DATA32),
            payload,
        })
    }
}

/// Check at startup that encoding places every field at its expected offset.
///
/// A mismatch would silently corrupt every request, so the register client
/// refuses to open when this returns `false`.
pub fn validate_layout() -> bool {
    let probe = ParamStruct {
        key: FourCc::from_u32(0x0102_0304),
        key_info: KeyInfo {
            data_size: 0x0506_0708,
            data_type: FourCc::from_u32(0x090A_0B0C),
            attributes: 0x0D,
        },
        result: 0x0E,
        status: 0x0F,
        data8: 0x10,
        data32: 0x1112_1314,
        payload: [0x15; PAYLOAD_LEN],
        ..ParamStruct::default()
    };
    let bytes = probe.encode();

    bytes.len() == PARAM_STRUCT_SIZE
        && u32_at(&bytes, offset::KEY) == 0x0102_0304
        && u32_at(&bytes, offset::INFO_SIZE) == 0x0506_0708
        && bytes[offset::RESULT] == 0x0E
        && bytes[offset::DATA8] == 0x10
        && bytes[PARAM_STRUCT_SIZE - 1] == 0x15
        && ParamStruct::decode(&bytes).is_ok_and(|decoded| decoded == probe)
}

fn put(buf: &mut [u8; PARAM_STRUCT_SIZE], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn u32_at(data: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[at..at + 4]);
    u32::from_ne_bytes(word)
}
