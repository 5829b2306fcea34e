// tag.rs - Symbolic tag access and the CIP elementary type codec
// =========================================================================
//
// Read Tag (0x4C) / Write Tag (0x4D) against a controller's symbol table.
// The tag name travels as one ANSI extended symbolic segment; structure
// (`Program:Main.Motor.Speed`) and indexing (`Array[3]`) are resolved by the
// controller. Decoding dispatches on the type code the controller returns.

use crate::cip::{self, service};
use crate::encap::Session;
use crate::error::{too_short, EtherNetIpError, Result};
use crate::path::{CipPath, PortSegment};
use std::net::IpAddr;
use tokio::time::Duration;
use tracing::debug;

/// Type code Logix controllers return for structured tags, followed by a 2-byte handle
pub const STRUCTURE_TAG: u16 = 0x02A0;

/// Longest string the one-byte length prefix can describe
pub const MAX_STRING_LEN: usize = 255;

/// CIP elementary data types understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CipType {
    Bool = 0x00C1,
    Sint = 0x00C2,
    Int = 0x00C3,
    Dint = 0x00C4,
    Lint = 0x00C5,
    Usint = 0x00C6,
    Uint = 0x00C7,
    Udint = 0x00C8,
    Ulint = 0x00C9,
    Real = 0x00CA,
    Lreal = 0x00CB,
    Byte = 0x00D1,
    Word = 0x00D2,
    Dword = 0x00D3,
    Lword = 0x00D4,
    /// One length byte followed by up to 255 ASCII bytes
    String = 0x00DA,
}

impl CipType {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x00C1 => CipType::Bool,
            0x00C2 => CipType::Sint,
            0x00C3 => CipType::Int,
            0x00C4 => CipType::Dint,
            0x00C5 => CipType::Lint,
            0x00C6 => CipType::Usint,
            0x00C7 => CipType::Uint,
            0x00C8 => CipType::Udint,
            0x00C9 => CipType::Ulint,
            0x00CA => CipType::Real,
            0x00CB => CipType::Lreal,
            0x00D1 => CipType::Byte,
            0x00D2 => CipType::Word,
            0x00D3 => CipType::Dword,
            0x00D4 => CipType::Lword,
            0x00DA => CipType::String,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Encoded width in bytes; `None` for variable-length types
    pub fn size(self) -> Option<usize> {
        match self {
            CipType::Bool | CipType::Sint | CipType::Usint | CipType::Byte => Some(1),
            CipType::Int | CipType::Uint | CipType::Word => Some(2),
            CipType::Dint | CipType::Udint | CipType::Real | CipType::Dword => Some(4),
            CipType::Lint | CipType::Ulint | CipType::Lreal | CipType::Lword => Some(8),
            CipType::String => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipType::Bool => "BOOL",
            CipType::Sint => "SINT",
            CipType::Int => "INT",
            CipType::Dint => "DINT",
            CipType::Lint => "LINT",
            CipType::Usint => "USINT",
            CipType::Uint => "UINT",
            CipType::Udint => "UDINT",
            CipType::Ulint => "ULINT",
            CipType::Real => "REAL",
            CipType::Lreal => "LREAL",
            CipType::Byte => "BYTE",
            CipType::Word => "WORD",
            CipType::Dword => "DWORD",
            CipType::Lword => "LWORD",
            CipType::String => "STRING",
        }
    }
}

/// A typed tag value
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    Ulint(u64),
    /// IEEE 754 single precision, little-endian on the wire
    Real(f32),
    Lreal(f64),
    Byte(u8),
    Word(u16),
    Dword(u32),
    Lword(u64),
    String(String),
}

impl TagValue {
    pub fn cip_type(&self) -> CipType {
        match self {
            TagValue::Bool(_) => CipType::Bool,
            TagValue::Sint(_) => CipType::Sint,
            TagValue::Int(_) => CipType::Int,
            TagValue::Dint(_) => CipType::Dint,
            TagValue::Lint(_) => CipType::Lint,
            TagValue::Usint(_) => CipType::Usint,
            TagValue::Uint(_) => CipType::Uint,
            TagValue::Udint(_) => CipType::Udint,
            TagValue::Ulint(_) => CipType::Ulint,
            TagValue::Real(_) => CipType::Real,
            TagValue::Lreal(_) => CipType::Lreal,
            TagValue::Byte(_) => CipType::Byte,
            TagValue::Word(_) => CipType::Word,
            TagValue::Dword(_) => CipType::Dword,
            TagValue::Lword(_) => CipType::Lword,
            TagValue::String(_) => CipType::String,
        }
    }

    /// Encodes the value for transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            TagValue::Bool(val) => vec![if *val { 0xFF } else { 0x00 }],
            TagValue::Sint(val) => val.to_le_bytes().to_vec(),
            TagValue::Int(val) => val.to_le_bytes().to_vec(),
            TagValue::Dint(val) => val.to_le_bytes().to_vec(),
            TagValue::Lint(val) => val.to_le_bytes().to_vec(),
            TagValue::Usint(val) | TagValue::Byte(val) => vec![*val],
            TagValue::Uint(val) | TagValue::Word(val) => val.to_le_bytes().to_vec(),
            TagValue::Udint(val) | TagValue::Dword(val) => val.to_le_bytes().to_vec(),
            TagValue::Ulint(val) | TagValue::Lword(val) => val.to_le_bytes().to_vec(),
            TagValue::Real(val) => val.to_le_bytes().to_vec(),
            TagValue::Lreal(val) => val.to_le_bytes().to_vec(),
            TagValue::String(val) => encode_string(val)?,
        })
    }

    /// Decodes `data` according to the type code the device reported
    pub fn decode(type_code: u16, data: &[u8]) -> Result<Self> {
        let cip_type = CipType::from_code(type_code).ok_or_else(|| {
            EtherNetIpError::InvalidArgument(format!(
                "Type code 0x{:04X} has no typed decoding",
                type_code
            ))
        })?;
        let size = cip_type.size().unwrap_or(0);
        if data.len() < size {
            return Err(too_short(size, data.len()));
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&data[..size]);
        let b2 = [raw[0], raw[1]];
        let b4 = [raw[0], raw[1], raw[2], raw[3]];
        Ok(match cip_type {
            CipType::Bool => TagValue::Bool(raw[0] != 0),
            CipType::Sint => TagValue::Sint(raw[0] as i8),
            CipType::Usint => TagValue::Usint(raw[0]),
            CipType::Byte => TagValue::Byte(raw[0]),
            CipType::Int => TagValue::Int(i16::from_le_bytes(b2)),
            CipType::Uint => TagValue::Uint(u16::from_le_bytes(b2)),
            CipType::Word => TagValue::Word(u16::from_le_bytes(b2)),
            CipType::Dint => TagValue::Dint(i32::from_le_bytes(b4)),
            CipType::Udint => TagValue::Udint(u32::from_le_bytes(b4)),
            CipType::Dword => TagValue::Dword(u32::from_le_bytes(b4)),
            CipType::Real => TagValue::Real(f32::from_le_bytes(b4)),
            CipType::Lint => TagValue::Lint(i64::from_le_bytes(raw)),
            CipType::Ulint => TagValue::Ulint(u64::from_le_bytes(raw)),
            CipType::Lword => TagValue::Lword(u64::from_le_bytes(raw)),
            CipType::Lreal => TagValue::Lreal(f64::from_le_bytes(raw)),
            CipType::String => TagValue::String(decode_string(data)?),
        })
    }
}

/// `[len][len ASCII bytes]`
pub fn encode_string(value: &str) -> Result<Vec<u8>> {
    if !value.is_ascii() {
        return Err(EtherNetIpError::InvalidArgument(
            "STRING values must be ASCII".to_string(),
        ));
    }
    if value.len() > MAX_STRING_LEN {
        return Err(EtherNetIpError::InvalidArgument(format!(
            "STRING holds at most {} characters, got {}",
            MAX_STRING_LEN,
            value.len()
        )));
    }
    let mut bytes = Vec::with_capacity(1 + value.len());
    bytes.push(value.len() as u8);
    bytes.extend_from_slice(value.as_bytes());
    Ok(bytes)
}

pub fn decode_string(data: &[u8]) -> Result<String> {
    let len = *data.first().ok_or_else(|| too_short(1, 0))? as usize;
    if data.len() < 1 + len {
        return Err(too_short(1 + len, data.len()));
    }
    Ok(String::from_utf8_lossy(&data[1..1 + len]).into_owned())
}

/// Result of a tag read.
///
/// `data` keeps the raw value bytes whether or not [`TagResult::value`]
/// can decode them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagResult {
    pub ip: IpAddr,
    pub tag: String,
    pub data: Vec<u8>,
    /// Type code reported by the controller
    pub cip_type: u16,
    /// Structure handle, present when `cip_type` is [`STRUCTURE_TAG`]
    pub structure_handle: Option<u16>,
    pub rtt: Duration,
}

impl TagResult {
    /// Typed view of the raw bytes
    pub fn value(&self) -> Result<TagValue> {
        TagValue::decode(self.cip_type, &self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub fn tag_path(tag: &str) -> Result<CipPath> {
    CipPath::new().symbolic(tag)
}

/// Builds a Read Tag request for one element
pub fn build_read_request(tag: &str) -> Result<Vec<u8>> {
    cip::encode_request(service::READ_TAG, &tag_path(tag)?, &1u16.to_le_bytes())
}

fn write_request_data(data: &[u8], cip_type: u16) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(EtherNetIpError::InvalidArgument(
            "Tag write needs at least one byte".to_string(),
        ));
    }
    let mut body = Vec::with_capacity(6 + data.len());
    body.extend_from_slice(&cip_type.to_le_bytes());
    let value = if cip_type == STRUCTURE_TAG {
        // Structured writes carry the structure handle ahead of the element count
        if data.len() < 3 {
            return Err(EtherNetIpError::InvalidArgument(
                "Structure writes need the 2-byte handle followed by data".to_string(),
            ));
        }
        body.extend_from_slice(&data[..2]);
        &data[2..]
    } else {
        if let Some(size) = CipType::from_code(cip_type).and_then(CipType::size) {
            if data.len() != size {
                return Err(EtherNetIpError::InvalidArgument(format!(
                    "Type 0x{:04X} takes {} bytes, got {}",
                    cip_type,
                    size,
                    data.len()
                )));
            }
        }
        data
    };
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(value);
    Ok(body)
}

/// Builds a Write Tag request for one element
pub fn build_write_request(tag: &str, data: &[u8], cip_type: u16) -> Result<Vec<u8>> {
    cip::encode_request(service::WRITE_TAG, &tag_path(tag)?, &write_request_data(data, cip_type)?)
}

/// Splits a Read Tag reply into type code, structure handle and value bytes
pub fn split_read_reply(data: &[u8]) -> Result<(u16, Option<u16>, Vec<u8>)> {
    if data.len() < 2 {
        return Err(too_short(2, data.len()));
    }
    let type_code = u16::from_le_bytes([data[0], data[1]]);
    if type_code == STRUCTURE_TAG {
        if data.len() < 4 {
            return Err(too_short(4, data.len()));
        }
        let handle = u16::from_le_bytes([data[2], data[3]]);
        return Ok((type_code, Some(handle), data[4..].to_vec()));
    }
    Ok((type_code, None, data[2..].to_vec()))
}

/// Reads one tag element over an open session
pub async fn read(
    session: &mut Session,
    tag: &str,
    route: Option<&PortSegment>,
    budget: Duration,
) -> Result<(u16, Option<u16>, Vec<u8>)> {
    let path = tag_path(tag)?;
    let response = cip::send_routed_request(
        session,
        service::READ_TAG,
        &path,
        &1u16.to_le_bytes(),
        route,
        budget,
    )
    .await?;
    let (type_code, handle, data) = split_read_reply(&response.data)?;
    debug!(
        "Read tag '{}': type 0x{:04X}, {} bytes",
        tag,
        type_code,
        data.len()
    );
    Ok((type_code, handle, data))
}

/// Writes one tag element over an open session
pub async fn write(
    session: &mut Session,
    tag: &str,
    data: &[u8],
    cip_type: u16,
    route: Option<&PortSegment>,
    budget: Duration,
) -> Result<()> {
    let path = tag_path(tag)?;
    let body = write_request_data(data, cip_type)?;
    cip::send_routed_request(session, service::WRITE_TAG, &path, &body, route, budget).await?;
    debug!("Wrote tag '{}' as type 0x{:04X}", tag, cip_type);
    Ok(())
}
