// path.rs - CIP request paths and backplane port routing
// =========================================================================
//
// Logical segments (class / instance / attribute / connection point) are
// emitted in the smallest encoding that holds the id. Every path is kept at
// an even byte length because the wire carries its size in 16-bit words.

use crate::error::{EtherNetIpError, Result};
use serde::{Deserialize, Serialize};

const SEG_CLASS_8: u8 = 0x20;
const SEG_CLASS_16: u8 = 0x21;
const SEG_INSTANCE_8: u8 = 0x24;
const SEG_INSTANCE_16: u8 = 0x25;
const SEG_INSTANCE_32: u8 = 0x26;
const SEG_CONN_POINT_8: u8 = 0x2C;
const SEG_CONN_POINT_16: u8 = 0x2D;
const SEG_ATTRIBUTE_8: u8 = 0x30;
const SEG_ATTRIBUTE_16: u8 = 0x31;
const SEG_SYMBOLIC: u8 = 0x91;

/// Largest path the one-byte word count can describe
pub const MAX_PATH_BYTES: usize = 255 * 2;

/// An encoded CIP request path.
///
/// # Examples
///
/// ```rust
/// use enip_scanner::CipPath;
///
/// // Assembly object, instance 100, data attribute
/// let path = CipPath::new().class(0x04).instance(100).attribute(3);
/// assert_eq!(path.as_bytes(), &[0x20, 0x04, 0x24, 0x64, 0x30, 0x03]);
/// assert_eq!(path.words(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipPath {
    bytes: Vec<u8>,
}

impl CipPath {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Appends a class segment (8-bit form when the id fits)
    pub fn class(mut self, id: u16) -> Self {
        match u8::try_from(id) {
            Ok(short) => self.bytes.extend_from_slice(&[SEG_CLASS_8, short]),
            Err(_) => {
                self.bytes.extend_from_slice(&[SEG_CLASS_16, 0x00]);
                self.bytes.extend_from_slice(&id.to_le_bytes());
            }
        }
        self
    }

    /// Appends an instance segment (8, 16 or 32-bit form)
    pub fn instance(mut self, id: u32) -> Self {
        if let Ok(short) = u8::try_from(id) {
            self.bytes.extend_from_slice(&[SEG_INSTANCE_8, short]);
        } else if let Ok(word) = u16::try_from(id) {
            self.bytes.extend_from_slice(&[SEG_INSTANCE_16, 0x00]);
            self.bytes.extend_from_slice(&word.to_le_bytes());
        } else {
            self.bytes.extend_from_slice(&[SEG_INSTANCE_32, 0x00]);
            self.bytes.extend_from_slice(&id.to_le_bytes());
        }
        self
    }

    /// Appends an attribute segment
    pub fn attribute(mut self, id: u16) -> Self {
        match u8::try_from(id) {
            Ok(short) => self.bytes.extend_from_slice(&[SEG_ATTRIBUTE_8, short]),
            Err(_) => {
                self.bytes.extend_from_slice(&[SEG_ATTRIBUTE_16, 0x00]);
                self.bytes.extend_from_slice(&id.to_le_bytes());
            }
        }
        self
    }

    /// Appends a connection point segment (assembly instance inside a Forward-Open path)
    pub fn connection_point(mut self, id: u32) -> Self {
        if let Ok(short) = u8::try_from(id) {
            self.bytes.extend_from_slice(&[SEG_CONN_POINT_8, short]);
        } else {
            // Connection points above 0xFFFF do not exist on the wire
            let word = id.min(u16::MAX as u32) as u16;
            self.bytes.extend_from_slice(&[SEG_CONN_POINT_16, 0x00]);
            self.bytes.extend_from_slice(&word.to_le_bytes());
        }
        self
    }

    /// Appends an ANSI extended symbolic segment.
    ///
    /// Dotted and bracketed names (`Program:Main.Tag`, `Array[0]`) travel as
    /// one symbol; the controller resolves them.
    pub fn symbolic(mut self, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(EtherNetIpError::InvalidArgument(
                "Tag name cannot be empty".to_string(),
            ));
        }
        if !name.is_ascii() {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "Tag name '{}' is not ASCII",
                name
            )));
        }
        let len = u8::try_from(name.len()).map_err(|_| {
            EtherNetIpError::InvalidArgument(format!(
                "Tag name is {} bytes, the symbolic segment holds 255",
                name.len()
            ))
        })?;
        self.bytes.push(SEG_SYMBOLIC);
        self.bytes.push(len);
        self.bytes.extend_from_slice(name.as_bytes());
        self.pad();
        Ok(self)
    }

    fn pad(&mut self) {
        if self.bytes.len() % 2 != 0 {
            self.bytes.push(0x00);
        }
    }

    /// Encoded bytes, always an even count
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Path size in 16-bit words, as carried in the request header.
    ///
    /// Saturates at 255; [`CipPath::checked_words`] reports oversize paths.
    pub fn words(&self) -> u8 {
        (self.bytes.len() / 2).min(u8::MAX as usize) as u8
    }

    /// Path size in words, or an error if it does not fit the one-byte field
    pub fn checked_words(&self) -> Result<u8> {
        if self.bytes.len() > MAX_PATH_BYTES {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "Path is {} bytes, the maximum is {}",
                self.bytes.len(),
                MAX_PATH_BYTES
            )));
        }
        Ok((self.bytes.len() / 2) as u8)
    }
}

/// Builds a class / instance / optional attribute path.
///
/// Returns the encoded bytes and their size in words.
pub fn build_path(class: u16, instance: u32, attribute: Option<u16>) -> (Vec<u8>, u8) {
    let mut path = CipPath::new().class(class).instance(instance);
    if let Some(attribute) = attribute {
        path = path.attribute(attribute);
    }
    path.pad();
    let words = path.words();
    (path.bytes, words)
}

// =========================================================================
// PORT ROUTING
// =========================================================================

/// Port routing segment for reaching a processor behind a backplane.
///
/// # Examples
///
/// ```rust
/// use enip_scanner::PortSegment;
///
/// // Processor in slot 1 (most common)
/// let routing = PortSegment::processor_in_slot(1);
/// assert_eq!(routing.encode(), vec![0x01, 0x01]);
///
/// // Multi-hop routing
/// let routing = PortSegment::new(1, vec![0, 2, 5]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSegment {
    /// Port number (1 for backplane, 2 for Ethernet)
    pub port: u16,
    /// Link addresses to traverse
    pub link: Vec<u8>,
}

impl Default for PortSegment {
    fn default() -> Self {
        Self::processor_in_slot(0)
    }
}

impl PortSegment {
    pub fn new(port: u16, link: Vec<u8>) -> Self {
        Self { port, link }
    }

    /// Routing to a processor in a backplane slot
    pub fn processor_in_slot(slot: u8) -> Self {
        Self {
            port: 1,
            link: vec![slot],
        }
    }

    /// Encodes the port segment for an Unconnected Send route path.
    ///
    /// A single-byte link uses the compact form `[port, link]`; longer links
    /// set the extended-link bit and carry a length byte.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.link.len());
        let port = (self.port.min(0x0E)) as u8;
        if self.link.len() == 1 {
            bytes.push(port);
            bytes.push(self.link[0]);
        } else {
            bytes.push(0x10 | port);
            bytes.push(self.link.len() as u8);
            bytes.extend_from_slice(&self.link);
        }
        if bytes.len() % 2 != 0 {
            bytes.push(0x00);
        }
        bytes
    }

    pub fn description(&self) -> String {
        if self.link.len() == 1 && self.port == 1 {
            format!("Processor in slot {}", self.link[0])
        } else {
            format!("Port {} routing via {:?}", self.port, self.link)
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.link.is_empty() {
            return Err("Link path cannot be empty".to_string());
        }
        if self.link.len() > 8 {
            return Err("Link path too long (max 8 hops)".to_string());
        }
        if self.port == 0 || self.port > 14 {
            return Err("Port number must be 1-14".to_string());
        }
        Ok(())
    }
}
