// cip.rs - CIP explicit message codec
// =========================================================================
//
// Request:  service(1) path_words(1) path(even) data
// Reply:    service|0x80(1) reserved(1) general_status(1) ext_words(1) ext(2*n) data
//
// Explicit requests travel in SendRRData:
//   interface handle(4)=0 timeout(2) item count(2)
//   Null Address item (0x0000, len 0)
//   Unconnected Data item (0x00B2, len, CIP bytes)
// Replies may append further items (sockaddr info after Forward-Open).

use crate::encap::{command, Session};
use crate::error::{EtherNetIpError, Result};
use crate::path::{CipPath, PortSegment};
use tokio::time::Duration;
use tracing::{debug, trace};

/// CIP service codes used by the scanner
pub mod service {
    pub const GET_ATTRIBUTES_ALL: u8 = 0x01;
    pub const SET_ATTRIBUTES_ALL: u8 = 0x02;
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
    pub const READ_TAG: u8 = 0x4C;
    pub const WRITE_TAG: u8 = 0x4D;
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const UNCONNECTED_SEND: u8 = 0x52;
    pub const FORWARD_OPEN: u8 = 0x54;
    pub const REPLY_FLAG: u8 = 0x80;
}

/// Standard CIP object classes
pub mod class {
    pub const IDENTITY: u16 = 0x01;
    pub const MESSAGE_ROUTER: u16 = 0x02;
    pub const ASSEMBLY: u16 = 0x04;
    pub const CONNECTION_MANAGER: u16 = 0x06;
}

/// Common Packet Format item type codes
pub mod item {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const LIST_IDENTITY: u16 = 0x000C;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
    pub const SOCKADDR_O_T: u16 = 0x8000;
    pub const SOCKADDR_T_O: u16 = 0x8001;
    pub const SEQUENCED_ADDRESS: u16 = 0x8002;
}

/// General status: success
pub const STATUS_SUCCESS: u8 = 0x00;
/// General status: object state conflict
pub const STATUS_OBJECT_STATE_CONFLICT: u8 = 0x0C;
/// General status: attribute not settable
pub const STATUS_ATTRIBUTE_NOT_SETTABLE: u8 = 0x0E;

/// Fixed bytes ahead of the first CPF item: interface handle, timeout, item count
const CPF_PREAMBLE_LEN: usize = 8;

/// Returns the standard message for a CIP general status code
pub fn status_message(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Partial transfer",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x21 => "Write-once value or medium already written",
        0x22 => "Invalid reply received",
        0x25 => "Key failure in path",
        0x26 => "Path size invalid",
        0x27 => "Unexpected attribute in list",
        0x28 => "Invalid member ID",
        0x29 => "Member not settable",
        0x2C => "Attribute not gettable",
        _ => "Unknown CIP error",
    }
}

/// Converts a caller budget into the SendRRData timeout field (whole seconds, 1..=255)
pub fn timeout_field(budget: Duration) -> u16 {
    let secs = budget.as_secs() + u64::from(budget.subsec_nanos() > 0);
    secs.clamp(1, 255) as u16
}

/// Encodes a CIP request: service, path size in words, path, data
pub fn encode_request(service: u8, path: &CipPath, data: &[u8]) -> Result<Vec<u8>> {
    let words = path.checked_words()?;
    let mut request = Vec::with_capacity(2 + path.len() + data.len());
    request.push(service);
    request.push(words);
    request.extend_from_slice(path.as_bytes());
    request.extend_from_slice(data);
    Ok(request)
}

/// Wraps a request in Unconnected Send so the connection manager routes it
/// through `route` (for example to a processor in another backplane slot).
pub fn wrap_unconnected_send(request: &[u8], route: &PortSegment) -> Result<Vec<u8>> {
    let size = u16::try_from(request.len()).map_err(|_| {
        EtherNetIpError::InvalidArgument("Embedded request too large to route".to_string())
    })?;
    let route_bytes = route.encode();
    let connection_manager = CipPath::new()
        .class(class::CONNECTION_MANAGER)
        .instance(1);

    let mut wrapped = Vec::with_capacity(request.len() + 16 + route_bytes.len());
    wrapped.push(service::UNCONNECTED_SEND);
    wrapped.push(connection_manager.words());
    wrapped.extend_from_slice(connection_manager.as_bytes());
    wrapped.push(0x0A); // priority / time tick
    wrapped.push(0x0E); // timeout ticks
    wrapped.extend_from_slice(&size.to_le_bytes());
    wrapped.extend_from_slice(request);
    if request.len() % 2 != 0 {
        wrapped.push(0x00);
    }
    wrapped.push((route_bytes.len() / 2) as u8);
    wrapped.push(0x00); // reserved
    wrapped.extend_from_slice(&route_bytes);
    Ok(wrapped)
}

/// One Common Packet Format item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    pub type_id: u16,
    pub data: Vec<u8>,
}

impl CpfItem {
    pub fn new(type_id: u16, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }
}

/// Encodes CPF items behind the interface handle / timeout preamble
pub fn encode_cpf(timeout_secs: u16, items: &[CpfItem]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(CPF_PREAMBLE_LEN + items.iter().map(|i| 4 + i.data.len()).sum::<usize>());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&timeout_secs.to_le_bytes());
    out.extend_from_slice(&(items.len() as u16).to_le_bytes());
    for entry in items {
        let len = u16::try_from(entry.data.len()).map_err(|_| {
            EtherNetIpError::InvalidArgument("CPF item larger than 65535 bytes".to_string())
        })?;
        out.extend_from_slice(&entry.type_id.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&entry.data);
    }
    Ok(out)
}

/// Decodes the CPF items of a SendRRData / SendUnitData / ListIdentity payload.
///
/// `preamble` is the number of bytes ahead of the item count (6 for
/// SendRRData, 0 for ListIdentity).
pub fn decode_cpf(payload: &[u8], preamble: usize) -> Result<Vec<CpfItem>> {
    if payload.len() < preamble + 2 {
        return Err(EtherNetIpError::MalformedResponse(format!(
            "CPF header needs {} bytes, got {}",
            preamble + 2,
            payload.len()
        )));
    }
    let count = u16::from_le_bytes([payload[preamble], payload[preamble + 1]]) as usize;
    let mut pos = preamble + 2;
    let mut items = Vec::with_capacity(count);
    for index in 0..count {
        if pos + 4 > payload.len() {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "CPF item {} header truncated",
                index
            )));
        }
        let type_id = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        let len = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        pos += 4;
        if pos + len > payload.len() {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "CPF item {} (type 0x{:04X}) declares {} bytes, {} available",
                index,
                type_id,
                len,
                payload.len() - pos
            )));
        }
        items.push(CpfItem::new(type_id, payload[pos..pos + len].to_vec()));
        pos += len;
    }
    Ok(items)
}

/// Builds a SendRRData payload around one CIP request
pub fn encode_send_rr_data(request: &[u8], budget: Duration) -> Result<Vec<u8>> {
    encode_send_rr_data_with(request, &[], budget)
}

/// SendRRData payload with additional items after the data item
pub fn encode_send_rr_data_with(request: &[u8], extra: &[CpfItem], budget: Duration) -> Result<Vec<u8>> {
    let mut items = Vec::with_capacity(2 + extra.len());
    items.push(CpfItem::new(item::NULL_ADDRESS, Vec::new()));
    items.push(CpfItem::new(item::UNCONNECTED_DATA, request.to_vec()));
    items.extend_from_slice(extra);
    encode_cpf(timeout_field(budget), &items)
}

/// The CIP reply and any trailing CPF items of a SendRRData reply
#[derive(Debug, Clone)]
pub struct RrReply {
    pub cip: Vec<u8>,
    pub extra_items: Vec<CpfItem>,
}

/// Walks the SendRRData reply skeleton: preamble, Null Address item,
/// Unconnected Data item, then whatever items follow.
pub fn decode_send_rr_data(payload: &[u8]) -> Result<RrReply> {
    let mut items = decode_cpf(payload, CPF_PREAMBLE_LEN - 2)?.into_iter();
    match items.next() {
        Some(first) if first.type_id == item::NULL_ADDRESS && first.data.is_empty() => {}
        Some(first) => {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Expected Null Address item, got type 0x{:04X} with {} bytes",
                first.type_id,
                first.data.len()
            )))
        }
        None => {
            return Err(EtherNetIpError::MalformedResponse(
                "SendRRData reply has no items".to_string(),
            ))
        }
    }
    let data = match items.next() {
        Some(data) if data.type_id == item::UNCONNECTED_DATA => data,
        Some(other) => {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Expected Unconnected Data item (0x00B2), got 0x{:04X}",
                other.type_id
            )))
        }
        None => {
            return Err(EtherNetIpError::MalformedResponse(
                "SendRRData reply is missing the Unconnected Data item".to_string(),
            ))
        }
    };
    Ok(RrReply {
        cip: data.data,
        extra_items: items.collect(),
    })
}

/// A decoded CIP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipResponse {
    /// Reply service code (request service | 0x80)
    pub service: u8,
    pub general_status: u8,
    pub extended_status: Vec<u16>,
    pub data: Vec<u8>,
}

impl CipResponse {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "CIP reply needs 4 bytes, got {}",
                bytes.len()
            )));
        }
        let ext_words = bytes[3] as usize;
        let data_start = 4 + ext_words * 2;
        if bytes.len() < data_start {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "CIP reply declares {} extended status words but has {} bytes",
                ext_words,
                bytes.len()
            )));
        }
        let extended_status = bytes[4..data_start]
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        Ok(Self {
            service: bytes[0],
            general_status: bytes[2],
            extended_status,
            data: bytes[data_start..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.extended_status.len() * 2 + self.data.len());
        out.push(self.service);
        out.push(0x00);
        out.push(self.general_status);
        out.push(self.extended_status.len() as u8);
        for word in &self.extended_status {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    pub fn is_success(&self) -> bool {
        self.general_status == STATUS_SUCCESS
    }

    /// Turns a non-zero general status into `CipError`, discarding the payload
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(EtherNetIpError::cip(
                self.general_status,
                self.extended_status.first().copied(),
            ))
        }
    }
}

/// Parses a SendRRData reply payload into a successful CIP response.
///
/// Fails with `MalformedResponse` on a broken envelope and `CipError` on a
/// non-zero general status.
pub fn parse_response(payload: &[u8]) -> Result<CipResponse> {
    let reply = decode_send_rr_data(payload)?;
    CipResponse::decode(&reply.cip)?.into_result()
}

/// Sends encoded CIP bytes over a session and returns the reply envelope
pub(crate) async fn exchange_cip(
    session: &mut Session,
    request: &[u8],
    budget: Duration,
) -> Result<(CipResponse, Vec<CpfItem>)> {
    exchange_cip_with(session, request, &[], budget).await
}

/// Like [`exchange_cip`], appending `extra` items to the request envelope
pub(crate) async fn exchange_cip_with(
    session: &mut Session,
    request: &[u8],
    extra: &[CpfItem],
    budget: Duration,
) -> Result<(CipResponse, Vec<CpfItem>)> {
    let payload = encode_send_rr_data_with(request, extra, budget)?;
    let reply = session
        .exchange(command::SEND_RR_DATA, &payload, budget)
        .await?;
    let rr = decode_send_rr_data(&reply)?;
    let response = CipResponse::decode(&rr.cip)?;
    trace!(
        "CIP reply 0x{:02X} status 0x{:02X} ({} data bytes)",
        response.service,
        response.general_status,
        response.data.len()
    );
    Ok((response, rr.extra_items))
}

pub(crate) fn check_reply_service(request_service: u8, response: &CipResponse) -> Result<()> {
    if response.service != request_service | service::REPLY_FLAG {
        return Err(EtherNetIpError::MalformedResponse(format!(
            "Reply service 0x{:02X} does not answer request 0x{:02X}",
            response.service, request_service
        )));
    }
    Ok(())
}

/// Sends one explicit request and returns the successful reply
pub async fn send_request(
    session: &mut Session,
    service: u8,
    path: &CipPath,
    payload: &[u8],
    budget: Duration,
) -> Result<CipResponse> {
    let request = encode_request(service, path, payload)?;
    let (response, _) = exchange_cip(session, &request, budget).await?;
    check_reply_service(service, &response)?;
    response.into_result()
}

/// Like [`send_request`], optionally routed through Unconnected Send
pub async fn send_routed_request(
    session: &mut Session,
    service: u8,
    path: &CipPath,
    payload: &[u8],
    route: Option<&PortSegment>,
    budget: Duration,
) -> Result<CipResponse> {
    let Some(route) = route else {
        return send_request(session, service, path, payload, budget).await;
    };
    let request = encode_request(service, path, payload)?;
    let wrapped = wrap_unconnected_send(&request, route)?;
    debug!("Routing 0x{:02X} request via {}", service, route.description());
    let (response, _) = exchange_cip(session, &wrapped, budget).await?;

    // Routing failures come back as an Unconnected Send reply; on success the
    // target's own reply is returned as-is.
    if response.service == service::UNCONNECTED_SEND | service::REPLY_FLAG {
        let response = response.into_result()?;
        let inner = CipResponse::decode(&response.data)?;
        check_reply_service(service, &inner)?;
        return inner.into_result();
    }
    check_reply_service(service, &response)?;
    response.into_result()
}
