// encap.rs - EtherNet/IP encapsulation layer and session lifecycle
// =========================================================================
//
// Every explicit exchange rides in a 24-byte little-endian encapsulation
// header: command(2) length(2) session(4) status(4) context(8) options(4).
// A session is one TCP connection plus the handle handed out by
// RegisterSession; it is unregistered before the socket is dropped.

use crate::error::{EtherNetIpError, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};

pub const ENCAP_HEADER_LEN: usize = 24;

/// Encapsulation command codes
pub mod command {
    pub const NOP: u16 = 0x0000;
    pub const LIST_SERVICES: u16 = 0x0004;
    pub const LIST_IDENTITY: u16 = 0x0063;
    pub const LIST_INTERFACES: u16 = 0x0064;
    pub const REGISTER_SESSION: u16 = 0x0065;
    pub const UNREGISTER_SESSION: u16 = 0x0066;
    pub const SEND_RR_DATA: u16 = 0x006F;
    pub const SEND_UNIT_DATA: u16 = 0x0070;
}

/// Sender context echoed back by the device
pub const SENDER_CONTEXT: [u8; 8] = *b"enipscan";

/// How many leading bytes of a reply are searched for the expected command.
///
/// Some adapters emit stray bytes ahead of the encapsulation header.
pub const MAX_PREFIX_SCAN: usize = 64;

/// Encapsulation header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn new(command: u16, session_handle: u32, length: u16) -> Self {
        Self {
            command,
            length,
            session_handle,
            status: 0,
            sender_context: SENDER_CONTEXT,
            options: 0,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.session_handle.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.sender_context);
        out.extend_from_slice(&self.options.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENCAP_HEADER_LEN {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Encapsulation header needs {} bytes, got {}",
                ENCAP_HEADER_LEN,
                buf.len()
            )));
        }
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(&buf[12..20]);
        Ok(Self {
            command: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
            session_handle: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            status: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            sender_context,
            options: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

/// Builds a complete encapsulation packet around `payload`
pub fn encode_packet(command: u16, session_handle: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        EtherNetIpError::InvalidArgument(format!(
            "Encapsulated payload of {} bytes exceeds 65535",
            payload.len()
        ))
    })?;
    let mut packet = Vec::with_capacity(ENCAP_HEADER_LEN + payload.len());
    EncapHeader::new(command, session_handle, length).encode(&mut packet);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Finds the offset of a header carrying `command` within the first
/// [`MAX_PREFIX_SCAN`] bytes of `buf`.
pub fn find_frame(buf: &[u8], command: u16) -> Option<usize> {
    let code = command.to_le_bytes();
    if buf.len() < ENCAP_HEADER_LEN {
        return None;
    }
    let last = (buf.len() - ENCAP_HEADER_LEN).min(MAX_PREFIX_SCAN);
    (0..=last).find(|&off| buf[off] == code[0] && buf[off + 1] == code[1])
}

/// Human-readable text for an encapsulation status word
pub fn encap_status_message(status: u32) -> &'static str {
    match status {
        0x0000 => "Success",
        0x0001 => "Invalid or unsupported command",
        0x0002 => "Insufficient memory in target",
        0x0003 => "Poorly formed or incorrect data",
        0x0064 => "Invalid session handle",
        0x0065 => "Invalid message length",
        0x0069 => "Unsupported encapsulation protocol revision",
        _ => "Unknown encapsulation status",
    }
}

/// Reads one encapsulation frame carrying `command` from `stream`.
///
/// Returns the header and the payload that follows it. Bytes ahead of the
/// header are discarded; frames larger than `max_size` fail with `OutOfMemory`.
pub(crate) async fn read_frame(
    stream: &mut TcpStream,
    command: u16,
    deadline: Instant,
    max_size: usize,
) -> Result<(EncapHeader, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    let budget = deadline.saturating_duration_since(Instant::now());

    loop {
        if let Some(offset) = find_frame(&buf, command) {
            let header = EncapHeader::decode(&buf[offset..])?;
            let total = offset + ENCAP_HEADER_LEN + header.length as usize;
            if total - offset > max_size {
                return Err(EtherNetIpError::OutOfMemory {
                    requested: total - offset,
                    limit: max_size,
                });
            }
            if buf.len() >= total {
                if offset > 0 {
                    debug!("Skipped {} stray bytes ahead of encapsulation header", offset);
                }
                let payload = buf[offset + ENCAP_HEADER_LEN..total].to_vec();
                trace!("Frame 0x{:04X} payload: {:02X?}", command, payload);
                return Ok((header, payload));
            }
        } else if buf.len() >= MAX_PREFIX_SCAN + ENCAP_HEADER_LEN {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "No 0x{:04X} reply header within the first {} bytes",
                command, MAX_PREFIX_SCAN
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EtherNetIpError::Timeout(budget));
        }
        let n = match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(EtherNetIpError::Io(e)),
            Err(_) => return Err(EtherNetIpError::Timeout(budget)),
        };
        if n == 0 {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Connection closed after {} bytes of a 0x{:04X} reply",
                buf.len(),
                command
            )));
        }
        if buf.len() + n > max_size + MAX_PREFIX_SCAN {
            return Err(EtherNetIpError::OutOfMemory {
                requested: buf.len() + n,
                limit: max_size + MAX_PREFIX_SCAN,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Opens a TCP connection with a bounded connect timeout
pub(crate) async fn connect(target: SocketAddr, budget: Duration) -> Result<TcpStream> {
    let stream = match timeout(budget, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(EtherNetIpError::ConnectionFailure {
                target: target.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(EtherNetIpError::ConnectionFailure {
                target: target.to_string(),
                reason: format!("connect timed out after {:?}", budget),
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Could not disable Nagle on {}: {}", target, e);
    }
    Ok(stream)
}

/// A registered EtherNet/IP session.
///
/// Owned by the operation that opened it. Call [`Session::close`] to release
/// the device-side session slot before dropping it.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    target: SocketAddr,
    handle: u32,
    created_at: Instant,
    max_response_size: usize,
}

impl Session {
    /// Connects to `target` and registers a session.
    ///
    /// `budget` bounds the connect and the RegisterSession round trip separately.
    pub async fn open(target: SocketAddr, budget: Duration, max_response_size: usize) -> Result<Self> {
        let mut stream = connect(target, budget).await?;

        // Protocol version 1, option flags 0
        let packet = encode_packet(command::REGISTER_SESSION, 0, &[0x01, 0x00, 0x00, 0x00])?;
        write_all(&mut stream, &packet, budget).await?;

        let deadline = Instant::now() + budget;
        let (header, _) =
            read_frame(&mut stream, command::REGISTER_SESSION, deadline, max_response_size).await?;

        if header.status != 0 {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "RegisterSession rejected with status 0x{:08X}: {}",
                header.status,
                encap_status_message(header.status)
            )));
        }
        if header.session_handle == 0 {
            return Err(EtherNetIpError::MalformedResponse(
                "RegisterSession returned a zero session handle".to_string(),
            ));
        }

        debug!("Registered session 0x{:08X} with {}", header.session_handle, target);
        Ok(Self {
            stream,
            target,
            handle: header.session_handle,
            created_at: Instant::now(),
            max_response_size,
        })
    }

    /// Unregisters the session and shuts the socket down
    pub async fn close(mut self, budget: Duration) -> Result<()> {
        let packet = encode_packet(command::UNREGISTER_SESSION, self.handle, &[])?;
        let result = write_all(&mut self.stream, &packet, budget).await;
        let _ = timeout(budget, self.stream.shutdown()).await;
        debug!("Unregistered session 0x{:08X} with {}", self.handle, self.target);
        result
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn max_response_size(&self) -> usize {
        self.max_response_size
    }

    /// Sends one encapsulated command and waits for the matching reply payload
    pub(crate) async fn exchange(
        &mut self,
        cmd: u16,
        payload: &[u8],
        budget: Duration,
    ) -> Result<Vec<u8>> {
        let packet = encode_packet(cmd, self.handle, payload)?;
        trace!("Sending 0x{:04X} ({} bytes): {:02X?}", cmd, packet.len(), packet);
        write_all(&mut self.stream, &packet, budget).await?;

        let deadline = Instant::now() + budget;
        let (header, reply) =
            read_frame(&mut self.stream, cmd, deadline, self.max_response_size).await?;
        if header.status != 0 {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Encapsulation status 0x{:08X}: {}",
                header.status,
                encap_status_message(header.status)
            )));
        }
        if header.session_handle != self.handle {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Reply carries session 0x{:08X}, expected 0x{:08X}",
                header.session_handle, self.handle
            )));
        }
        Ok(reply)
    }
}

async fn write_all(stream: &mut TcpStream, packet: &[u8], budget: Duration) -> Result<()> {
    match timeout(budget, stream.write_all(packet)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EtherNetIpError::Io(e)),
        Err(_) => Err(EtherNetIpError::Timeout(budget)),
    }
}
