// discovery.rs - Device identity scan and assembly instance probing
// =========================================================================
//
// Device discovery sends the encapsulation ListIdentity command (0x0063) as
// UDP datagrams, either to each candidate address or to the limited
// broadcast address, and collects identity items until the requested count
// is reached or the scan budget runs out. Silent or unreachable candidates
// are simply absent from the result.
//
// CIP has no "list assemblies" service, so assembly discovery is a linear
// probe: one Get-Attribute-Single per candidate instance.

use crate::assembly;
use crate::cip::{self, item};
use crate::encap::{self, command, EncapHeader, Session, ENCAP_HEADER_LEN};
use crate::error::{EtherNetIpError, Result};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// Longest product name carried in an identity record
pub const MAX_PRODUCT_NAME: usize = 32;

/// Identity of one responding device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Address the reply came from
    pub ip: IpAddr,
    /// Address the device reports for itself in the identity item
    pub reported_addr: Option<SocketAddr>,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision_major: u8,
    pub revision_minor: u8,
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub state: u8,
    pub online: bool,
    pub rtt: Duration,
}

impl DeviceIdentity {
    /// Decodes a ListIdentity CPF item (type 0x000C)
    pub fn decode_item(data: &[u8], ip: IpAddr, rtt: Duration) -> Result<Self> {
        // version(2) sockaddr(16) vendor(2) type(2) product(2) rev(2) status(2) serial(4) name_len(1)
        const FIXED: usize = 33;
        if data.len() < FIXED {
            return Err(crate::error::too_short(FIXED, data.len()));
        }
        let le16 = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);

        // Socket address fields are big-endian
        let family = u16::from_be_bytes([data[2], data[3]]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        let addr = Ipv4Addr::new(data[6], data[7], data[8], data[9]);
        let reported_addr = (family == 2).then(|| SocketAddr::new(IpAddr::V4(addr), port));

        let name_len = data[32] as usize;
        if data.len() < FIXED + name_len {
            return Err(crate::error::too_short(FIXED + name_len, data.len()));
        }
        let name_bytes = &data[FIXED..FIXED + name_len];
        let product_name: String = String::from_utf8_lossy(name_bytes)
            .chars()
            .take(MAX_PRODUCT_NAME)
            .collect();
        let state = data.get(FIXED + name_len).copied().unwrap_or(0xFF);

        Ok(Self {
            ip,
            reported_addr,
            vendor_id: le16(18),
            device_type: le16(20),
            product_code: le16(22),
            revision_major: data[24],
            revision_minor: data[25],
            status: le16(26),
            serial_number: u32::from_le_bytes([data[28], data[29], data[30], data[31]]),
            product_name,
            state,
            online: true,
            rtt,
        })
    }

    /// Encodes this identity as a ListIdentity CPF item body
    pub fn encode_item(&self) -> Vec<u8> {
        let name = &self.product_name.as_bytes()[..self.product_name.len().min(MAX_PRODUCT_NAME)];
        let mut out = Vec::with_capacity(34 + name.len());
        out.extend_from_slice(&1u16.to_le_bytes());
        match self.reported_addr {
            Some(SocketAddr::V4(v4)) => {
                out.extend_from_slice(&2u16.to_be_bytes());
                out.extend_from_slice(&v4.port().to_be_bytes());
                out.extend_from_slice(&v4.ip().octets());
            }
            _ => out.extend_from_slice(&[0u8; 8]),
        }
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.device_type.to_le_bytes());
        out.extend_from_slice(&self.product_code.to_le_bytes());
        out.push(self.revision_major);
        out.push(self.revision_minor);
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.serial_number.to_le_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.push(self.state);
        out
    }
}

/// Encapsulation packet for a ListIdentity query
pub fn list_identity_request() -> Vec<u8> {
    let mut packet = Vec::with_capacity(ENCAP_HEADER_LEN);
    EncapHeader::new(command::LIST_IDENTITY, 0, 0).encode(&mut packet);
    packet
}

/// Parses a ListIdentity reply (encapsulation header + CPF items)
pub fn parse_list_identity_reply(reply: &[u8], ip: IpAddr, rtt: Duration) -> Result<DeviceIdentity> {
    let offset = encap::find_frame(reply, command::LIST_IDENTITY).ok_or_else(|| {
        EtherNetIpError::MalformedResponse("Not a ListIdentity reply".to_string())
    })?;
    let header = EncapHeader::decode(&reply[offset..])?;
    let body = &reply[offset + ENCAP_HEADER_LEN..];
    if body.len() < header.length as usize {
        return Err(EtherNetIpError::MalformedResponse(format!(
            "ListIdentity reply declares {} bytes, {} received",
            header.length,
            body.len()
        )));
    }
    let items = cip::decode_cpf(&body[..header.length as usize], 0)?;
    let identity = items
        .iter()
        .find(|entry| entry.type_id == item::LIST_IDENTITY)
        .ok_or_else(|| {
            EtherNetIpError::MalformedResponse("ListIdentity reply has no identity item".to_string())
        })?;
    DeviceIdentity::decode_item(&identity.data, ip, rtt)
}

async fn bind_for(candidates: &[SocketAddr]) -> Result<UdpSocket> {
    let any_v6 = candidates.iter().all(|c| c.is_ipv6()) && !candidates.is_empty();
    let local: SocketAddr = if any_v6 {
        "[::]:0".parse().map_err(|_| EtherNetIpError::InvalidArgument("bad bind address".into()))?
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(local).await.map_err(|e| EtherNetIpError::ConnectionFailure {
        target: local.to_string(),
        reason: e.to_string(),
    })?;
    Ok(socket)
}

/// Sends ListIdentity to every candidate and collects replies.
///
/// Stops at `max_count` records or when `budget` has elapsed since the
/// queries went out, whichever comes first. Each address answers at most once.
pub async fn scan(candidates: &[SocketAddr], max_count: usize, budget: Duration) -> Result<Vec<DeviceIdentity>> {
    if max_count == 0 {
        return Err(EtherNetIpError::InvalidArgument(
            "max_count must be at least 1".to_string(),
        ));
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let socket = bind_for(candidates).await?;
    if candidates.iter().any(is_broadcast) {
        socket.set_broadcast(true)?;
    }

    let request = list_identity_request();
    let mut sent_at: HashMap<SocketAddr, Instant> = HashMap::with_capacity(candidates.len());
    let broadcast_sent = Instant::now();
    for candidate in candidates {
        let now = Instant::now();
        match socket.send_to(&request, candidate).await {
            Ok(_) => {
                sent_at.insert(*candidate, now);
            }
            Err(e) => debug!("ListIdentity to {} not sent: {}", candidate, e),
        }
    }

    let deadline = Instant::now() + budget;
    let mut found: Vec<DeviceIdentity> = Vec::new();
    let mut answered: HashSet<SocketAddr> = HashSet::new();
    let mut buf = vec![0u8; 1500];

    while found.len() < max_count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (n, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            // ICMP unreachable surfaces as a receive error on some platforms
            Ok(Err(e)) => {
                debug!("Discovery receive error ignored: {}", e);
                continue;
            }
            Err(_) => break,
        };
        if answered.contains(&from) {
            continue;
        }
        let started = sent_at.get(&from).copied().unwrap_or(broadcast_sent);
        match parse_list_identity_reply(&buf[..n], from.ip(), started.elapsed()) {
            Ok(identity) => {
                debug!(
                    "Found {} '{}' (vendor {}, product {})",
                    identity.ip, identity.product_name, identity.vendor_id, identity.product_code
                );
                answered.insert(from);
                found.push(identity);
            }
            Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
        }
    }

    info!("Discovery found {} of {} candidates", found.len(), candidates.len());
    Ok(found)
}

fn is_broadcast(addr: &SocketAddr) -> bool {
    matches!(addr.ip(), IpAddr::V4(v4) if v4.is_broadcast() || v4.octets()[3] == 255)
}

/// ListIdentity over TCP to a single device
pub async fn identify(target: SocketAddr, budget: Duration, max_response_size: usize) -> Result<DeviceIdentity> {
    use tokio::io::AsyncWriteExt;

    let started = Instant::now();
    let mut stream = encap::connect(target, budget).await?;
    let request = list_identity_request();
    match timeout(budget, stream.write_all(&request)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(EtherNetIpError::Io(e)),
        Err(_) => return Err(EtherNetIpError::Timeout(budget)),
    }
    let (_, payload) = encap::read_frame(
        &mut stream,
        command::LIST_IDENTITY,
        started + budget,
        max_response_size,
    )
    .await?;
    let items = cip::decode_cpf(&payload, 0)?;
    let identity = items
        .iter()
        .find(|entry| entry.type_id == item::LIST_IDENTITY)
        .ok_or_else(|| {
            EtherNetIpError::MalformedResponse("ListIdentity reply has no identity item".to_string())
        })?;
    DeviceIdentity::decode_item(&identity.data, target.ip(), started.elapsed())
}

/// Probes `max_instances` sequential assembly instances starting at `first`.
///
/// Instances that answer a data read without error are kept. A probe that
/// times out or breaks the transport costs that instance: its session is
/// unregistered and the next instance is read over a fresh one.
pub async fn discover_assemblies(
    target: SocketAddr,
    first: u32,
    max_instances: u32,
    per_probe: Duration,
    max_response_size: usize,
) -> Result<Vec<u32>> {
    if max_instances == 0 {
        return Err(EtherNetIpError::InvalidArgument(
            "max_instances must be at least 1".to_string(),
        ));
    }
    assembly::check_instance(first)?;

    let mut session = Some(Session::open(target, per_probe, max_response_size).await?);
    let mut found = Vec::new();
    let last = first.saturating_add(max_instances - 1);

    for instance in first..=last {
        if session.is_none() {
            match Session::open(target, per_probe, max_response_size).await {
                Ok(fresh) => session = Some(fresh),
                Err(e) => {
                    warn!("Assembly probe of {} stopped at instance {}: {}", target, instance, e);
                    break;
                }
            }
        }
        let Some(current) = session.as_mut() else {
            break;
        };
        match assembly::read_data(current, instance, per_probe).await {
            Ok(data) => {
                debug!("Assembly {} answered with {} bytes", instance, data.len());
                found.push(instance);
            }
            Err(EtherNetIpError::CipError { .. }) => {}
            Err(e) => {
                debug!("Assembly {} read failed: {}; reopening session", instance, e);
                if let Some(stale) = session.take() {
                    if let Err(e) = stale.close(per_probe).await {
                        debug!("Unregistering abandoned session failed: {}", e);
                    }
                }
            }
        }
    }

    if let Some(session) = session {
        if let Err(e) = session.close(per_probe).await {
            debug!("Closing probe session failed: {}", e);
        }
    }
    info!("Assembly probe of {} found {} instances", target, found.len());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceIdentity {
        DeviceIdentity {
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            reported_addr: Some("192.168.1.20:44818".parse().unwrap()),
            vendor_id: 44,
            device_type: 0x0C,
            product_code: 7,
            revision_major: 3,
            revision_minor: 12,
            status: 0x0030,
            serial_number: 0xCAFE_0001,
            product_name: "YRC1000 Robot Controller".to_string(),
            state: 3,
            online: true,
            rtt: Duration::ZERO,
        }
    }

    #[test]
    fn test_identity_item_layout() {
        let item = sample().encode_item();
        assert_eq!(&item[0..2], &[1, 0]);
        assert_eq!(&item[2..4], &[0, 2]); // AF_INET big-endian
        assert_eq!(&item[4..6], &44818u16.to_be_bytes());
        assert_eq!(&item[6..10], &[192, 168, 1, 20]);
        assert_eq!(&item[18..20], &[44, 0]);
        assert_eq!(item[32] as usize, "YRC1000 Robot Controller".len());

        let decoded = DeviceIdentity::decode_item(&item, sample().ip, Duration::ZERO).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_identity_item_truncated() {
        let item = sample().encode_item();
        assert!(matches!(
            DeviceIdentity::decode_item(&item[..20], sample().ip, Duration::ZERO),
            Err(EtherNetIpError::ResponseTooShort { .. })
        ));
        // Name length claims more than is present
        assert!(matches!(
            DeviceIdentity::decode_item(&item[..40], sample().ip, Duration::ZERO),
            Err(EtherNetIpError::ResponseTooShort { .. })
        ));
    }

    #[test]
    fn test_product_name_capped() {
        let mut identity = sample();
        identity.product_name = "X".repeat(40);
        let item = identity.encode_item();
        let decoded = DeviceIdentity::decode_item(&item, identity.ip, Duration::ZERO).unwrap();
        assert_eq!(decoded.product_name.len(), MAX_PRODUCT_NAME);
    }

    #[test]
    fn test_parse_list_identity_reply() {
        let item = sample().encode_item();
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&item::LIST_IDENTITY.to_le_bytes());
        body.extend_from_slice(&(item.len() as u16).to_le_bytes());
        body.extend_from_slice(&item);
        let reply = encap::encode_packet(command::LIST_IDENTITY, 0, &body).unwrap();

        let identity = parse_list_identity_reply(&reply, sample().ip, Duration::ZERO).unwrap();
        assert_eq!(identity.serial_number, 0xCAFE_0001);

        let wrong = encap::encode_packet(command::LIST_SERVICES, 0, &body).unwrap();
        assert!(parse_list_identity_reply(&wrong, sample().ip, Duration::ZERO).is_err());
    }

    #[test]
    fn test_list_identity_request() {
        let request = list_identity_request();
        assert_eq!(request.len(), ENCAP_HEADER_LEN);
        assert_eq!(&request[0..4], &[0x63, 0x00, 0x00, 0x00]);
    }
}
