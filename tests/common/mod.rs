//! Simulated EtherNet/IP device for integration tests.
//!
//! One [`SimDevice`] answers encapsulation traffic on a local TCP port
//! (sessions, assemblies, tags, Forward-Open/Close, vendor classes) and runs
//! a UDP peer for cyclic I/O. [`SimIdentity`] answers ListIdentity datagrams.
#![allow(dead_code)]

use enip_scanner::cip::{self, item, service, CipResponse, CpfItem};
use enip_scanner::encap::{self, command, EncapHeader, ENCAP_HEADER_LEN};
use enip_scanner::implicit::{encode_sockaddr, ForwardOpenReply, IoPacket};
use enip_scanner::{DeviceIdentity, ScannerConfig};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::Level;

pub const SESSION_HANDLE: u32 = 0x0001_0042;
pub const O_TO_T_CONNECTION_ID: u32 = 0x1000_0001;

pub const STATUS_CONNECTION_FAILURE: u8 = 0x01;
pub const STATUS_SERVICE_NOT_SUPPORTED: u8 = 0x08;
pub const STATUS_NOT_SETTABLE: u8 = 0x0E;
pub const STATUS_NOT_ENOUGH_DATA: u8 = 0x13;
pub const STATUS_TOO_MUCH_DATA: u8 = 0x15;
pub const STATUS_OBJECT_DOES_NOT_EXIST: u8 = 0x16;
pub const STATUS_PATH_SEGMENT_ERROR: u8 = 0x04;

static INIT_TRACING: Once = Once::new();

/// Installs a compact `tracing` subscriber once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// One CIP request as the device saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub service: u8,
    pub path: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Parsed {
    class: Option<u16>,
    instance: Option<u32>,
    attribute: Option<u16>,
    points: Vec<u32>,
    symbol: Option<String>,
}

fn parse_path(path: &[u8]) -> Parsed {
    let mut parsed = Parsed::default();
    let mut pos = 0;
    while pos + 1 < path.len() {
        match path[pos] {
            0x20 => parsed.class = Some(u16::from(path[pos + 1])),
            0x24 => parsed.instance = Some(u32::from(path[pos + 1])),
            0x30 => parsed.attribute = Some(u16::from(path[pos + 1])),
            0x2C => parsed.points.push(u32::from(path[pos + 1])),
            0x21 | 0x25 | 0x31 | 0x2D if pos + 3 < path.len() => {
                let value = u16::from_le_bytes([path[pos + 2], path[pos + 3]]);
                match path[pos] {
                    0x21 => parsed.class = Some(value),
                    0x25 => parsed.instance = Some(u32::from(value)),
                    0x31 => parsed.attribute = Some(value),
                    _ => parsed.points.push(u32::from(value)),
                }
                pos += 4;
                continue;
            }
            0x91 => {
                let len = path[pos + 1] as usize;
                let name = &path[pos + 2..(pos + 2 + len).min(path.len())];
                parsed.symbol = Some(String::from_utf8_lossy(name).to_string());
                pos += 2 + len + len % 2;
                continue;
            }
            _ => break,
        }
        pos += 2;
    }
    parsed
}

fn lock(model: &Mutex<DeviceModel>) -> MutexGuard<'_, DeviceModel> {
    model.lock().unwrap()
}

fn reply(request_service: u8, status: u8, data: Vec<u8>) -> CipResponse {
    CipResponse {
        service: request_service | service::REPLY_FLAG,
        general_status: status,
        extended_status: Vec::new(),
        data,
    }
}

fn reply_extended(request_service: u8, status: u8, extended: u16) -> CipResponse {
    CipResponse {
        extended_status: vec![extended],
        ..reply(request_service, status, Vec::new())
    }
}

/// Connection established through Forward-Open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConnection {
    pub o_to_t_id: u32,
    pub t_to_o_id: u32,
    pub serial: u16,
    pub consumed_instance: u32,
    pub produced_instance: u32,
    pub o_to_t_size: usize,
    pub t_to_o_size: usize,
}

/// Everything the simulated device knows and remembers
#[derive(Debug, Default)]
pub struct DeviceModel {
    pub assemblies: HashMap<u32, Vec<u8>>,
    pub read_only: HashSet<u32>,
    /// name -> (type code, bytes after the type code)
    pub tags: HashMap<String, (u16, Vec<u8>)>,
    /// (class, instance) -> attribute data for vendor classes
    pub vendor: HashMap<(u16, u32), Vec<u8>>,
    pub requests: Vec<Recorded>,
    /// Replaces the Unconnected Data item type in replies
    pub data_item_type: Option<u16>,
    pub connection: Option<SimConnection>,
    pub last_output: Vec<u8>,
    pub o_to_t_packets: u64,
    /// Stop answering O->T datagrams
    pub io_silent: bool,
    pub io_addr: Option<SocketAddr>,
    pub forward_open_items: Vec<CpfItem>,
    /// Appended to every successful Forward-Open reply
    pub forward_open_reply_items: Vec<CpfItem>,
    /// Assembly instances whose requests are recorded but never answered
    pub stall_instances: HashSet<u32>,
    /// Bytes written ahead of every SendRRData reply
    pub reply_prefix: Vec<u8>,
    pub registered: u64,
    pub unregistered: u64,
}

impl DeviceModel {
    pub fn with_assembly(mut self, instance: u32, data: Vec<u8>) -> Self {
        self.assemblies.insert(instance, data);
        self
    }

    pub fn with_read_only(mut self, instance: u32) -> Self {
        self.read_only.insert(instance);
        self
    }

    pub fn with_tag(mut self, name: &str, type_code: u16, data: Vec<u8>) -> Self {
        self.tags.insert(name.to_string(), (type_code, data));
        self
    }

    pub fn with_vendor(mut self, class: u16, instance: u32, data: Vec<u8>) -> Self {
        self.vendor.insert((class, instance), data);
        self
    }

    /// Index of the first recorded request matching `service` and `path`
    pub fn position_of(&self, service: u8, path: &[u8]) -> Option<usize> {
        self.requests
            .iter()
            .position(|r| r.service == service && r.path == path)
    }

    fn handle(&mut self, service_code: u8, path: &[u8], data: &[u8], extras: &[CpfItem]) -> (CipResponse, Vec<CpfItem>) {
        self.requests.push(Recorded {
            service: service_code,
            path: path.to_vec(),
            data: data.to_vec(),
        });
        let parsed = parse_path(path);

        if service_code == service::UNCONNECTED_SEND {
            return (self.unconnected_send(data), Vec::new());
        }
        if let Some(symbol) = parsed.symbol.clone() {
            return (self.tag(service_code, &symbol, data), Vec::new());
        }
        match parsed.class {
            Some(0x04) => (self.assembly(service_code, &parsed, data), Vec::new()),
            Some(0x06) if service_code == service::FORWARD_OPEN => self.forward_open(data, extras),
            Some(0x06) if service_code == service::FORWARD_CLOSE => (self.forward_close(data), Vec::new()),
            Some(class @ 0x70..=0x7F) => (self.vendor_class(service_code, class, &parsed, data), Vec::new()),
            _ => (reply(service_code, STATUS_SERVICE_NOT_SUPPORTED, Vec::new()), Vec::new()),
        }
    }

    fn assembly(&mut self, service_code: u8, parsed: &Parsed, data: &[u8]) -> CipResponse {
        let Some(instance) = parsed.instance else {
            return reply(service_code, STATUS_PATH_SEGMENT_ERROR, Vec::new());
        };
        let Some(current) = self.assemblies.get(&instance).cloned() else {
            return reply(service_code, STATUS_OBJECT_DOES_NOT_EXIST, Vec::new());
        };
        match service_code {
            service::GET_ATTRIBUTE_SINGLE => reply(service_code, 0x00, current),
            service::SET_ATTRIBUTE_SINGLE => {
                if self.read_only.contains(&instance) {
                    reply(service_code, STATUS_NOT_SETTABLE, Vec::new())
                } else if data.len() < current.len() {
                    reply(service_code, STATUS_NOT_ENOUGH_DATA, Vec::new())
                } else if data.len() > current.len() {
                    reply(service_code, STATUS_TOO_MUCH_DATA, Vec::new())
                } else {
                    self.assemblies.insert(instance, data.to_vec());
                    reply(service_code, 0x00, Vec::new())
                }
            }
            _ => reply(service_code, STATUS_SERVICE_NOT_SUPPORTED, Vec::new()),
        }
    }

    fn tag(&mut self, service_code: u8, symbol: &str, data: &[u8]) -> CipResponse {
        match service_code {
            service::READ_TAG => match self.tags.get(symbol) {
                Some((type_code, value)) => {
                    let mut out = type_code.to_le_bytes().to_vec();
                    out.extend_from_slice(value);
                    reply(service_code, 0x00, out)
                }
                None => reply(service_code, STATUS_PATH_SEGMENT_ERROR, Vec::new()),
            },
            service::WRITE_TAG => {
                if data.len() < 4 {
                    return reply(service_code, STATUS_NOT_ENOUGH_DATA, Vec::new());
                }
                let type_code = u16::from_le_bytes([data[0], data[1]]);
                let stored = if type_code == 0x02A0 {
                    let mut bytes = data[2..4].to_vec();
                    bytes.extend_from_slice(&data[6..]);
                    bytes
                } else {
                    data[4..].to_vec()
                };
                self.tags.insert(symbol.to_string(), (type_code, stored));
                reply(service_code, 0x00, Vec::new())
            }
            _ => reply(service_code, STATUS_SERVICE_NOT_SUPPORTED, Vec::new()),
        }
    }

    fn unconnected_send(&mut self, data: &[u8]) -> CipResponse {
        if data.len() < 4 {
            return reply(service::UNCONNECTED_SEND, STATUS_NOT_ENOUGH_DATA, Vec::new());
        }
        let size = u16::from_le_bytes([data[2], data[3]]) as usize;
        let embedded = &data[4..4 + size];
        let words = embedded[1] as usize;
        let path = &embedded[2..2 + words * 2];
        let body = &embedded[2 + words * 2..];
        self.handle(embedded[0], path, body, &[]).0
    }

    fn forward_open(&mut self, data: &[u8], extras: &[CpfItem]) -> (CipResponse, Vec<CpfItem>) {
        let fail = |extended| (reply_extended(service::FORWARD_OPEN, STATUS_CONNECTION_FAILURE, extended), Vec::new());
        if self.connection.is_some() {
            return fail(0x0100);
        }
        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let path = parse_path(&data[36..]);
        let (Some(&consumed), Some(&produced)) = (path.points.first(), path.points.get(1)) else {
            return fail(0x0315);
        };
        let o_to_t_size = (u16_at(26) & 0x01FF) as usize;
        let t_to_o_size = (u16_at(32) & 0x01FF) as usize;
        let consumed_len = self.assemblies.get(&consumed).map(Vec::len);
        let produced_len = self.assemblies.get(&produced).map(Vec::len);
        if consumed_len.map(|len| len + 6) != Some(o_to_t_size) || produced_len.map(|len| len + 2) != Some(t_to_o_size) {
            return fail(0x0109);
        }

        self.forward_open_items = extras.to_vec();
        let connection = SimConnection {
            o_to_t_id: O_TO_T_CONNECTION_ID,
            t_to_o_id: u32_at(6),
            serial: u16_at(10),
            consumed_instance: consumed,
            produced_instance: produced,
            o_to_t_size,
            t_to_o_size,
        };
        let body = ForwardOpenReply {
            o_to_t_connection_id: connection.o_to_t_id,
            t_to_o_connection_id: connection.t_to_o_id,
            connection_serial: connection.serial,
            vendor_id: u16_at(12),
            originator_serial: u32_at(14),
            o_to_t_api: Duration::from_micros(u64::from(u32_at(22))),
            t_to_o_api: Duration::from_micros(u64::from(u32_at(28))),
        }
        .encode();
        self.connection = Some(connection);

        let mut items = Vec::new();
        if let Some(SocketAddr::V4(io)) = self.io_addr {
            items.push(CpfItem::new(item::SOCKADDR_O_T, encode_sockaddr(io)));
        }
        items.extend(self.forward_open_reply_items.iter().cloned());
        (reply(service::FORWARD_OPEN, 0x00, body), items)
    }

    fn forward_close(&mut self, data: &[u8]) -> CipResponse {
        let serial = u16::from_le_bytes([data[2], data[3]]);
        match &self.connection {
            Some(connection) if connection.serial == serial => {
                self.connection = None;
                let mut body = data[2..10].to_vec();
                body.extend_from_slice(&[0x00, 0x00]);
                reply(service::FORWARD_CLOSE, 0x00, body)
            }
            _ => reply_extended(service::FORWARD_CLOSE, STATUS_CONNECTION_FAILURE, 0x0107),
        }
    }

    fn vendor_class(&mut self, service_code: u8, class: u16, parsed: &Parsed, data: &[u8]) -> CipResponse {
        let instance = parsed.instance.unwrap_or(0);
        match service_code {
            service::GET_ATTRIBUTE_SINGLE | service::GET_ATTRIBUTES_ALL => match self.vendor.get(&(class, instance)) {
                Some(value) => reply(service_code, 0x00, value.clone()),
                None => reply(service_code, STATUS_OBJECT_DOES_NOT_EXIST, Vec::new()),
            },
            service::SET_ATTRIBUTE_SINGLE | service::SET_ATTRIBUTES_ALL => {
                self.vendor.insert((class, instance), data.to_vec());
                reply(service_code, 0x00, Vec::new())
            }
            _ => reply(service_code, STATUS_SERVICE_NOT_SUPPORTED, Vec::new()),
        }
    }
}

pub fn sample_identity(name: &str, serial_number: u32) -> DeviceIdentity {
    DeviceIdentity {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        reported_addr: None,
        vendor_id: 44,
        device_type: 0x0C,
        product_code: 0x1234,
        revision_major: 2,
        revision_minor: 7,
        status: 0x0030,
        serial_number,
        product_name: name.to_string(),
        state: 3,
        online: true,
        rtt: Duration::ZERO,
    }
}

/// ListIdentity reply payload: item count and one identity item
fn identity_payload(identity: &DeviceIdentity) -> Vec<u8> {
    let body = identity.encode_item();
    let mut out = 1u16.to_le_bytes().to_vec();
    out.extend_from_slice(&item::LIST_IDENTITY.to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn handle_send_rr_data(model: &Mutex<DeviceModel>, payload: &[u8]) -> Option<Vec<u8>> {
    let items = cip::decode_cpf(payload, 6).ok()?;
    let request = items.iter().find(|i| i.type_id == item::UNCONNECTED_DATA)?;
    let extras: Vec<CpfItem> = items
        .iter()
        .filter(|i| i.type_id != item::NULL_ADDRESS && i.type_id != item::UNCONNECTED_DATA)
        .cloned()
        .collect();
    let bytes = &request.data;
    let words = *bytes.get(1)? as usize;
    let path = bytes.get(2..2 + words * 2)?;
    let data = &bytes[2 + words * 2..];

    let mut model = model.lock().ok()?;
    let (response, reply_items) = model.handle(bytes[0], path, data, &extras);
    let parsed = parse_path(path);
    if parsed.class == Some(0x04) && parsed.instance.is_some_and(|i| model.stall_instances.contains(&i)) {
        return Some(Vec::new());
    }
    let mut out = vec![
        CpfItem::new(item::NULL_ADDRESS, Vec::new()),
        CpfItem::new(model.data_item_type.unwrap_or(item::UNCONNECTED_DATA), response.encode()),
    ];
    out.extend(reply_items);
    cip::encode_cpf(0, &out).ok()
}

async fn serve(mut stream: TcpStream, model: Arc<Mutex<DeviceModel>>, identity: DeviceIdentity) {
    loop {
        let mut header = [0u8; ENCAP_HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let Ok(header) = EncapHeader::decode(&header) else {
            return;
        };
        let mut payload = vec![0u8; header.length as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        let mut prefix = Vec::new();
        let reply = match header.command {
            command::REGISTER_SESSION => {
                lock(&model).registered += 1;
                encap::encode_packet(header.command, SESSION_HANDLE, &payload)
            }
            command::UNREGISTER_SESSION => {
                lock(&model).unregistered += 1;
                return;
            }
            command::LIST_IDENTITY => encap::encode_packet(header.command, 0, &identity_payload(&identity)),
            command::SEND_RR_DATA => match handle_send_rr_data(&model, &payload) {
                Some(body) if body.is_empty() => continue,
                Some(body) => {
                    prefix = lock(&model).reply_prefix.clone();
                    encap::encode_packet(header.command, header.session_handle, &body)
                }
                None => return,
            },
            _ => return,
        };
        let Ok(reply) = reply else {
            return;
        };
        let reply = [prefix, reply].concat();
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn run_io_peer(socket: UdpSocket, model: Arc<Mutex<DeviceModel>>) {
    let mut buf = [0u8; 2048];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(packet) = IoPacket::decode(&buf[..len], true) else {
            continue;
        };
        let answer = {
            let Ok(mut model) = model.lock() else {
                return;
            };
            let Some(connection) = model.connection.clone() else {
                continue;
            };
            if packet.connection_id != connection.o_to_t_id {
                continue;
            }
            model.last_output = packet.data.clone();
            model.o_to_t_packets += 1;
            if model.io_silent {
                continue;
            }
            IoPacket {
                connection_id: connection.t_to_o_id,
                sequence: packet.sequence,
                cip_sequence: packet.cip_sequence,
                run_idle: None,
                data: model
                    .assemblies
                    .get(&connection.produced_instance)
                    .cloned()
                    .unwrap_or_default(),
            }
            .encode()
        };
        let _ = socket.send_to(&answer, from).await;
    }
}

/// Simulated adapter listening on loopback
pub struct SimDevice {
    pub addr: SocketAddr,
    pub io_addr: SocketAddr,
    pub state: Arc<Mutex<DeviceModel>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimDevice {
    pub async fn start(model: DeviceModel) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let io = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let io_addr = io.local_addr().unwrap();

        let state = Arc::new(Mutex::new(DeviceModel {
            io_addr: Some(io_addr),
            ..model
        }));
        let identity = DeviceIdentity {
            reported_addr: Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port()))),
            ..sample_identity("Simulated Adapter", 0x00C0_FFEE)
        };

        let accept_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(stream, Arc::clone(&accept_state), identity.clone()));
            }
        });
        let peer = tokio::spawn(run_io_peer(io, Arc::clone(&state)));

        Self {
            addr,
            io_addr,
            state,
            tasks: vec![server, peer],
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Scanner configuration pointed at this device, with an ephemeral I/O port
    pub fn config(&self) -> ScannerConfig {
        ScannerConfig::default()
            .with_port(self.addr.port())
            .with_io_port(0)
    }

    pub fn model(&self) -> MutexGuard<'_, DeviceModel> {
        self.state.lock().unwrap()
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// UDP ListIdentity responder
pub struct SimIdentity {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SimIdentity {
    pub async fn start(name: &str, serial_number: u32) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let payload = identity_payload(&sample_identity(name, serial_number));
        let packet = encap::encode_packet(command::LIST_IDENTITY, 0, &payload).unwrap();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                if len >= 2 && u16::from_le_bytes([buf[0], buf[1]]) == command::LIST_IDENTITY {
                    let _ = socket.send_to(&packet, from).await;
                }
            }
        });
        Self { addr, task }
    }
}

impl Drop for SimIdentity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback UDP address with nothing listening on it
pub async fn dead_address() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap()
}

/// Polls `check` every 10 ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
