// implicit.rs - Connected (class 1) I/O: Forward-Open/Close and the cyclic exchange
// =========================================================================
//
// Directions are named from the target's point of view:
//   consumed assembly = O->T, transmitted by the scanner every RPI tick
//   produced assembly = T->O, received by the scanner
//
// O->T datagram: item count(2)
//   Sequenced Address (0x8002, len 8): connection id(4) sequence(4)
//   Connected Data    (0x00B1):        cip sequence(2) run/idle(4) data
// T->O datagrams carry the same items without the run/idle header.

use crate::assembly;
use crate::cip::{self, class, item, service, CpfItem};
use crate::config::{ScannerConfig, DEFAULT_IO_PORT};
use crate::encap::Session;
use crate::error::{too_short, EtherNetIpError, Result};
use crate::events::{CloseReason, EventBus, ScannerEvent};
use crate::path::CipPath;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest data size a (non-large) Forward-Open can negotiate, headers included
pub const MAX_CONNECTION_SIZE: usize = 511;
/// Run/idle header value announcing run mode
pub const RUN_IDLE_RUN: u32 = 0x0000_0001;

const SEQUENCE_LEN: usize = 2;
const RUN_IDLE_LEN: usize = 4;
const SOCKADDR_LEN: usize = 16;
const FORWARD_OPEN_REPLY_LEN: usize = 26;
const MAX_DATAGRAM: usize = 2048;

const PRIORITY_TIME_TICK: u8 = 0x0A;
const TIMEOUT_TICKS: u8 = 0x0E;
/// Connection timeout = RPI x 16
const TIMEOUT_MULTIPLIER: u8 = 0x02;
/// Class 1 transport, cyclic trigger, client direction
const TRANSPORT_CLASS1_CYCLIC: u8 = 0x01;

/// Network connection parameter bits (16-bit form)
pub mod params {
    pub const MULTICAST: u16 = 0x2000;
    pub const POINT_TO_POINT: u16 = 0x4000;
    pub const PRIORITY_SCHEDULED: u16 = 0x0800;
    pub const VARIABLE_SIZE: u16 = 0x0200;
    pub const SIZE_MASK: u16 = 0x01FF;
}

/// Builds fixed-size, scheduled network connection parameters for `size` bytes
pub fn network_parameters(size: usize, point_to_point: bool) -> Result<u16> {
    if size == 0 || size > MAX_CONNECTION_SIZE {
        return Err(EtherNetIpError::InvalidArgument(format!(
            "Connection size {} is outside 1..={}",
            size, MAX_CONNECTION_SIZE
        )));
    }
    let kind = if point_to_point {
        params::POINT_TO_POINT
    } else {
        params::MULTICAST
    };
    Ok(kind | params::PRIORITY_SCHEDULED | (size as u16 & params::SIZE_MASK))
}

fn rpi_micros(rpi: Duration) -> Result<u32> {
    u32::try_from(rpi.as_micros()).map_err(|_| {
        EtherNetIpError::InvalidArgument(format!("RPI {:?} does not fit in 32-bit microseconds", rpi))
    })
}

fn connection_manager_path() -> CipPath {
    CipPath::new().class(class::CONNECTION_MANAGER).instance(1)
}

/// Lifecycle of the connected I/O exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

/// Snapshot of the connected I/O exchange, as returned by `get_status`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub target: Option<IpAddr>,
    pub consumed_instance: u32,
    pub produced_instance: u32,
    /// O->T data size in bytes, excluding sequence and run/idle headers
    pub assembly_data_size_consumed: usize,
    /// T->O data size in bytes, excluding the sequence count
    pub assembly_data_size_produced: usize,
    pub rpi: Duration,
    pub exclusive_owner: bool,
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    /// Buffer the next tick transmits
    pub last_sent: Vec<u8>,
    pub last_received: Vec<u8>,
    pub last_received_len: usize,
    pub last_packet_at: Option<Instant>,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// RPI intervals since the last accepted datagram
    pub consecutive_misses: u32,
    pub stale: bool,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }
}

/// Parameters of `open_connection`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub ip: IpAddr,
    /// O->T assembly instance
    pub consumed_instance: u32,
    /// T->O assembly instance
    pub produced_instance: u32,
    /// O->T data bytes; 0 reads the assembly to learn its size
    pub consumed_size: usize,
    /// T->O data bytes; 0 reads the assembly to learn its size
    pub produced_size: usize,
    /// Configuration assembly instance named first in the connection path
    pub config_instance: u32,
    pub rpi: Duration,
    /// Point-to-point T->O when true, multicast otherwise
    pub exclusive_owner: bool,
    /// Budget for each explicit exchange made while opening
    pub timeout: Duration,
}

impl ConnectionRequest {
    pub fn new(ip: IpAddr, consumed_instance: u32, produced_instance: u32) -> Self {
        Self {
            ip,
            consumed_instance,
            produced_instance,
            consumed_size: 0,
            produced_size: 0,
            config_instance: 1,
            rpi: Duration::from_millis(100),
            exclusive_owner: true,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_sizes(mut self, consumed: usize, produced: usize) -> Self {
        self.consumed_size = consumed;
        self.produced_size = produced;
        self
    }

    pub fn with_rpi_ms(mut self, rpi_ms: u32) -> Self {
        self.rpi = Duration::from_millis(u64::from(rpi_ms));
        self
    }

    pub fn with_config_instance(mut self, instance: u32) -> Self {
        self.config_instance = instance;
        self
    }

    pub fn with_exclusive_owner(mut self, exclusive: bool) -> Self {
        self.exclusive_owner = exclusive;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        assembly::check_instance(self.consumed_instance)?;
        assembly::check_instance(self.produced_instance)?;
        assembly::check_instance(self.config_instance)?;
        if self.rpi < Duration::from_millis(1) {
            return Err(EtherNetIpError::InvalidArgument(
                "RPI must be at least 1 ms".to_string(),
            ));
        }
        rpi_micros(self.rpi)?;
        if self.timeout.is_zero() {
            return Err(EtherNetIpError::InvalidArgument(
                "Timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Assembly 4 / config instance / O->T point / T->O point
    pub fn connection_path(&self) -> CipPath {
        CipPath::new()
            .class(class::ASSEMBLY)
            .instance(self.config_instance)
            .connection_point(self.consumed_instance)
            .connection_point(self.produced_instance)
    }
}

/// Forward-Open request body
#[derive(Debug, Clone)]
pub struct ForwardOpen {
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub o_to_t_rpi: Duration,
    pub o_to_t_parameters: u16,
    pub t_to_o_rpi: Duration,
    pub t_to_o_parameters: u16,
    pub connection_path: CipPath,
}

impl ForwardOpen {
    /// Encodes the complete CIP request addressed to the connection manager
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path_words = self.connection_path.checked_words()?;
        let mut data = Vec::with_capacity(36 + self.connection_path.len());
        data.push(PRIORITY_TIME_TICK);
        data.push(TIMEOUT_TICKS);
        data.extend_from_slice(&self.o_to_t_connection_id.to_le_bytes());
        data.extend_from_slice(&self.t_to_o_connection_id.to_le_bytes());
        data.extend_from_slice(&self.connection_serial.to_le_bytes());
        data.extend_from_slice(&self.vendor_id.to_le_bytes());
        data.extend_from_slice(&self.originator_serial.to_le_bytes());
        data.push(TIMEOUT_MULTIPLIER);
        data.extend_from_slice(&[0x00, 0x00, 0x00]);
        data.extend_from_slice(&rpi_micros(self.o_to_t_rpi)?.to_le_bytes());
        data.extend_from_slice(&self.o_to_t_parameters.to_le_bytes());
        data.extend_from_slice(&rpi_micros(self.t_to_o_rpi)?.to_le_bytes());
        data.extend_from_slice(&self.t_to_o_parameters.to_le_bytes());
        data.push(TRANSPORT_CLASS1_CYCLIC);
        data.push(path_words);
        data.extend_from_slice(self.connection_path.as_bytes());
        cip::encode_request(service::FORWARD_OPEN, &connection_manager_path(), &data)
    }
}

/// Successful Forward-Open reply data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOpenReply {
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    /// Actual packet intervals granted by the target
    pub o_to_t_api: Duration,
    pub t_to_o_api: Duration,
}

impl ForwardOpenReply {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FORWARD_OPEN_REPLY_LEN {
            return Err(too_short(FORWARD_OPEN_REPLY_LEN, data.len()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
        Ok(Self {
            o_to_t_connection_id: u32_at(0),
            t_to_o_connection_id: u32_at(4),
            connection_serial: u16_at(8),
            vendor_id: u16_at(10),
            originator_serial: u32_at(12),
            o_to_t_api: Duration::from_micros(u64::from(u32_at(16))),
            t_to_o_api: Duration::from_micros(u64::from(u32_at(20))),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FORWARD_OPEN_REPLY_LEN);
        out.extend_from_slice(&self.o_to_t_connection_id.to_le_bytes());
        out.extend_from_slice(&self.t_to_o_connection_id.to_le_bytes());
        out.extend_from_slice(&self.connection_serial.to_le_bytes());
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.originator_serial.to_le_bytes());
        out.extend_from_slice(&(self.o_to_t_api.as_micros() as u32).to_le_bytes());
        out.extend_from_slice(&(self.t_to_o_api.as_micros() as u32).to_le_bytes());
        out.push(0x00); // application reply size
        out.push(0x00);
        out
    }
}

/// Forward-Close request for a connection opened with the same triad and path
pub fn encode_forward_close(
    connection_serial: u16,
    vendor_id: u16,
    originator_serial: u32,
    connection_path: &CipPath,
) -> Result<Vec<u8>> {
    let path_words = connection_path.checked_words()?;
    let mut data = Vec::with_capacity(12 + connection_path.len());
    data.push(PRIORITY_TIME_TICK);
    data.push(TIMEOUT_TICKS);
    data.extend_from_slice(&connection_serial.to_le_bytes());
    data.extend_from_slice(&vendor_id.to_le_bytes());
    data.extend_from_slice(&originator_serial.to_le_bytes());
    data.push(path_words);
    data.push(0x00); // reserved
    data.extend_from_slice(connection_path.as_bytes());
    cip::encode_request(service::FORWARD_CLOSE, &connection_manager_path(), &data)
}

/// Sockaddr info item body: big-endian family, port and address, 8 zero bytes
pub fn encode_sockaddr(addr: SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(SOCKADDR_LEN);
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&addr.port().to_be_bytes());
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&[0u8; 8]);
    out
}

pub fn decode_sockaddr(data: &[u8]) -> Result<SocketAddrV4> {
    if data.len() < SOCKADDR_LEN {
        return Err(too_short(SOCKADDR_LEN, data.len()));
    }
    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
    Ok(SocketAddrV4::new(ip, port))
}

/// One cyclic I/O datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoPacket {
    pub connection_id: u32,
    pub sequence: u32,
    pub cip_sequence: u16,
    /// Present on O->T datagrams only
    pub run_idle: Option<u32>,
    pub data: Vec<u8>,
}

impl IoPacket {
    pub fn encode(&self) -> Vec<u8> {
        let header_len = SEQUENCE_LEN + if self.run_idle.is_some() { RUN_IDLE_LEN } else { 0 };
        let data_len = header_len + self.data.len();
        let mut out = Vec::with_capacity(14 + 4 + data_len);
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&item::SEQUENCED_ADDRESS.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&self.connection_id.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&item::CONNECTED_DATA.to_le_bytes());
        out.extend_from_slice(&(data_len as u16).to_le_bytes());
        out.extend_from_slice(&self.cip_sequence.to_le_bytes());
        if let Some(run_idle) = self.run_idle {
            out.extend_from_slice(&run_idle.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Decodes a datagram; `with_run_idle` selects the O->T layout
    pub fn decode(datagram: &[u8], with_run_idle: bool) -> Result<Self> {
        let items = cip::decode_cpf(datagram, 0)?;
        let address = items
            .iter()
            .find(|i| i.type_id == item::SEQUENCED_ADDRESS)
            .ok_or_else(|| {
                EtherNetIpError::MalformedResponse("I/O datagram has no sequenced address item".to_string())
            })?;
        if address.data.len() < 8 {
            return Err(too_short(8, address.data.len()));
        }
        let connected = items
            .iter()
            .find(|i| i.type_id == item::CONNECTED_DATA)
            .ok_or_else(|| {
                EtherNetIpError::MalformedResponse("I/O datagram has no connected data item".to_string())
            })?;
        let header_len = SEQUENCE_LEN + if with_run_idle { RUN_IDLE_LEN } else { 0 };
        if connected.data.len() < header_len {
            return Err(too_short(header_len, connected.data.len()));
        }
        let d = &connected.data;
        let a = &address.data;
        Ok(Self {
            connection_id: u32::from_le_bytes([a[0], a[1], a[2], a[3]]),
            sequence: u32::from_le_bytes([a[4], a[5], a[6], a[7]]),
            cip_sequence: u16::from_le_bytes([d[0], d[1]]),
            run_idle: with_run_idle.then(|| u32::from_le_bytes([d[2], d[3], d[4], d[5]])),
            data: d[header_len..].to_vec(),
        })
    }
}

fn lock_state(state: &StdMutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0x4E49_5053)
}

/// Applies the Forward-Open reply's sockaddr items: the O->T item names where
/// datagrams go, a multicast T->O item is joined on `socket`.
fn reply_destination(socket: &UdpSocket, target: IpAddr, items: &[CpfItem]) -> Result<SocketAddr> {
    let mut destination = SocketAddr::new(target, DEFAULT_IO_PORT);
    for entry in items {
        match entry.type_id {
            item::SOCKADDR_O_T => {
                let addr = decode_sockaddr(&entry.data)?;
                let ip = if addr.ip().is_unspecified() {
                    target
                } else {
                    IpAddr::V4(*addr.ip())
                };
                destination = SocketAddr::new(ip, addr.port());
            }
            item::SOCKADDR_T_O => {
                let addr = decode_sockaddr(&entry.data)?;
                if addr.ip().is_multicast() {
                    socket.join_multicast_v4(*addr.ip(), Ipv4Addr::UNSPECIFIED)?;
                    debug!("Joined multicast group {}", addr.ip());
                }
            }
            other => trace!("Ignoring Forward-Open reply item 0x{:04X}", other),
        }
    }
    Ok(destination)
}

struct ActiveConnection {
    target: SocketAddr,
    connection_serial: u16,
    connection_path: CipPath,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the cyclic task needs; owned by the task
struct CyclicLink {
    socket: UdpSocket,
    destination: SocketAddr,
    target: IpAddr,
    o_to_t_connection_id: u32,
    t_to_o_connection_id: u32,
    rpi: Duration,
    stale_threshold: u32,
    auto_close: bool,
    state: Arc<StdMutex<ConnectionState>>,
    events: EventBus,
}

impl CyclicLink {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.rpi);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut sequence: u32 = 0;
        let mut heard = false;
        let mut first_tick = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !first_tick && self.end_interval(heard) {
                        break;
                    }
                    first_tick = false;
                    heard = false;
                    sequence = sequence.wrapping_add(1);
                    self.transmit(sequence).await;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if self.accept(&buf[..len], from) {
                            heard = true;
                        }
                    }
                    Err(e) => debug!("I/O receive from {} failed: {}", self.target, e),
                },
            }
        }
        debug!("Cyclic I/O task for {} stopped", self.target);
    }

    async fn transmit(&self, sequence: u32) {
        let data = lock_state(&self.state).last_sent.clone();
        let packet = IoPacket {
            connection_id: self.o_to_t_connection_id,
            sequence,
            cip_sequence: sequence as u16,
            run_idle: Some(RUN_IDLE_RUN),
            data,
        };
        match self.socket.send_to(&packet.encode(), self.destination).await {
            Ok(_) => lock_state(&self.state).packets_sent += 1,
            Err(e) => warn!("I/O send to {} failed: {}", self.destination, e),
        }
    }

    /// Records a datagram addressed to this connection. Returns false for foreign or broken ones.
    fn accept(&self, datagram: &[u8], from: SocketAddr) -> bool {
        if from.ip() != self.target {
            trace!("Ignoring I/O datagram from foreign source {}", from);
            return false;
        }
        let packet = match IoPacket::decode(datagram, false) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Ignoring malformed I/O datagram from {}: {}", from, e);
                return false;
            }
        };
        if packet.connection_id != self.t_to_o_connection_id {
            trace!(
                "Ignoring datagram for connection 0x{:08X} from {}",
                packet.connection_id,
                from
            );
            return false;
        }

        let recovered = {
            let mut state = lock_state(&self.state);
            state.last_received_len = packet.data.len();
            state.last_received = packet.data;
            state.last_packet_at = Some(Instant::now());
            state.packets_received += 1;
            state.consecutive_misses = 0;
            std::mem::replace(&mut state.stale, false)
        };
        if recovered {
            info!("Connected I/O with {} recovered", self.target);
            self.events
                .publish(ScannerEvent::ConnectionRecovered { target: self.target });
        }
        true
    }

    /// Closes one RPI interval. Returns true when the task should stop.
    fn end_interval(&self, heard: bool) -> bool {
        if heard {
            return false;
        }
        let missed = {
            let mut state = lock_state(&self.state);
            state.consecutive_misses += 1;
            if state.consecutive_misses < self.stale_threshold || state.stale {
                return false;
            }
            state.stale = true;
            if self.auto_close {
                state.phase = ConnectionPhase::Closed;
            }
            state.consecutive_misses
        };

        warn!(
            "Connected I/O with {} is stale after {} missed intervals",
            self.target, missed
        );
        self.events.publish(ScannerEvent::ConnectionStale {
            target: self.target,
            missed,
        });
        if self.auto_close {
            self.events.publish(ScannerEvent::ConnectionClosed {
                target: self.target,
                reason: CloseReason::Stale,
            });
        }
        self.auto_close
    }
}

/// Owns the (single) connected I/O exchange of a scanner.
///
/// Opening and closing run explicit exchanges; the datagram loop runs on its
/// own task and shares only the state snapshot with callers.
pub struct ConnectionManager {
    config: ScannerConfig,
    events: EventBus,
    state: Arc<StdMutex<ConnectionState>>,
    active: Mutex<Option<ActiveConnection>>,
    next_serial: AtomicU16,
    next_connection_id: AtomicU32,
}

impl ConnectionManager {
    pub fn new(config: ScannerConfig, events: EventBus) -> Self {
        let seed = seed();
        Self {
            config,
            events,
            state: Arc::new(StdMutex::new(ConnectionState::default())),
            active: Mutex::new(None),
            next_serial: AtomicU16::new(seed as u16),
            next_connection_id: AtomicU32::new(seed | 1),
        }
    }

    /// Non-blocking snapshot of the exchange
    pub fn status(&self) -> ConnectionState {
        lock_state(&self.state).clone()
    }

    /// Replaces the buffer the next tick transmits
    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        let mut state = lock_state(&self.state);
        if !state.is_open() {
            return Err(EtherNetIpError::InvalidArgument(
                "No connected I/O exchange is open".to_string(),
            ));
        }
        if data.len() != state.assembly_data_size_consumed {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "Output data is {} bytes, the connection carries {}",
                data.len(),
                state.assembly_data_size_consumed
            )));
        }
        state.last_sent.clear();
        state.last_sent.extend_from_slice(data);
        Ok(())
    }

    /// Negotiates a connection and starts the cyclic task
    pub async fn open(&self, request: &ConnectionRequest) -> Result<()> {
        request.validate()?;
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if !existing.task.is_finished() {
                return Err(EtherNetIpError::InvalidArgument(format!(
                    "A connected I/O exchange with {} is already open",
                    existing.target.ip()
                )));
            }
        }
        // The task stopped on its own (stale auto-close); release it on the target
        if let Some(stopped) = active.take() {
            if let Err(e) = self
                .forward_close(
                    stopped.target,
                    stopped.connection_serial,
                    &stopped.connection_path,
                    request.timeout,
                )
                .await
            {
                debug!("Forward-Close of stopped connection to {} failed: {}", stopped.target.ip(), e);
            }
        }

        *lock_state(&self.state) = ConnectionState {
            phase: ConnectionPhase::Opening,
            target: Some(request.ip),
            consumed_instance: request.consumed_instance,
            produced_instance: request.produced_instance,
            rpi: request.rpi,
            exclusive_owner: request.exclusive_owner,
            ..ConnectionState::default()
        };

        match self.establish(request).await {
            Ok(connection) => {
                *active = Some(connection);
                Ok(())
            }
            Err(e) => {
                *lock_state(&self.state) = ConnectionState::default();
                Err(e)
            }
        }
    }

    async fn establish(&self, request: &ConnectionRequest) -> Result<ActiveConnection> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.io_port,
        ))
        .await?;
        let local_port = socket.local_addr()?.port();

        let target = SocketAddr::new(request.ip, self.config.port);
        let mut session = Session::open(target, request.timeout, self.config.max_response_size).await?;
        let negotiated = self.negotiate(&mut session, request, local_port).await;
        if let Err(e) = session.close(request.timeout).await {
            debug!("Closing session after Forward-Open failed: {}", e);
        }
        let (reply, serial, consumed_size, produced_size, extra) = negotiated?;

        let destination = match reply_destination(&socket, request.ip, &extra) {
            Ok(destination) => destination,
            Err(e) => {
                // The target already holds the connection
                warn!("Unusable Forward-Open reply from {}: {}; closing", request.ip, e);
                if let Err(close) = self
                    .forward_close(target, serial, &request.connection_path(), request.timeout)
                    .await
                {
                    debug!("Forward-Close after rejected reply failed: {}", close);
                }
                return Err(e);
            }
        };

        {
            let mut state = lock_state(&self.state);
            state.phase = ConnectionPhase::Open;
            state.assembly_data_size_consumed = consumed_size;
            state.assembly_data_size_produced = produced_size;
            state.o_to_t_connection_id = reply.o_to_t_connection_id;
            state.t_to_o_connection_id = reply.t_to_o_connection_id;
            state.last_sent = vec![0u8; consumed_size];
        }

        info!(
            "Connected I/O with {} open: O->T 0x{:08X} ({} bytes), T->O 0x{:08X} ({} bytes), RPI {:?}",
            request.ip,
            reply.o_to_t_connection_id,
            consumed_size,
            reply.t_to_o_connection_id,
            produced_size,
            request.rpi
        );
        self.events.publish(ScannerEvent::ConnectionOpened {
            target: request.ip,
            o_to_t_connection_id: reply.o_to_t_connection_id,
            t_to_o_connection_id: reply.t_to_o_connection_id,
        });

        let link = CyclicLink {
            socket,
            destination,
            target: request.ip,
            o_to_t_connection_id: reply.o_to_t_connection_id,
            t_to_o_connection_id: reply.t_to_o_connection_id,
            rpi: request.rpi,
            stale_threshold: self.config.stale_threshold,
            auto_close: self.config.auto_close_on_stale,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(link.run(cancel.clone()));

        Ok(ActiveConnection {
            target,
            connection_serial: serial,
            connection_path: request.connection_path(),
            cancel,
            task,
        })
    }

    /// Sizes the connection (reading assemblies for zero sizes) and sends the Forward-Open
    async fn negotiate(
        &self,
        session: &mut Session,
        request: &ConnectionRequest,
        local_port: u16,
    ) -> Result<(ForwardOpenReply, u16, usize, usize, Vec<CpfItem>)> {
        let consumed_size = self
            .resolve_size(session, request.consumed_instance, request.consumed_size, request.timeout)
            .await?;
        let produced_size = self
            .resolve_size(session, request.produced_instance, request.produced_size, request.timeout)
            .await?;

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let forward_open = ForwardOpen {
            o_to_t_connection_id: 0,
            t_to_o_connection_id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            connection_serial: serial,
            vendor_id: self.config.originator_vendor_id,
            originator_serial: self.config.originator_serial,
            o_to_t_rpi: request.rpi,
            o_to_t_parameters: network_parameters(consumed_size + SEQUENCE_LEN + RUN_IDLE_LEN, true)?,
            t_to_o_rpi: request.rpi,
            t_to_o_parameters: network_parameters(produced_size + SEQUENCE_LEN, request.exclusive_owner)?,
            connection_path: request.connection_path(),
        };

        let mut extra = Vec::new();
        if local_port != DEFAULT_IO_PORT {
            extra.push(CpfItem::new(
                item::SOCKADDR_T_O,
                encode_sockaddr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port)),
            ));
        }

        debug!(
            "Forward-Open to {} serial 0x{:04X}, path {:02X?}",
            request.ip,
            serial,
            forward_open.connection_path.as_bytes()
        );
        let encoded = forward_open.encode()?;
        let (response, items) = cip::exchange_cip_with(session, &encoded, &extra, request.timeout).await?;
        cip::check_reply_service(service::FORWARD_OPEN, &response)?;
        let response = response.into_result()?;
        let reply = ForwardOpenReply::decode(&response.data)?;
        if reply.connection_serial != serial {
            return Err(EtherNetIpError::MalformedResponse(format!(
                "Forward-Open reply names connection serial 0x{:04X}, expected 0x{:04X}",
                reply.connection_serial, serial
            )));
        }
        Ok((reply, serial, consumed_size, produced_size, items))
    }

    async fn resolve_size(
        &self,
        session: &mut Session,
        instance: u32,
        requested: usize,
        budget: Duration,
    ) -> Result<usize> {
        if requested != 0 {
            return Ok(requested);
        }
        let size = assembly::read_data(session, instance, budget).await?.len();
        if size == 0 {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "Assembly {} returned no data; give its size explicitly",
                instance
            )));
        }
        debug!("Assembly {} auto-sized to {} bytes", instance, size);
        Ok(size)
    }

    /// Stops the cyclic task and sends Forward-Close. Closing when nothing is open succeeds.
    pub async fn close(&self, budget: Duration) -> Result<()> {
        self.close_with(CloseReason::Requested, budget).await
    }

    pub(crate) async fn close_with(&self, reason: CloseReason, budget: Duration) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(connection) = active.take() else {
            debug!("Close requested with no connected I/O open");
            return Ok(());
        };
        let ActiveConnection {
            target,
            connection_serial,
            connection_path,
            cancel,
            mut task,
        } = connection;

        let already_closed = {
            let mut state = lock_state(&self.state);
            let closed = state.phase == ConnectionPhase::Closed;
            state.phase = ConnectionPhase::Closing;
            closed
        };

        cancel.cancel();
        if time::timeout(self.config.close_grace(), &mut task).await.is_err() {
            warn!(
                "Cyclic I/O task for {} did not stop within {:?}; aborting it",
                target.ip(),
                self.config.close_grace()
            );
            task.abort();
        }

        let result = self
            .forward_close(target, connection_serial, &connection_path, budget)
            .await;
        if let Err(e) = &result {
            warn!("Forward-Close to {} failed: {}", target.ip(), e);
        }

        *lock_state(&self.state) = ConnectionState::default();
        if !already_closed {
            self.events.publish(ScannerEvent::ConnectionClosed {
                target: target.ip(),
                reason,
            });
        }
        info!("Connected I/O with {} closed", target.ip());
        result
    }

    async fn forward_close(
        &self,
        target: SocketAddr,
        connection_serial: u16,
        connection_path: &CipPath,
        budget: Duration,
    ) -> Result<()> {
        let request = encode_forward_close(
            connection_serial,
            self.config.originator_vendor_id,
            self.config.originator_serial,
            connection_path,
        )?;
        let mut session = Session::open(target, budget, self.config.max_response_size).await?;
        let result = match cip::exchange_cip(&mut session, &request, budget).await {
            Ok((response, _)) => cip::check_reply_service(service::FORWARD_CLOSE, &response)
                .and_then(|_| response.into_result())
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = session.close(budget).await {
            debug!("Closing session after Forward-Close failed: {}", e);
        }
        result
    }
}
