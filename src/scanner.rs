// scanner.rs - Engine handle
// =========================================================================
//
// One `Scanner` owns the configuration, the event channel and the connected
// I/O manager. Explicit operations (discovery, assembly, tag, vendor) open a
// session, make one request and close it again; they queue on a single
// engine-wide lock so at most one explicit exchange is in flight. The cyclic
// I/O task never takes that lock.

use crate::assembly::{self, AssemblyResult};
use crate::config::ScannerConfig;
use crate::discovery::{self, DeviceIdentity};
use crate::encap::Session;
use crate::error::{EtherNetIpError, Result};
use crate::events::{CloseReason, EventBus, ScannerEvent};
use crate::implicit::{ConnectionManager, ConnectionRequest, ConnectionState};
#[cfg(feature = "tags")]
use crate::tag::{self, TagResult, TagValue};
use crate::vendor::{
    self, Alarm, AlarmCategory, AxisData, ControllerStatus, JobInfo, RobotPosition, VariableKind,
    VariableValue,
};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Future returned by the per-session body of an explicit operation
type SessionFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 's>>;

/// An explicit exchange holding the engine lock
struct Exchange<'a> {
    _guard: MutexGuard<'a, ()>,
    events: &'a EventBus,
    target: IpAddr,
    operation: &'static str,
    started: Instant,
}

impl Exchange<'_> {
    fn finish<T>(self, result: Result<T>) -> Result<T> {
        self.events.publish(ScannerEvent::ExchangeFinished {
            target: self.target,
            operation: self.operation,
            success: result.is_ok(),
            elapsed: self.started.elapsed(),
        });
        if let Err(e) = &result {
            debug!("{} on {} failed: {}", self.operation, self.target, e);
        }
        result
    }
}

/// EtherNet/IP scanner engine.
///
/// Create one per application and share it (for example in an `Arc`). All
/// operations take `&self`.
///
/// # Examples
///
/// ```no_run
/// use enip_scanner::{Scanner, ScannerConfig};
/// use std::time::Duration;
///
/// # async fn demo() -> enip_scanner::Result<()> {
/// let scanner = Scanner::new(ScannerConfig::default())?;
/// let ip = "192.168.1.50".parse().unwrap();
///
/// let inputs = scanner.read_assembly(ip, 100, Duration::from_secs(2)).await?;
/// println!("{} bytes in {:?}", inputs.len(), inputs.rtt);
///
/// scanner.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Scanner {
    config: ScannerConfig,
    events: EventBus,
    explicit: Mutex<()>,
    shut_down: AtomicBool,
    io: ConnectionManager,
}

impl Scanner {
    /// Validates `config` and builds the engine
    pub fn new(config: ScannerConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        let io = ConnectionManager::new(config.clone(), events.clone());
        info!(
            "EtherNet/IP scanner ready (port {}, I/O port {})",
            config.port, config.io_port
        );
        Ok(Self {
            config,
            events,
            explicit: Mutex::new(()),
            shut_down: AtomicBool::new(false),
            io,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Receives [`ScannerEvent`]s published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Closes any connected I/O and refuses further operations with `NotInitialized`.
    ///
    /// Waits for the explicit exchange in flight, if any.
    pub async fn shutdown(&self) {
        {
            let _guard = self.explicit.lock().await;
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let budget = self.config.close_grace();
        if let Err(e) = self.io.close_with(CloseReason::Shutdown, budget).await {
            debug!("Connected I/O close during shutdown failed: {}", e);
        }
        info!("EtherNet/IP scanner shut down");
    }

    fn target(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.config.port)
    }

    async fn begin(&self, target: IpAddr, operation: &'static str) -> Result<Exchange<'_>> {
        let guard = self.explicit.lock().await;
        if self.is_shut_down() {
            return Err(EtherNetIpError::NotInitialized);
        }
        self.events
            .publish(ScannerEvent::ExchangeStarted { target, operation });
        Ok(Exchange {
            _guard: guard,
            events: &self.events,
            target,
            operation,
            started: Instant::now(),
        })
    }

    /// Runs `call` inside a session opened for this one operation
    async fn explicit<T, F>(
        &self,
        ip: IpAddr,
        operation: &'static str,
        budget: Duration,
        call: F,
    ) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> SessionFuture<'s, T>,
    {
        let exchange = self.begin(ip, operation).await?;
        let mut session = match Session::open(self.target(ip), budget, self.config.max_response_size).await {
            Ok(session) => session,
            Err(e) => return exchange.finish(Err(e)),
        };
        let result = call(&mut session).await;
        if let Err(e) = session.close(budget).await {
            debug!("Unregistering session with {} failed: {}", ip, e);
        }
        exchange.finish(result)
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Opens and registers a session the caller owns.
    ///
    /// The caller must hand it back to [`Scanner::unregister_session`].
    #[instrument(skip(self), level = "debug")]
    pub async fn register_session(&self, ip: IpAddr, timeout: Duration) -> Result<Session> {
        let exchange = self.begin(ip, "register_session").await?;
        let result = Session::open(self.target(ip), timeout, self.config.max_response_size).await;
        exchange.finish(result)
    }

    #[instrument(skip(self, session), fields(ip = %session.target().ip()), level = "debug")]
    pub async fn unregister_session(&self, session: Session, timeout: Duration) -> Result<()> {
        let exchange = self.begin(session.target().ip(), "unregister_session").await?;
        let result = session.close(timeout).await;
        exchange.finish(result)
    }

    // ---------------------------------------------------------------------
    // Discovery
    // ---------------------------------------------------------------------

    /// ListIdentity to each candidate address; at most `max_count` records
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn scan_devices(
        &self,
        candidates: &[SocketAddr],
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<DeviceIdentity>> {
        let exchange = self
            .begin(IpAddr::V4(Ipv4Addr::UNSPECIFIED), "scan_devices")
            .await?;
        exchange.finish(discovery::scan(candidates, max_count, timeout).await)
    }

    /// Like [`Scanner::scan_devices`] on the configured port of each host
    pub async fn scan_hosts(
        &self,
        hosts: &[IpAddr],
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<DeviceIdentity>> {
        let candidates: Vec<SocketAddr> = hosts.iter().map(|ip| self.target(*ip)).collect();
        self.scan_devices(&candidates, max_count, timeout).await
    }

    /// One ListIdentity datagram to 255.255.255.255
    pub async fn scan_broadcast(&self, max_count: usize, timeout: Duration) -> Result<Vec<DeviceIdentity>> {
        let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.config.port);
        self.scan_devices(&[broadcast], max_count, timeout).await
    }

    /// Identity of one device, queried over TCP
    #[instrument(skip(self), level = "debug")]
    pub async fn identify(&self, ip: IpAddr, timeout: Duration) -> Result<DeviceIdentity> {
        let exchange = self.begin(ip, "identify").await?;
        let result = discovery::identify(self.target(ip), timeout, self.config.max_response_size).await;
        exchange.finish(result)
    }

    /// Probes `max_instances` assembly instances from the configured start
    #[instrument(skip(self))]
    pub async fn discover_assemblies(
        &self,
        ip: IpAddr,
        max_instances: u32,
        timeout: Duration,
    ) -> Result<Vec<u32>> {
        let exchange = self.begin(ip, "discover_assemblies").await?;
        let result = discovery::discover_assemblies(
            self.target(ip),
            self.config.assembly_probe_start,
            max_instances,
            timeout,
            self.config.max_response_size,
        )
        .await;
        exchange.finish(result)
    }

    // ---------------------------------------------------------------------
    // Assemblies
    // ---------------------------------------------------------------------

    #[instrument(skip(self), level = "debug")]
    pub async fn read_assembly(&self, ip: IpAddr, instance: u32, timeout: Duration) -> Result<AssemblyResult> {
        assembly::check_instance(instance)?;
        self.explicit(ip, "read_assembly", timeout, move |session| {
            Box::pin(async move {
                let started = Instant::now();
                let data = assembly::read_data(session, instance, timeout).await;
                data.map(|data| AssemblyResult {
                    ip,
                    instance,
                    data,
                    rtt: started.elapsed(),
                })
            })
        })
        .await
    }

    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub async fn write_assembly(&self, ip: IpAddr, instance: u32, data: &[u8], timeout: Duration) -> Result<()> {
        assembly::check_instance(instance)?;
        let data = data.to_vec();
        self.explicit(ip, "write_assembly", timeout, move |session| {
            Box::pin(async move { assembly::write_data(session, instance, &data, timeout).await })
        })
        .await
    }

    /// Asks the device whether the assembly's data attribute accepts writes
    #[instrument(skip(self), level = "debug")]
    pub async fn is_assembly_writable(&self, ip: IpAddr, instance: u32, timeout: Duration) -> Result<bool> {
        assembly::check_instance(instance)?;
        self.explicit(ip, "is_assembly_writable", timeout, move |session| {
            Box::pin(assembly::probe_writable(session, instance, timeout))
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Tags
    // ---------------------------------------------------------------------

    /// Reads one element of a symbolic tag, routed through the configured backplane path
    #[cfg(feature = "tags")]
    #[instrument(skip(self), level = "debug")]
    pub async fn read_tag(&self, ip: IpAddr, tag: &str, timeout: Duration) -> Result<TagResult> {
        tag::tag_path(tag)?;
        let route = self.config.route.clone();
        let tag = tag.to_string();
        self.explicit(ip, "read_tag", timeout, move |session| {
            Box::pin(async move {
                let started = Instant::now();
                let reply = tag::read(session, &tag, route.as_ref(), timeout).await;
                reply.map(|(cip_type, structure_handle, data)| TagResult {
                    ip,
                    tag,
                    data,
                    cip_type,
                    structure_handle,
                    rtt: started.elapsed(),
                })
            })
        })
        .await
    }

    /// Writes raw element bytes with an explicit CIP type code
    #[cfg(feature = "tags")]
    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub async fn write_tag_raw(
        &self,
        ip: IpAddr,
        tag: &str,
        data: &[u8],
        cip_type: u16,
        timeout: Duration,
    ) -> Result<()> {
        let request = tag::build_write_request(tag, data, cip_type)?;
        debug!("Tag write request is {} bytes", request.len());
        let route = self.config.route.clone();
        let tag = tag.to_string();
        let data = data.to_vec();
        self.explicit(ip, "write_tag", timeout, move |session| {
            Box::pin(async move { tag::write(session, &tag, &data, cip_type, route.as_ref(), timeout).await })
        })
        .await
    }

    #[cfg(feature = "tags")]
    pub async fn write_tag(&self, ip: IpAddr, tag: &str, value: &TagValue, timeout: Duration) -> Result<()> {
        let data = value.to_bytes()?;
        self.write_tag_raw(ip, tag, &data, value.cip_type().code(), timeout)
            .await
    }

    // ---------------------------------------------------------------------
    // Connected I/O
    // ---------------------------------------------------------------------

    /// Forward-Open and start the cyclic exchange.
    ///
    /// Zero sizes in `request` are resolved by reading the assemblies first.
    #[instrument(skip(self, request), fields(ip = %request.ip))]
    pub async fn open_connection(&self, request: &ConnectionRequest) -> Result<()> {
        let exchange = self.begin(request.ip, "open_connection").await?;
        exchange.finish(self.io.open(request).await)
    }

    /// Replaces the output data sent on the next RPI tick
    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        if self.is_shut_down() {
            return Err(EtherNetIpError::NotInitialized);
        }
        self.io.write_data(data)
    }

    /// Snapshot of the connected I/O exchange
    pub fn get_status(&self) -> ConnectionState {
        self.io.status()
    }

    /// Stops the cyclic task and sends Forward-Close
    #[instrument(skip(self))]
    pub async fn close_connection(&self, timeout: Duration) -> Result<()> {
        let target = self
            .io
            .status()
            .target
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let exchange = self.begin(target, "close_connection").await?;
        exchange.finish(self.io.close(timeout).await)
    }

    // ---------------------------------------------------------------------
    // Vendor classes
    // ---------------------------------------------------------------------

    pub async fn read_controller_status(&self, ip: IpAddr, timeout: Duration) -> Result<ControllerStatus> {
        self.explicit(ip, "read_controller_status", timeout, move |session| {
            Box::pin(vendor::read_status(session, timeout))
        })
        .await
    }

    /// Current alarm in `slot` (1..=4)
    pub async fn read_alarm(&self, ip: IpAddr, slot: u32, timeout: Duration) -> Result<Alarm> {
        self.explicit(ip, "read_alarm", timeout, move |session| {
            Box::pin(vendor::read_alarm(session, slot, timeout))
        })
        .await
    }

    pub async fn read_alarm_history(
        &self,
        ip: IpAddr,
        category: AlarmCategory,
        index: u32,
        timeout: Duration,
    ) -> Result<Alarm> {
        category.instance(index)?;
        self.explicit(ip, "read_alarm_history", timeout, move |session| {
            Box::pin(vendor::read_alarm_history(session, category, index, timeout))
        })
        .await
    }

    pub async fn read_job_info(&self, ip: IpAddr, timeout: Duration) -> Result<JobInfo> {
        self.explicit(ip, "read_job_info", timeout, move |session| {
            Box::pin(vendor::read_job_info(session, timeout))
        })
        .await
    }

    pub async fn read_position(&self, ip: IpAddr, group: u32, timeout: Duration) -> Result<RobotPosition> {
        self.explicit(ip, "read_position", timeout, move |session| {
            Box::pin(vendor::read_position(session, group, timeout))
        })
        .await
    }

    pub async fn read_position_deviation(&self, ip: IpAddr, group: u32, timeout: Duration) -> Result<AxisData> {
        self.explicit(ip, "read_position_deviation", timeout, move |session| {
            Box::pin(vendor::read_position_deviation(session, group, timeout))
        })
        .await
    }

    pub async fn read_torque(&self, ip: IpAddr, group: u32, timeout: Duration) -> Result<AxisData> {
        self.explicit(ip, "read_torque", timeout, move |session| {
            Box::pin(vendor::read_torque(session, group, timeout))
        })
        .await
    }

    /// Byte of eight I/O points containing `signal`
    pub async fn read_io(&self, ip: IpAddr, signal: u32, timeout: Duration) -> Result<u8> {
        self.explicit(ip, "read_io", timeout, move |session| {
            Box::pin(vendor::read_io(session, signal, timeout))
        })
        .await
    }

    pub async fn write_io(&self, ip: IpAddr, signal: u32, value: u8, timeout: Duration) -> Result<()> {
        self.explicit(ip, "write_io", timeout, move |session| {
            Box::pin(vendor::write_io(session, signal, value, timeout))
        })
        .await
    }

    pub async fn read_register(&self, ip: IpAddr, number: u32, timeout: Duration) -> Result<u16> {
        let direct = self.config.instance_direct;
        self.explicit(ip, "read_register", timeout, move |session| {
            Box::pin(vendor::read_register(session, number, direct, timeout))
        })
        .await
    }

    pub async fn write_register(&self, ip: IpAddr, number: u32, value: u16, timeout: Duration) -> Result<()> {
        let direct = self.config.instance_direct;
        self.explicit(ip, "write_register", timeout, move |session| {
            Box::pin(vendor::write_register(session, number, value, direct, timeout))
        })
        .await
    }

    /// Reads a B/I/D/R/S/P variable; the instance follows `instance_direct`
    pub async fn read_variable(
        &self,
        ip: IpAddr,
        kind: VariableKind,
        number: u32,
        timeout: Duration,
    ) -> Result<VariableValue> {
        let direct = self.config.instance_direct;
        self.explicit(ip, "read_variable", timeout, move |session| {
            Box::pin(vendor::read_variable(session, kind, number, direct, timeout))
        })
        .await
    }

    pub async fn write_variable(
        &self,
        ip: IpAddr,
        number: u32,
        value: &VariableValue,
        timeout: Duration,
    ) -> Result<()> {
        let direct = self.config.instance_direct;
        let value = value.clone();
        self.explicit(ip, "write_variable", timeout, move |session| {
            Box::pin(async move { vendor::write_variable(session, number, &value, direct, timeout).await })
        })
        .await
    }
}
