// config.rs - Scanner configuration
// =========================================================================
//
// `ScannerConfig` carries every engine-wide setting and loads from JSON.

use crate::error::{EtherNetIpError, Result};
use crate::path::PortSegment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default EtherNet/IP encapsulation port (TCP explicit messaging and UDP ListIdentity)
pub const DEFAULT_ENIP_PORT: u16 = 44818;

/// Default UDP port for class 1 connected I/O
pub const DEFAULT_IO_PORT: u16 = 2222;

/// Default largest encapsulation reply accepted from a device.
///
/// Unconnected explicit messages carry at most 504 bytes of CIP payload;
/// large Forward-Open connections go up to 4002. 4096 leaves room for both
/// plus the encapsulation and CPF envelope.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 4096;

/// Scanner configuration.
///
/// Every field has a default, so a JSON document only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Encapsulation port on the target devices
    pub port: u16,
    /// Local UDP port for cyclic I/O (0 picks an ephemeral port)
    pub io_port: u16,
    /// Largest encapsulation reply accepted, in bytes
    pub max_response_size: usize,
    /// Vendor variables and registers use instance == number instead of number + 1
    pub instance_direct: bool,
    /// Consecutive missed RPI ticks before a connection is reported stale
    pub stale_threshold: u32,
    /// Close the connection once it goes stale instead of only reporting it
    pub auto_close_on_stale: bool,
    /// How long close waits for the cyclic task before aborting it, in milliseconds
    pub close_grace_ms: u64,
    /// Vendor ID presented in Forward-Open requests
    pub originator_vendor_id: u16,
    /// Serial number presented in Forward-Open requests
    pub originator_serial: u32,
    /// First assembly instance probed by assembly discovery
    pub assembly_probe_start: u32,
    /// Backplane route applied to tag requests
    pub route: Option<PortSegment>,
    /// Depth of the scanner event channel
    pub event_capacity: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_ENIP_PORT,
            io_port: DEFAULT_IO_PORT,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            instance_direct: false,
            stale_threshold: 3,
            auto_close_on_stale: false,
            close_grace_ms: 500,
            originator_vendor_id: 0x1337,
            originator_serial: 0x1234_5678,
            assembly_probe_start: 1,
            route: None,
            event_capacity: 64,
        }
    }
}

impl ScannerConfig {
    /// Parses a configuration from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EtherNetIpError::InvalidArgument(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks that the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(EtherNetIpError::InvalidArgument(
                "port must be non-zero".to_string(),
            ));
        }
        if self.max_response_size < crate::encap::ENCAP_HEADER_LEN + 16 {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "max_response_size {} is smaller than an encapsulation envelope",
                self.max_response_size
            )));
        }
        if self.stale_threshold == 0 {
            return Err(EtherNetIpError::InvalidArgument(
                "stale_threshold must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(EtherNetIpError::InvalidArgument(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(route) = &self.route {
            route
                .validate()
                .map_err(|e| EtherNetIpError::InvalidArgument(format!("Invalid route: {}", e)))?;
        }
        Ok(())
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_io_port(mut self, io_port: u16) -> Self {
        self.io_port = io_port;
        self
    }

    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Switch vendor variable/register addressing to instance == number
    pub fn with_instance_direct(mut self, direct: bool) -> Self {
        self.instance_direct = direct;
        self
    }

    pub fn with_stale_threshold(mut self, ticks: u32, auto_close: bool) -> Self {
        self.stale_threshold = ticks;
        self.auto_close_on_stale = auto_close;
        self
    }

    pub fn with_route(mut self, route: PortSegment) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_assembly_probe_start(mut self, first: u32) -> Self {
        self.assembly_probe_start = first;
        self
    }
}
