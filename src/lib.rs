// lib.rs - EtherNet/IP Scanner Engine
// =========================================================================
//
// # EtherNet/IP Scanner
//
// An EtherNet/IP (ENIP) originator speaking the Common Industrial Protocol
// (CIP) to PLCs, assembly-based I/O adapters and robot controllers, written
// on tokio.
//
// ## Features
//
// - **Discovery**: ListIdentity over UDP (unicast or broadcast) and TCP,
//   plus bounded probing of assembly instances
// - **Assemblies**: Get/Set of the data attribute and a zero-effect
//   writability probe
// - **Tags**: symbolic Read/Write Tag with optional backplane routing
//   (feature `tags`, on by default)
// - **Connected I/O**: Forward-Open/Close with a cyclic class 1 exchange,
//   stale detection and non-blocking status snapshots
// - **Vendor classes**: robot controller status, alarms, job, position,
//   I/O, registers and typed variables
//
// ## Layout
//
//   encap     ENIP header, session register/unregister, framing
//   path      CIP path segments and port routing
//   cip       request/reply codec, SendRRData envelope
//   discovery identity queries and assembly probing
//   assembly  assembly object access
//   tag       symbolic tag access and value codec
//   implicit  connected I/O state machine and cyclic task
//   vendor    vendor class accessors
//   scanner   the engine handle tying these together

//! EtherNet/IP + CIP scanner engine.
//!
//! Start with [`Scanner`]: build one from a [`ScannerConfig`], then call
//! its discovery, assembly, tag, connected I/O and vendor operations. Each
//! explicit operation opens its own session and closes it before returning.
//!
//! ```no_run
//! use enip_scanner::{ConnectionRequest, Scanner, ScannerConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> enip_scanner::Result<()> {
//! let scanner = Scanner::new(ScannerConfig::default())?;
//! let devices = scanner.scan_broadcast(16, Duration::from_secs(1)).await?;
//!
//! for device in &devices {
//!     println!("{} {} (vendor {})", device.ip, device.product_name, device.vendor_id);
//! }
//!
//! if let Some(device) = devices.first() {
//!     // Outputs to assembly 150, inputs from 100, sizes read from the device
//!     let request = ConnectionRequest::new(device.ip, 150, 100).with_rpi_ms(20);
//!     scanner.open_connection(&request).await?;
//!     scanner.write_data(&[0u8; 16])?;
//!     println!("{:?}", scanner.get_status().last_received);
//!     scanner.close_connection(Duration::from_secs(1)).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod cip;
pub mod config;
pub mod discovery;
pub mod encap;
pub mod error;
pub mod events;
pub mod implicit;
pub mod path;
pub mod scanner;
#[cfg(feature = "tags")]
pub mod tag;
pub mod vendor;

// Re-export commonly used items
pub use assembly::AssemblyResult;
pub use cip::CipResponse;
pub use config::ScannerConfig;
pub use discovery::DeviceIdentity;
pub use encap::Session;
pub use error::{EtherNetIpError, Result};
pub use events::{CloseReason, ScannerEvent};
pub use implicit::{ConnectionPhase, ConnectionRequest, ConnectionState};
pub use path::{build_path, CipPath, PortSegment};
pub use scanner::Scanner;
#[cfg(feature = "tags")]
pub use tag::{CipType, TagResult, TagValue};
pub use vendor::{
    Alarm, AlarmCategory, AxisData, ControllerStatus, JobInfo, RobotPosition, VariableKind,
    VariableValue,
};

/// Crate version, for display in front ends
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
