// assembly.rs - Assembly object (class 0x04) explicit access
// =========================================================================

use crate::cip::{self, class, service, STATUS_SUCCESS};
use crate::encap::Session;
use crate::error::{EtherNetIpError, Result};
use crate::path::CipPath;
use std::net::IpAddr;
use tokio::time::Duration;
use tracing::debug;

/// Assembly attribute holding the data buffer
pub const ATTR_DATA: u16 = 3;
/// Assembly attribute holding the data size in bytes
pub const ATTR_SIZE: u16 = 4;

/// Largest CIP message an unconnected explicit request may carry
pub const MAX_UNCONNECTED_MESSAGE: usize = 504;

/// Statuses a zero-length Set-Attribute probe returns for read-only assemblies
const NOT_WRITABLE_STATUSES: [u8; 5] = [0x08, 0x0C, 0x0E, 0x0F, 0x10];
/// Statuses meaning the attribute is settable but the (empty) payload is the wrong size
const WRITABLE_SIZE_STATUSES: [u8; 2] = [0x13, 0x15];

/// Data read from one assembly instance.
///
/// The buffer is owned by the result and released with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyResult {
    pub ip: IpAddr,
    pub instance: u32,
    pub data: Vec<u8>,
    /// Round trip of the read request (session setup excluded)
    pub rtt: Duration,
}

impl AssemblyResult {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

pub fn data_path(instance: u32) -> CipPath {
    CipPath::new()
        .class(class::ASSEMBLY)
        .instance(instance)
        .attribute(ATTR_DATA)
}

pub(crate) fn check_instance(instance: u32) -> Result<()> {
    if instance == 0 {
        return Err(EtherNetIpError::InvalidArgument(
            "Assembly instance must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Get-Attribute-Single on the data attribute
pub async fn read_data(session: &mut Session, instance: u32, budget: Duration) -> Result<Vec<u8>> {
    check_instance(instance)?;
    let response = cip::send_request(
        session,
        service::GET_ATTRIBUTE_SINGLE,
        &data_path(instance),
        &[],
        budget,
    )
    .await?;
    debug!(
        "Read {} bytes from assembly {} on {}",
        response.data.len(),
        instance,
        session.target()
    );
    Ok(response.data)
}

/// Set-Attribute-Single on the data attribute
pub async fn write_data(
    session: &mut Session,
    instance: u32,
    data: &[u8],
    budget: Duration,
) -> Result<()> {
    check_instance(instance)?;
    if data.is_empty() {
        return Err(EtherNetIpError::InvalidArgument(
            "Assembly write needs at least one byte".to_string(),
        ));
    }
    let path = data_path(instance);
    let message_len = 2 + path.len() + data.len();
    if message_len > MAX_UNCONNECTED_MESSAGE {
        return Err(EtherNetIpError::InvalidArgument(format!(
            "Assembly write of {} bytes exceeds the {} byte explicit message limit",
            data.len(),
            MAX_UNCONNECTED_MESSAGE - 2 - path.len()
        )));
    }
    cip::send_request(session, service::SET_ATTRIBUTE_SINGLE, &path, data, budget).await?;
    debug!(
        "Wrote {} bytes to assembly {} on {}",
        data.len(),
        instance,
        session.target()
    );
    Ok(())
}

/// Zero-effect writability probe: Set-Attribute-Single with an empty payload.
///
/// Read-only statuses answer `false`; success or a size complaint answers
/// `true`; any other status is a real error.
pub async fn probe_writable(session: &mut Session, instance: u32, budget: Duration) -> Result<bool> {
    check_instance(instance)?;
    let request = cip::encode_request(service::SET_ATTRIBUTE_SINGLE, &data_path(instance), &[])?;
    let (response, _) = cip::exchange_cip(session, &request, budget).await?;
    classify_probe_status(response.general_status, response.extended_status.first().copied())
}

pub(crate) fn classify_probe_status(status: u8, extended: Option<u16>) -> Result<bool> {
    if status == STATUS_SUCCESS || WRITABLE_SIZE_STATUSES.contains(&status) {
        Ok(true)
    } else if NOT_WRITABLE_STATUSES.contains(&status) {
        Ok(false)
    } else {
        Err(EtherNetIpError::cip(status, extended))
    }
}
