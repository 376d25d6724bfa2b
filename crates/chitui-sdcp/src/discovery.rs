// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// UDP broadcast discovery of SDCP printers.
//
// We broadcast the `M99999` probe to port 3000 and collect JSON replies
// until the timeout elapses.  Each reply describes one mainboard:
//
//   {"Id": "<connection id>", "Data": {"Name", "MachineName", "BrandName",
//    "MainboardIP", "MainboardID", "ProtocolVersion", "FirmwareVersion"}}

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use md5::{Digest, Md5};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use chitui_core::error::{ChituiError, Result};
use chitui_core::types::PrinterIdentity;

/// Probe payload understood by SDCP mainboards.
pub const DISCOVERY_PROBE: &[u8] = b"M99999";

/// UDP port mainboards listen on for the probe.
pub const DISCOVERY_PORT: u16 = 3000;

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Data")]
    data: ReplyData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReplyData {
    name: String,
    machine_name: String,
    brand_name: String,
    #[serde(rename = "MainboardIP")]
    mainboard_ip: String,
    #[serde(rename = "MainboardID")]
    mainboard_id: String,
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    firmware_version: Option<String>,
}

/// Parse one discovery reply datagram.
pub fn parse_reply(datagram: &[u8]) -> Result<PrinterIdentity> {
    let reply: Reply = serde_json::from_slice(datagram)
        .map_err(|e| ChituiError::Discovery(format!("unparseable reply: {e}")))?;
    if reply.data.mainboard_id.is_empty() {
        return Err(ChituiError::Discovery("reply without MainboardID".into()));
    }
    Ok(PrinterIdentity {
        id: reply.data.mainboard_id,
        connection_id: reply.id,
        name: reply.data.name,
        brand: reply.data.brand_name,
        model: reply.data.machine_name,
        address: reply.data.mainboard_ip,
        protocol_version: reply.data.protocol_version,
        firmware_version: reply.data.firmware_version,
        manual: false,
    })
}

/// Identity for a printer added by IP address.
///
/// The id is the MD5 hex digest of the address, so re-adding the same IP
/// always yields the same key.
pub fn manual_identity(ip: &str, name: Option<&str>) -> PrinterIdentity {
    let id = hex::encode(Md5::digest(ip.as_bytes()));
    PrinterIdentity {
        connection_id: id.clone(),
        id,
        name: name.map(str::to_string).unwrap_or_else(|| format!("Printer-{ip}")),
        brand: "Unknown".into(),
        model: "Manual".into(),
        address: ip.to_string(),
        protocol_version: None,
        firmware_version: None,
        manual: true,
    }
}

/// Broadcast a probe on the local network and collect replies.
pub async fn discover(timeout: Duration) -> Result<Vec<PrinterIdentity>> {
    discover_at(
        SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
        timeout,
    )
    .await
}

/// Send the probe to `target` and collect replies until `timeout` elapses.
///
/// Replies are deduplicated by mainboard id, keeping arrival order.
#[instrument(skip_all, fields(target = %target))]
pub async fn discover_at(target: SocketAddr, timeout: Duration) -> Result<Vec<PrinterIdentity>> {
    let bind: SocketAddr = if target.ip().is_loopback() {
        (Ipv4Addr::LOCALHOST, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ChituiError::Discovery(format!("bind: {e}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| ChituiError::Discovery(format!("enable broadcast: {e}")))?;
    socket
        .send_to(DISCOVERY_PROBE, target)
        .await
        .map_err(|e| ChituiError::Discovery(format!("send probe: {e}")))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut found: Vec<PrinterIdentity> = Vec::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!(error = %e, "discovery receive failed");
                break;
            }
            Ok(Ok(r)) => r,
        };
        match parse_reply(&buf[..len]) {
            Ok(identity) if found.iter().any(|p| p.id == identity.id) => {
                debug!(id = %identity.id, "duplicate discovery reply");
            }
            Ok(identity) => {
                info!(name = %identity.name, address = %identity.address, "discovered printer");
                found.push(identity);
            }
            Err(e) => warn!(%from, error = %e, "ignoring discovery reply"),
        }
    }

    info!(count = found.len(), "discovery done");
    Ok(found)
}
