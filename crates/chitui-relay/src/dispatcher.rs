// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command dispatcher: send a command and wait for its matching response.
//
// The pending entry is recorded under the session lock before the frame is
// written, so a response can never be routed ahead of its command. Timeouts
// are normally enforced by the reaper; the dispatcher keeps a short backstop
// in case no reaper is running. Only idempotent queries are ever resent,
// once, after a timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use chitui_core::error::{ChituiError, Result};
use chitui_core::types::ConnectionState;
use chitui_sdcp::codec::{Frame, FrameBody, OutboundRequest, encode};
use chitui_sdcp::command::Command;

use crate::registry::SessionRegistry;

/// Extra wait past the deadline before the dispatcher gives up on its own.
const BACKSTOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `command` to `device_id` and wait up to `timeout` for the
    /// response kind the command expects.
    ///
    /// Fails immediately with `SessionNotConnected` when the session is not
    /// connected; nothing is encoded in that case.
    #[instrument(skip(self, command, timeout), fields(command = command.name()))]
    pub async fn send(&self, device_id: &str, command: Command, timeout: Duration) -> Result<Frame> {
        let now = tokio::time::Instant::now().into_std();
        let timestamp = Utc::now().timestamp();
        let command_name = command.name();

        let (outbound, correlation_id, response, raw) =
            self.registry.with_session(device_id, |session| {
                if session.state() != ConnectionState::Connected {
                    return Err(ChituiError::SessionNotConnected(device_id.to_string()));
                }
                let Some(outbound) = session.outbound().cloned() else {
                    return Err(ChituiError::SessionNotConnected(device_id.to_string()));
                };
                let connection_id = session.identity().connection_id.clone();
                let (correlation_id, response) = session.register_pending(command.clone(), now, timeout);
                let encoded = encode(&OutboundRequest {
                    connection_id: &connection_id,
                    device_id,
                    correlation_id: &correlation_id,
                    timestamp,
                    command: &command,
                });
                match encoded {
                    Ok(raw) => Ok((outbound, correlation_id, response, raw)),
                    Err(e) => {
                        session.forget_pending(&correlation_id);
                        Err(e)
                    }
                }
            })??;

        if outbound.send(raw).await.is_err() {
            warn!(device_id, "socket closed before command was written");
            self.forget(device_id, &correlation_id);
            return Err(ChituiError::SessionNotConnected(device_id.to_string()));
        }
        debug!(device_id, correlation_id = %correlation_id, cmd = command.code(), "command sent");

        match tokio::time::timeout(timeout + BACKSTOP_GRACE, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChituiError::SessionRemoved(device_id.to_string())),
            Err(_) => {
                self.forget(device_id, &correlation_id);
                Err(ChituiError::CommandTimeout {
                    device_id: device_id.to_string(),
                    command: command_name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Like [`send`](Self::send), but a non-zero `Ack` in the response is
    /// turned into `PrinterRejected`.
    pub async fn send_acked(&self, device_id: &str, command: Command, timeout: Duration) -> Result<Frame> {
        let frame = self.send(device_id, command, timeout).await?;
        match frame.body {
            FrameBody::CommandAck { ack, .. } if ack != 0 => Err(ChituiError::PrinterRejected {
                device_id: device_id.to_string(),
                code: ack,
            }),
            _ => Ok(frame),
        }
    }

    /// Like [`send`](Self::send), but an idempotent query that times out is
    /// sent one more time. Other commands are sent exactly once.
    pub async fn send_query(&self, device_id: &str, command: Command, timeout: Duration) -> Result<Frame> {
        if !command.is_idempotent() {
            return self.send(device_id, command, timeout).await;
        }
        match self.send(device_id, command.clone(), timeout).await {
            Err(ChituiError::CommandTimeout { .. }) => {
                debug!(device_id, command = command.name(), "query timed out, resending once");
                self.send(device_id, command, timeout).await
            }
            other => other,
        }
    }

    fn forget(&self, device_id: &str, correlation_id: &str) {
        // The session may have been removed meanwhile.
        let _ = self
            .registry
            .with_session(device_id, |session| session.forget_pending(correlation_id));
    }
}
