// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ChitUI SDCP: wire codec, command table, UDP discovery, WebSocket transport,
// and relay-to-printer file transfer.  Everything here talks to the printer
// firmware; session state lives in `chitui-relay`.

pub mod codec;
pub mod command;
pub mod discovery;
pub mod progress;
pub mod retry;
pub mod transport;
pub mod upload;

pub use codec::{Frame, FrameBody, FrameKind, OutboundRequest, decode, encode};
pub use command::Command;
