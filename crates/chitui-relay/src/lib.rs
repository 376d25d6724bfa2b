// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ChitUI Relay: per-printer session state, the session registry, command
// dispatch with timeouts, two-phase file transfer, and the event fan-out
// consumed by dashboards.

pub mod bridge;
pub mod dispatcher;
pub mod estimator;
pub mod events;
pub mod registry;
pub mod session;
pub mod transfer;

pub use bridge::Bridge;
pub use events::{BridgeEvent, EventBus, Subscription};
pub use registry::SessionRegistry;
pub use session::PrinterSession;
