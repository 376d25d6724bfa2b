// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Event fan-out to dashboards and other subscribers.
//
// Events for one printer are published while that printer's session is
// locked, so each subscriber sees them in frame-arrival order. No order is
// promised across printers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use chitui_core::types::{
    AttributesSnapshot, FileEntry, PrinterSummary, StatusSnapshot, StorageEstimate, TaskDetail,
};

use crate::estimator::PrintEstimate;

/// Push event delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// Aggregate printer list, in registration order.
    Printers { printers: Vec<PrinterSummary> },
    #[serde(rename_all = "camelCase")]
    Status {
        device_id: String,
        snapshot: StatusSnapshot,
        is_printing: bool,
    },
    #[serde(rename_all = "camelCase")]
    Attributes {
        device_id: String,
        snapshot: AttributesSnapshot,
    },
    /// Storage usage; the total is an estimate (see `StorageEstimate`).
    #[serde(rename_all = "camelCase")]
    Storage {
        device_id: String,
        storage: StorageEstimate,
    },
    #[serde(rename_all = "camelCase")]
    FileList {
        device_id: String,
        location: String,
        entries: Vec<FileEntry>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        device_id: String,
        code: i64,
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Notice { device_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    TaskDetails {
        device_id: String,
        detail: TaskDetail,
    },
    #[serde(rename_all = "camelCase")]
    PrintEstimate {
        device_id: String,
        estimate: PrintEstimate,
    },
}

impl BridgeEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Printers { .. } => "printers",
            Self::Status { .. } => "status",
            Self::Attributes { .. } => "attributes",
            Self::Storage { .. } => "storage",
            Self::FileList { .. } => "fileList",
            Self::Error { .. } => "error",
            Self::Notice { .. } => "notice",
            Self::TaskDetails { .. } => "taskDetails",
            Self::PrintEstimate { .. } => "printEstimate",
        }
    }

    /// Printer the event concerns; `None` for aggregate events.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Printers { .. } => None,
            Self::Status { device_id, .. }
            | Self::Attributes { device_id, .. }
            | Self::Storage { device_id, .. }
            | Self::FileList { device_id, .. }
            | Self::Error { device_id, .. }
            | Self::Notice { device_id, .. }
            | Self::TaskDetails { device_id, .. }
            | Self::PrintEstimate { device_id, .. } => Some(device_id),
        }
    }
}

/// Broadcast channel shared by every publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BridgeEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "no subscribers");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber's view of the event stream.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<BridgeEvent>,
}

impl Subscription {
    /// Next event, or `None` once every publisher is gone.
    ///
    /// A subscriber that falls behind skips the overwritten events and
    /// carries on with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
