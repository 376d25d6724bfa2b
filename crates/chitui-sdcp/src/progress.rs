// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Relay-to-printer progress, keyed by client-generated upload id.
//
// Each upload id owns a `watch` channel. Subscribing creates the channel if
// the uploader has not published yet, so a monitor started early never
// misses the first update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// State of one relay-to-printer transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferProgress {
    Pending,
    InProgress { percent: u8 },
    Done,
    Failed { reason: String },
}

impl TransferProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// Percentage for display; terminal failures report 0.
    pub fn percent(&self) -> u8 {
        match self {
            Self::Pending | Self::Failed { .. } => 0,
            Self::InProgress { percent } => *percent,
            Self::Done => 100,
        }
    }
}

/// Shared map of progress channels.
#[derive(Debug, Clone, Default)]
pub struct ProgressHub {
    channels: Arc<Mutex<HashMap<String, watch::Sender<TransferProgress>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sender<R>(&self, upload_id: &str, f: impl FnOnce(&watch::Sender<TransferProgress>) -> R) -> R {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = channels
            .entry(upload_id.to_string())
            .or_insert_with(|| watch::channel(TransferProgress::Pending).0);
        f(sender)
    }

    /// Receiver for `upload_id`, created on first use.
    pub fn subscribe(&self, upload_id: &str) -> watch::Receiver<TransferProgress> {
        self.with_sender(upload_id, |tx| tx.subscribe())
    }

    pub fn publish(&self, upload_id: &str, progress: TransferProgress) {
        debug!(upload_id, ?progress, "transfer progress");
        self.with_sender(upload_id, |tx| {
            tx.send_replace(progress);
        });
    }

    /// Drop the channel once nobody needs it. Existing receivers keep the
    /// last value.
    pub fn forget(&self, upload_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.remove(upload_id);
    }
}

/// Follow a progress channel until it reaches a terminal state.
///
/// `on_update` sees every observed state, including the final one. If no
/// update arrives within `idle_timeout`, or the publisher goes away before
/// finishing, the transfer is reported as failed.
pub async fn follow(
    mut rx: watch::Receiver<TransferProgress>,
    idle_timeout: Duration,
    mut on_update: impl FnMut(&TransferProgress),
) -> TransferProgress {
    loop {
        let current = rx.borrow_and_update().clone();
        on_update(&current);
        if current.is_terminal() {
            return current;
        }
        match tokio::time::timeout(idle_timeout, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => {
                return TransferProgress::Failed {
                    reason: "progress stream closed".into(),
                };
            }
            Err(_) => {
                return TransferProgress::Failed {
                    reason: format!("no progress for {}s", idle_timeout.as_secs()),
                };
            }
        }
    }
}
