// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print tracking and remaining-time estimation.
//
// Every status update recomputes the layer rate from the point tracking
// started; there is no smoothing, so an unusually slow or fast first layer
// shows up directly in the estimate.

use std::time::Instant;

use serde::Serialize;

use chitui_core::types::{PrintInfo, TaskDetail};

/// Where a remaining-time figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// Measured layer rate since tracking started.
    LayerRate,
    /// Firmware `TotalTicks - CurrentTicks`.
    FirmwareTicks,
    Unknown,
}

/// Derived progress figures published while printing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintEstimate {
    pub current_layer: Option<u32>,
    pub total_layer: Option<u32>,
    pub percent_complete: u8,
    pub ms_per_layer: Option<u64>,
    pub remaining_ms: Option<u64>,
    pub source: EstimateSource,
}

/// State kept for the duration of one print.
#[derive(Debug, Clone)]
pub struct PrintTracking {
    pub started_at: Instant,
    pub start_layer: u32,
    /// Last measured rate, if any layer has completed since tracking began.
    pub ms_per_layer: Option<u64>,
    pub task_details_requested: bool,
    /// Task details (name, thumbnail) for the current print.
    pub task_detail: Option<TaskDetail>,
}

impl PrintTracking {
    pub fn start(now: Instant, info: Option<&PrintInfo>) -> Self {
        Self {
            started_at: now,
            start_layer: info.and_then(|i| i.current_layer).unwrap_or(0),
            ms_per_layer: None,
            task_details_requested: false,
            task_detail: None,
        }
    }

    /// Recompute the estimate for `info` as observed at `now`.
    pub fn estimate(&mut self, now: Instant, info: &PrintInfo) -> PrintEstimate {
        let current = info.current_layer;
        let total = info.total_layer;

        let layers_printed = current
            .filter(|c| *c > self.start_layer)
            .map(|c| u64::from(c - self.start_layer));

        let (remaining_ms, source) = match (layers_printed, current, total) {
            (Some(layers), Some(current), Some(total)) => {
                let elapsed_ms = now.saturating_duration_since(self.started_at).as_millis() as u64;
                let rate = elapsed_ms / layers;
                self.ms_per_layer = Some(rate);
                (
                    Some(u64::from(total.saturating_sub(current)) * rate),
                    EstimateSource::LayerRate,
                )
            }
            _ => match (info.total_ticks, info.current_ticks) {
                (Some(total_ticks), Some(current_ticks)) => (
                    Some(total_ticks.saturating_sub(current_ticks)),
                    EstimateSource::FirmwareTicks,
                ),
                _ => (None, EstimateSource::Unknown),
            },
        };

        PrintEstimate {
            current_layer: current,
            total_layer: total,
            percent_complete: info.percent_complete(),
            ms_per_layer: self.ms_per_layer,
            remaining_ms,
            source,
        }
    }
}
