// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the ChitUI relay.
//
// Snapshot types double as partial updates: every field is optional, and a
// merge only overwrites the fields that are present in the incoming patch.
// Field names on the wire follow the SDCP v3 spelling (PascalCase with a few
// irregular acronyms), so the same types serve the codec and the events
// pushed to dashboards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Port the printer mainboard serves its WebSocket and upload endpoints on.
pub const SDCP_PORT: u16 = 3030;

/// Port the printer camera serves RTSP on.
pub const CAMERA_RTSP_PORT: u16 = 554;

const GIB: u64 = 1024 * 1024 * 1024;

/// Copies every `Some` field of `$src` over the same field of `$dst`.
macro_rules! merge_present {
    ($dst:expr, $src:expr; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

// ---------------------------------------------------------------------------
// Identity and connection
// ---------------------------------------------------------------------------

/// Stable description of a printer, fixed once the session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterIdentity {
    /// Mainboard id, used as the session key.
    pub id: String,
    /// SDCP connection id (`Id` in discovery replies) echoed in every request.
    pub connection_id: String,
    pub name: String,
    pub brand: String,
    pub model: String,
    /// IPv4 address of the mainboard.
    pub address: String,
    pub protocol_version: Option<String>,
    pub firmware_version: Option<String>,
    /// Added by IP rather than found by discovery.
    pub manual: bool,
}

impl PrinterIdentity {
    /// WebSocket endpoint for SDCP traffic.
    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}/websocket", self.address, SDCP_PORT)
    }

    /// Chunked upload endpoint for network transfers.
    pub fn upload_url(&self) -> String {
        format!("http://{}:{}/uploadFile/upload", self.address, SDCP_PORT)
    }

    /// RTSP stream served by printers with a built-in camera.
    pub fn camera_url(&self) -> String {
        format!("rtsp://{}:{}/video", self.address, CAMERA_RTSP_PORT)
    }
}

/// Connection lifecycle of a printer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed (repeated transport
    /// signals are common during reconnect storms).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Error)
                | (Connected, Disconnected)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }
}

/// Aggregate row for the `printers` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterSummary {
    pub identity: PrinterIdentity,
    pub connection: ConnectionState,
    pub machine_status: Option<MachineStatus>,
    pub is_printing: bool,
}

// ---------------------------------------------------------------------------
// SDCP status codes
// ---------------------------------------------------------------------------

/// Top-level machine activity (`CurrentStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MachineStatus {
    Idle,
    Printing,
    FileTransferring,
    ExposureTesting,
    DevicesTesting,
    /// Code 8: reported while the mainboard rescans storage.
    Busy,
    Other(u8),
}

impl From<u8> for MachineStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Printing,
            2 => Self::FileTransferring,
            3 => Self::ExposureTesting,
            4 => Self::DevicesTesting,
            8 => Self::Busy,
            other => Self::Other(other),
        }
    }
}

impl From<MachineStatus> for u8 {
    fn from(status: MachineStatus) -> u8 {
        match status {
            MachineStatus::Idle => 0,
            MachineStatus::Printing => 1,
            MachineStatus::FileTransferring => 2,
            MachineStatus::ExposureTesting => 3,
            MachineStatus::DevicesTesting => 4,
            MachineStatus::Busy => 8,
            MachineStatus::Other(code) => code,
        }
    }
}

/// Print sub-status (`PrintInfo.Status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum PrintStatus {
    Idle,
    Homing,
    Dropping,
    Exposing,
    Lifting,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Complete,
    FileChecking,
    Other(u8),
}

impl PrintStatus {
    /// Idle, stopped, and complete end a print; everything else is active.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Complete)
    }
}

impl From<u8> for PrintStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Homing,
            2 => Self::Dropping,
            3 => Self::Exposing,
            4 => Self::Lifting,
            5 => Self::Pausing,
            6 => Self::Paused,
            7 => Self::Stopping,
            8 => Self::Stopped,
            9 => Self::Complete,
            10 => Self::FileChecking,
            other => Self::Other(other),
        }
    }
}

impl From<PrintStatus> for u8 {
    fn from(status: PrintStatus) -> u8 {
        match status {
            PrintStatus::Idle => 0,
            PrintStatus::Homing => 1,
            PrintStatus::Dropping => 2,
            PrintStatus::Exposing => 3,
            PrintStatus::Lifting => 4,
            PrintStatus::Pausing => 5,
            PrintStatus::Paused => 6,
            PrintStatus::Stopping => 7,
            PrintStatus::Stopped => 8,
            PrintStatus::Complete => 9,
            PrintStatus::FileChecking => 10,
            PrintStatus::Other(code) => code,
        }
    }
}

/// Print failure reason (`PrintInfo.ErrorNumber`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum PrintError {
    None,
    Md5Check,
    FileIo,
    InvalidResolution,
    UnknownFormat,
    UnknownModel,
    Other(u8),
}

impl From<u8> for PrintError {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Md5Check,
            2 => Self::FileIo,
            3 => Self::InvalidResolution,
            4 => Self::UnknownFormat,
            5 => Self::UnknownModel,
            other => Self::Other(other),
        }
    }
}

impl From<PrintError> for u8 {
    fn from(err: PrintError) -> u8 {
        match err {
            PrintError::None => 0,
            PrintError::Md5Check => 1,
            PrintError::FileIo => 2,
            PrintError::InvalidResolution => 3,
            PrintError::UnknownFormat => 4,
            PrintError::UnknownModel => 5,
            PrintError::Other(code) => code,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Last known machine status, also used as a partial update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(
        rename = "CurrentStatus",
        default,
        deserialize_with = "lenient::opt_status_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_status: Option<Vec<MachineStatus>>,
    #[serde(rename = "PrintScreen", default, skip_serializing_if = "Option::is_none")]
    pub print_screen: Option<f64>,
    #[serde(
        rename = "ReleaseFilm",
        default,
        deserialize_with = "lenient::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub release_film: Option<u64>,
    #[serde(rename = "TempOfUVLED", default, skip_serializing_if = "Option::is_none")]
    pub temp_of_uv_led: Option<f64>,
    #[serde(
        rename = "TimeLapseStatus",
        default,
        deserialize_with = "lenient::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_lapse_status: Option<u64>,
    #[serde(rename = "PrintInfo", default, skip_serializing_if = "Option::is_none")]
    pub print_info: Option<PrintInfo>,
}

/// Progress of the current print job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintInfo {
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PrintStatus>,
    #[serde(
        rename = "CurrentLayer",
        default,
        deserialize_with = "lenient::opt_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_layer: Option<u32>,
    #[serde(
        rename = "TotalLayer",
        default,
        deserialize_with = "lenient::opt_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_layer: Option<u32>,
    /// Elapsed print time in milliseconds.
    #[serde(
        rename = "CurrentTicks",
        default,
        deserialize_with = "lenient::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_ticks: Option<u64>,
    /// Firmware's estimate of the total print time in milliseconds.
    #[serde(
        rename = "TotalTicks",
        default,
        deserialize_with = "lenient::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_ticks: Option<u64>,
    #[serde(rename = "Filename", default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(rename = "ErrorNumber", default, skip_serializing_if = "Option::is_none")]
    pub error_number: Option<PrintError>,
    #[serde(rename = "TaskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl PrintInfo {
    fn merge(&mut self, patch: &PrintInfo) {
        merge_present!(self, patch;
            status, current_layer, total_layer, current_ticks, total_ticks,
            filename, error_number, task_id,
        );
    }

    /// Non-empty task id, if the firmware reported one.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Layer-based completion percentage (0 when the total is unknown).
    pub fn percent_complete(&self) -> u8 {
        match (self.current_layer, self.total_layer) {
            (Some(current), Some(total)) if total > 0 => {
                ((current.min(total) as f64 / total as f64) * 100.0).round() as u8
            }
            _ => 0,
        }
    }
}

impl StatusSnapshot {
    /// Overwrite the fields present in `patch`, keeping everything else.
    pub fn merge(&mut self, patch: &StatusSnapshot) {
        merge_present!(self, patch;
            current_status, print_screen, release_film, temp_of_uv_led, time_lapse_status,
        );
        if let Some(update) = &patch.print_info {
            match self.print_info.as_mut() {
                Some(current) => current.merge(update),
                None => self.print_info = Some(update.clone()),
            }
        }
    }

    /// Primary machine status (first entry of `CurrentStatus`).
    pub fn machine_status(&self) -> Option<MachineStatus> {
        self.current_status.as_ref().and_then(|s| s.first().copied())
    }

    /// Printing means the machine reports `Printing` and the print sub-status
    /// (when known) is not idle, stopped, or complete.
    pub fn is_printing(&self) -> bool {
        let machine_printing = self
            .current_status
            .as_ref()
            .is_some_and(|s| s.contains(&MachineStatus::Printing));
        let finished = self
            .print_info
            .as_ref()
            .and_then(|p| p.status)
            .is_some_and(PrintStatus::is_terminal);
        machine_printing && !finished
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Static and slow-changing device capabilities, also used as a partial
/// update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributesSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Screen resolution, e.g. `"7680x4320"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Build volume in millimetres, e.g. `"223.78x126.98x230"`.
    #[serde(rename = "XYZsize", default, skip_serializing_if = "Option::is_none")]
    pub xyz_size: Option<String>,
    #[serde(rename = "MainboardIP", default, skip_serializing_if = "Option::is_none")]
    pub mainboard_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_file_type: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices_status: Option<BTreeMap<String, i64>>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub release_film_max: Option<u64>,
    #[serde(rename = "TempOfUVLEDMax", default, skip_serializing_if = "Option::is_none")]
    pub temp_of_uv_led_max: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub camera_status: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub usb_disk_status: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_status: Option<String>,
    #[serde(rename = "SDCPStatus", default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub sdcp_status: Option<u64>,
    /// Free space on local storage in bytes.
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub remaining_memory: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub number_of_video_stream_connected: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub maximum_video_stream_allowed: Option<u32>,
    #[serde(
        rename = "NumberOfCloudSDCPServicesConnected",
        default,
        deserialize_with = "lenient::opt_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub number_of_cloud_services_connected: Option<u32>,
    // Misspelled by the firmware.
    #[serde(
        rename = "MaximumCloudSDCPSercicesAllowed",
        default,
        deserialize_with = "lenient::opt_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub maximum_cloud_services_allowed: Option<u32>,
    #[serde(rename = "TLPNoCapPos", default, skip_serializing_if = "Option::is_none")]
    pub tlp_no_cap_pos: Option<f64>,
    #[serde(rename = "TLPStartCapPos", default, skip_serializing_if = "Option::is_none")]
    pub tlp_start_cap_pos: Option<f64>,
    #[serde(rename = "TLPInterLayers", default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub tlp_inter_layers: Option<u32>,
}

impl AttributesSnapshot {
    /// Overwrite the fields present in `patch`, keeping everything else.
    pub fn merge(&mut self, patch: &AttributesSnapshot) {
        merge_present!(self, patch;
            name, machine_name, brand_name, protocol_version, firmware_version,
            resolution, xyz_size, mainboard_ip, capabilities, support_file_type,
            devices_status, release_film_max, temp_of_uv_led_max, camera_status,
            usb_disk_status, network_status, sdcp_status, remaining_memory,
            number_of_video_stream_connected, maximum_video_stream_allowed,
            number_of_cloud_services_connected, maximum_cloud_services_allowed,
            tlp_no_cap_pos, tlp_start_cap_pos, tlp_inter_layers,
        );
    }
}

/// Storage usage derived from `RemainingMemory`.
///
/// The firmware only reports free space. `total_bytes` is a guess: 64 GiB
/// when more than 32 GiB is free, 16 GiB when less than 16 GiB is free,
/// otherwise 32 GiB. `estimated_total` is always `true` so consumers can
/// label the figure as approximate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageEstimate {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    /// Percentage of the estimated total in use, one decimal place.
    pub used_percent: f64,
    pub estimated_total: bool,
}

impl StorageEstimate {
    pub fn from_remaining(remaining_bytes: u64) -> Self {
        let total_bytes = if remaining_bytes > 32 * GIB {
            64 * GIB
        } else if remaining_bytes < 16 * GIB {
            16 * GIB
        } else {
            32 * GIB
        };
        let used_bytes = total_bytes.saturating_sub(remaining_bytes);
        let used_percent = (used_bytes as f64 / total_bytes as f64 * 1000.0).round() / 10.0;
        Self {
            total_bytes,
            used_bytes,
            free_bytes: remaining_bytes,
            used_percent,
            estimated_total: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Files and tasks
// ---------------------------------------------------------------------------

/// One row of a `FileList` response as sent by the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Full path, e.g. `/local/benchy.ctb`.
    pub name: String,
    /// 0 for directories, 1 for files.
    #[serde(rename = "type", default = "RemoteFile::default_kind")]
    pub kind: u8,
    #[serde(rename = "usedSize", default, skip_serializing_if = "Option::is_none")]
    pub used_size: Option<u64>,
    #[serde(rename = "totalSize", default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(rename = "storageType", default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<u8>,
}

impl RemoteFile {
    fn default_kind() -> u8 {
        1
    }

    pub fn is_directory(&self) -> bool {
        self.kind == 0
    }
}

/// A printable file known to be on the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Full path as reported by the printer.
    pub path: String,
    /// Listing path the entry was found under (`/local`, `/usb`, ...).
    pub location: String,
    pub discovered_at: DateTime<Utc>,
}

impl FileEntry {
    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// One entry of a task-details (`HistoryDetailList`) response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(rename = "TaskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "TaskName", alias = "Name", default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Thumbnail URL (http) or data URI; proxied as-is.
    #[serde(rename = "Thumbnail", default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(rename = "BeginTime", default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<u64>,
    #[serde(rename = "EndTime", default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(rename = "TaskStatus", default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub task_status: Option<u64>,
    /// Fields the relay does not interpret, passed through to subscribers.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Lenient number decoding
// ---------------------------------------------------------------------------

/// Firmware revisions disagree on integer vs float and scalar vs list, so
/// numeric fields accept either form. Values that cannot be interpreted
/// decode as absent rather than failing the whole frame.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::MachineStatus;

    fn as_u64(value: &Value) -> Option<u64> {
        value.as_u64().or_else(|| {
            value
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        })
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.as_ref().and_then(as_u64))
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value
            .as_ref()
            .and_then(as_u64)
            .and_then(|v| u32::try_from(v).ok()))
    }

    pub fn opt_status_list<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Vec<MachineStatus>>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        let codes = match value {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Array(items)) => items.iter().filter_map(as_u64).collect::<Vec<_>>(),
            Some(other) => match as_u64(&other) {
                Some(code) => vec![code],
                None => return Ok(None),
            },
        };
        Ok(Some(
            codes
                .into_iter()
                .filter_map(|c| u8::try_from(c).ok())
                .map(MachineStatus::from)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(json: &str) -> StatusSnapshot {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn merge_keeps_fields_absent_from_patch() {
        let mut snap = status(r#"{"CurrentStatus":[1],"TempOfUVLED":31.5,"PrintInfo":{"CurrentLayer":10,"TotalLayer":100}}"#);
        snap.merge(&status(r#"{"PrintInfo":{"CurrentLayer":11}}"#));
        snap.merge(&status(r#"{"ReleaseFilm":42}"#));

        assert_eq!(snap.machine_status(), Some(MachineStatus::Printing));
        assert_eq!(snap.temp_of_uv_led, Some(31.5));
        assert_eq!(snap.release_film, Some(42));
        let info = snap.print_info.unwrap();
        assert_eq!(info.current_layer, Some(11));
        assert_eq!(info.total_layer, Some(100));
    }

    #[test]
    fn current_status_accepts_scalar_and_list() {
        assert_eq!(
            status(r#"{"CurrentStatus":1}"#).current_status,
            Some(vec![MachineStatus::Printing])
        );
        assert_eq!(
            status(r#"{"CurrentStatus":[0,8]}"#).current_status,
            Some(vec![MachineStatus::Idle, MachineStatus::Busy])
        );
    }

    #[test]
    fn float_ticks_are_tolerated() {
        let snap = status(r#"{"PrintInfo":{"CurrentTicks":1500.4,"TotalTicks":9000}}"#);
        let info = snap.print_info.unwrap();
        assert_eq!(info.current_ticks, Some(1500));
        assert_eq!(info.total_ticks, Some(9000));
    }

    #[test]
    fn printing_requires_active_sub_status() {
        assert!(status(r#"{"CurrentStatus":[1]}"#).is_printing());
        assert!(status(r#"{"CurrentStatus":[1],"PrintInfo":{"Status":3}}"#).is_printing());
        assert!(!status(r#"{"CurrentStatus":[1],"PrintInfo":{"Status":9}}"#).is_printing());
        assert!(!status(r#"{"CurrentStatus":[0],"PrintInfo":{"Status":3}}"#).is_printing());
    }

    #[test]
    fn unknown_codes_survive_round_trip() {
        assert_eq!(MachineStatus::from(42), MachineStatus::Other(42));
        assert_eq!(u8::from(MachineStatus::Other(42)), 42);
        assert_eq!(PrintStatus::from(10), PrintStatus::FileChecking);
    }

    #[test]
    fn attributes_merge_and_firmware_spelling() {
        let mut attrs: AttributesSnapshot = serde_json::from_str(
            r#"{"Resolution":"7680x4320","XYZsize":"223x126x230","MaximumCloudSDCPSercicesAllowed":1,"SDCPStatus":1}"#,
        )
        .unwrap();
        let patch: AttributesSnapshot =
            serde_json::from_str(r#"{"RemainingMemory":1024,"CameraStatus":1}"#).unwrap();
        attrs.merge(&patch);

        assert_eq!(attrs.resolution.as_deref(), Some("7680x4320"));
        assert_eq!(attrs.xyz_size.as_deref(), Some("223x126x230"));
        assert_eq!(attrs.maximum_cloud_services_allowed, Some(1));
        assert_eq!(attrs.sdcp_status, Some(1));
        assert_eq!(attrs.remaining_memory, Some(1024));
        assert_eq!(attrs.camera_status, Some(1));
    }

    #[test]
    fn storage_buckets_follow_remaining_space() {
        assert_eq!(StorageEstimate::from_remaining(10 * GIB).total_bytes, 16 * GIB);
        assert_eq!(StorageEstimate::from_remaining(20 * GIB).total_bytes, 32 * GIB);
        assert_eq!(StorageEstimate::from_remaining(40 * GIB).total_bytes, 64 * GIB);

        let est = StorageEstimate::from_remaining(24 * GIB);
        assert_eq!(est.used_bytes, 8 * GIB);
        assert_eq!(est.used_percent, 25.0);
        assert!(est.estimated_total);
    }

    #[test]
    fn storage_never_underflows() {
        let est = StorageEstimate::from_remaining(100 * GIB);
        assert_eq!(est.used_bytes, 0);
        assert_eq!(est.used_percent, 0.0);
    }

    #[test]
    fn connection_edges() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Error));
        assert!(Error.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
    }

    #[test]
    fn percent_complete_clamps() {
        let info = PrintInfo {
            current_layer: Some(120),
            total_layer: Some(100),
            ..Default::default()
        };
        assert_eq!(info.percent_complete(), 100);
        assert_eq!(PrintInfo::default().percent_complete(), 0);
    }

    #[test]
    fn file_entry_name_is_last_component() {
        let entry = FileEntry {
            path: "/usb/models/benchy.ctb".into(),
            location: "/usb/models".into(),
            discovered_at: Utc::now(),
        };
        assert_eq!(entry.file_name(), "benchy.ctb");
    }

    #[test]
    fn task_detail_keeps_unknown_fields() {
        let detail: TaskDetail = serde_json::from_str(
            r#"{"TaskId":"t1","Name":"benchy.ctb","Thumbnail":"http://x/t.bmp","MD5":"abc"}"#,
        )
        .unwrap();
        assert_eq!(detail.task_name.as_deref(), Some("benchy.ctb"));
        assert_eq!(detail.extra.get("MD5").and_then(|v| v.as_str()), Some("abc"));
    }
}
