// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SDCP command table: numeric codes, request parameters, and the response
// kind each command is answered with.

use serde_json::{Value, json};

use crate::codec::FrameKind;

pub const CMD_STATUS: u16 = 0;
pub const CMD_ATTRIBUTES: u16 = 1;
pub const CMD_START_PRINT: u16 = 128;
pub const CMD_PAUSE: u16 = 129;
pub const CMD_STOP: u16 = 130;
pub const CMD_RESUME: u16 = 131;
pub const CMD_LIST_FILES: u16 = 258;
pub const CMD_DELETE_FILES: u16 = 259;
pub const CMD_CLEAR_HISTORY: u16 = 320;
pub const CMD_TASK_DETAILS: u16 = 321;
pub const CMD_WIPE_STORAGE: u16 = 322;

/// Every command code the relay knows how to issue.
pub const KNOWN_CODES: &[u16] = &[
    CMD_STATUS,
    CMD_ATTRIBUTES,
    CMD_START_PRINT,
    CMD_PAUSE,
    CMD_STOP,
    CMD_RESUME,
    CMD_LIST_FILES,
    CMD_DELETE_FILES,
    CMD_CLEAR_HISTORY,
    CMD_TASK_DETAILS,
    CMD_WIPE_STORAGE,
];

/// A command the relay can send to a printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryStatus,
    QueryAttributes,
    /// List a storage location (`/local`, `/usb`, or a subfolder).
    ListFiles { path: String },
    DeleteFiles { paths: Vec<String> },
    StartPrint { filename: String, start_layer: u32 },
    Pause,
    Resume,
    Stop,
    ClearHistory,
    /// Wipe (format) local storage.
    WipeStorage,
    FetchTaskDetails { task_ids: Vec<String> },
}

impl Command {
    pub fn code(&self) -> u16 {
        match self {
            Self::QueryStatus => CMD_STATUS,
            Self::QueryAttributes => CMD_ATTRIBUTES,
            Self::StartPrint { .. } => CMD_START_PRINT,
            Self::Pause => CMD_PAUSE,
            Self::Stop => CMD_STOP,
            Self::Resume => CMD_RESUME,
            Self::ListFiles { .. } => CMD_LIST_FILES,
            Self::DeleteFiles { .. } => CMD_DELETE_FILES,
            Self::ClearHistory => CMD_CLEAR_HISTORY,
            Self::FetchTaskDetails { .. } => CMD_TASK_DETAILS,
            Self::WipeStorage => CMD_WIPE_STORAGE,
        }
    }

    /// Short name used in logs and timeout errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryStatus => "QueryStatus",
            Self::QueryAttributes => "QueryAttributes",
            Self::ListFiles { .. } => "ListFiles",
            Self::DeleteFiles { .. } => "DeleteFiles",
            Self::StartPrint { .. } => "StartPrint",
            Self::Pause => "Pause",
            Self::Resume => "Resume",
            Self::Stop => "Stop",
            Self::ClearHistory => "ClearHistory",
            Self::WipeStorage => "WipeStorage",
            Self::FetchTaskDetails { .. } => "FetchTaskDetails",
        }
    }

    /// The `Data.Data` object of the request.
    pub fn params(&self) -> Value {
        match self {
            Self::ListFiles { path } => json!({ "Url": path }),
            Self::DeleteFiles { paths } => json!({ "FileList": paths }),
            Self::StartPrint {
                filename,
                start_layer,
            } => json!({ "Filename": filename, "StartLayer": start_layer }),
            Self::FetchTaskDetails { task_ids } => json!({ "Id": task_ids }),
            _ => json!({}),
        }
    }

    /// Response kind that resolves this command.
    pub fn expected_response(&self) -> FrameKind {
        match self {
            Self::ListFiles { .. } => FrameKind::FileList,
            Self::FetchTaskDetails { .. } => FrameKind::TaskDetails,
            _ => FrameKind::CommandAck,
        }
    }

    /// Whether sending the command twice is harmless.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::QueryStatus
                | Self::QueryAttributes
                | Self::ListFiles { .. }
                | Self::FetchTaskDetails { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_firmware_table() {
        assert_eq!(Command::QueryStatus.code(), 0);
        assert_eq!(Command::Pause.code(), 129);
        assert_eq!(Command::Stop.code(), 130);
        assert_eq!(Command::Resume.code(), 131);
        assert_eq!(Command::WipeStorage.code(), 322);
        assert_eq!(Command::ListFiles { path: "/usb".into() }.code(), 258);
    }

    #[test]
    fn start_print_params() {
        let cmd = Command::StartPrint {
            filename: "/local/benchy.ctb".into(),
            start_layer: 0,
        };
        assert_eq!(
            cmd.params(),
            json!({"Filename": "/local/benchy.ctb", "StartLayer": 0})
        );
        assert_eq!(cmd.expected_response(), FrameKind::CommandAck);
        assert!(!cmd.is_idempotent());
    }

    #[test]
    fn listing_and_details_expect_their_own_frames() {
        let list = Command::ListFiles { path: "/local".into() };
        assert_eq!(list.expected_response(), FrameKind::FileList);
        assert_eq!(list.params(), json!({"Url": "/local"}));

        let details = Command::FetchTaskDetails {
            task_ids: vec!["t-1".into()],
        };
        assert_eq!(details.expected_response(), FrameKind::TaskDetails);
        assert_eq!(details.params(), json!({"Id": ["t-1"]}));
    }

    #[test]
    fn parameterless_commands_send_empty_object() {
        assert_eq!(Command::ClearHistory.params(), json!({}));
        assert!(KNOWN_CODES.contains(&Command::ClearHistory.code()));
    }
}
