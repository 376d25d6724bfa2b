// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable text for relay errors and SDCP status codes.
//
// Dashboards show these strings verbatim, so they stay short and say what
// to do next.

use crate::error::ChituiError;
use crate::types::{MachineStatus, PrintError, PrintStatus};

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network blip or timeout; retrying may help.
    Transient,
    /// The operator must do something (reconnect, free space, pick a file).
    ActionRequired,
    /// Retrying will not help.
    Permanent,
}

/// A human-readable error with a plain English message and a suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    pub message: String,
    pub suggestion: String,
    pub retriable: bool,
    pub severity: Severity,
}

impl HumanError {
    fn new(message: &str, suggestion: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            suggestion: suggestion.into(),
            retriable: severity == Severity::Transient,
            severity,
        }
    }
}

/// Convert a `ChituiError` into something an operator can act on.
pub fn humanize_error(err: &ChituiError) -> HumanError {
    use Severity::*;
    match err {
        ChituiError::MalformedFrame(_) => HumanError::new(
            "The printer sent a message we couldn't read.",
            "This is usually harmless. If it keeps happening, check the printer firmware version.",
            Permanent,
        ),
        ChituiError::UnknownDevice(id) => HumanError::new(
            "That printer isn't connected to the relay.",
            format!("Add the printer again or refresh the printer list. ({id})"),
            ActionRequired,
        ),
        ChituiError::DuplicateIdentity(_) => HumanError::new(
            "That printer is already added.",
            "Pick it from the printer list instead of adding it again.",
            Permanent,
        ),
        ChituiError::SessionNotConnected(_) => HumanError::new(
            "The printer is offline.",
            "Check the printer is switched on and on the same network, then try again.",
            Transient,
        ),
        ChituiError::CommandTimeout { command, .. } => HumanError::new(
            "The printer didn't answer in time.",
            format!("The printer may be busy. Try the {command} command again in a moment."),
            Transient,
        ),
        ChituiError::ProtocolMismatch { .. } => HumanError::new(
            "The printer answered with something unexpected.",
            "Try again. If this keeps happening, the firmware may not support this command.",
            Permanent,
        ),
        ChituiError::SessionRemoved(_) => HumanError::new(
            "The printer was removed while a command was running.",
            "Add the printer again if you still need it.",
            Permanent,
        ),
        ChituiError::PrinterRejected { code, .. } => HumanError::new(
            "The printer refused the command.",
            format!("Check the printer screen for details. (Error code {code})"),
            ActionRequired,
        ),
        ChituiError::InvalidTransition { .. } => HumanError::new(
            "The printer connection got into an odd state.",
            "Remove and re-add the printer.",
            Permanent,
        ),
        ChituiError::Transport(detail) => humanize_transport(detail),
        ChituiError::Discovery(_) => HumanError::new(
            "We couldn't search for printers.",
            "Make sure the relay is on the same network as your printers, or add the printer by IP address.",
            Transient,
        ),
        ChituiError::Upload(detail) => HumanError::new(
            "The file didn't reach the printer.",
            format!("Try uploading again. ({detail})"),
            Transient,
        ),
        ChituiError::UnsupportedFile(name) => HumanError::new(
            "This file type can't be printed.",
            format!("Slice the model to .ctb, .goo or .prz first. ({name})"),
            Permanent,
        ),
        ChituiError::UploadInProgress => HumanError::new(
            "Another upload is still running.",
            "Wait for it to finish, then try again.",
            Transient,
        ),
        ChituiError::GadgetUnavailable => HumanError::new(
            "USB gadget mode isn't set up on this relay.",
            "Files are sent over the network instead. Set USB_GADGET_PATH to use the gadget.",
            Permanent,
        ),
        ChituiError::Settings(_) => HumanError::new(
            "Settings couldn't be saved.",
            "Check the relay's data folder is writable.",
            ActionRequired,
        ),
        ChituiError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => HumanError::new(
                "The file couldn't be found.",
                "It may have been moved or deleted. Choose the file again.",
                ActionRequired,
            ),
            std::io::ErrorKind::PermissionDenied => HumanError::new(
                "The relay isn't allowed to use that folder.",
                "Check folder permissions (USB gadget folder and data folder).",
                ActionRequired,
            ),
            _ => HumanError::new(
                "There was a problem reading or writing a file.",
                "Try again. If this keeps happening, the storage may be full.",
                Transient,
            ),
        },
        ChituiError::Serialization(_) => HumanError::new(
            "The relay had an internal data problem.",
            "Try again. If this keeps happening, please report it.",
            Transient,
        ),
    }
}

fn humanize_transport(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("refused") {
        HumanError::new(
            "The printer refused the connection.",
            "The printer may still be starting up. We'll keep trying.",
            Severity::Transient,
        )
    } else if lower.contains("reset") || lower.contains("broken pipe") || lower.contains("closed") {
        HumanError::new(
            "The connection to the printer dropped.",
            "This sometimes happens on Wi-Fi. We'll reconnect automatically.",
            Severity::Transient,
        )
    } else {
        HumanError::new(
            "We couldn't talk to the printer.",
            format!("Check the printer is on the network. ({detail})"),
            Severity::Transient,
        )
    }
}

/// Label for a machine status code.
pub fn machine_status_text(status: MachineStatus) -> &'static str {
    match status {
        MachineStatus::Idle => "Idle",
        MachineStatus::Printing => "Printing",
        MachineStatus::FileTransferring => "File Transferring",
        MachineStatus::ExposureTesting => "Exposure Testing",
        MachineStatus::DevicesTesting => "Devices Testing",
        MachineStatus::Busy => "Busy",
        MachineStatus::Other(_) => "Unknown",
    }
}

/// Label for a print sub-status code.
pub fn print_status_text(status: PrintStatus) -> &'static str {
    match status {
        PrintStatus::Idle => "Idle",
        PrintStatus::Homing => "Homing",
        PrintStatus::Dropping => "Dropping",
        PrintStatus::Exposing => "Exposing",
        PrintStatus::Lifting => "Lifting",
        PrintStatus::Pausing => "Pausing",
        PrintStatus::Paused => "Paused",
        PrintStatus::Stopping => "Stopping",
        PrintStatus::Stopped => "Stopped",
        PrintStatus::Complete => "Complete",
        PrintStatus::FileChecking => "File Checking",
        PrintStatus::Other(_) => "Unknown",
    }
}

/// Explanation for a print error number. `None` means no error.
pub fn print_error_text(err: PrintError) -> Option<&'static str> {
    match err {
        PrintError::None => None,
        PrintError::Md5Check => Some("File MD5 Check Failed"),
        PrintError::FileIo => Some("File Read Failed"),
        PrintError::InvalidResolution => Some("Resolution Mismatch"),
        PrintError::UnknownFormat => Some("Format Mismatch"),
        PrintError::UnknownModel => Some("Machine Model Mismatch"),
        PrintError::Other(_) => Some("Unknown Print Error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_printer_is_transient() {
        let human = humanize_error(&ChituiError::SessionNotConnected("abc".into()));
        assert_eq!(human.severity, Severity::Transient);
        assert!(human.retriable);
    }

    #[test]
    fn unsupported_file_is_permanent() {
        let human = humanize_error(&ChituiError::UnsupportedFile("model.stl".into()));
        assert_eq!(human.severity, Severity::Permanent);
        assert!(!human.retriable);
        assert!(human.suggestion.contains("model.stl"));
    }

    #[test]
    fn transport_detail_picks_message() {
        let refused = humanize_error(&ChituiError::Transport("Connection refused (os error 111)".into()));
        assert!(refused.message.contains("refused"));
        let dropped = humanize_error(&ChituiError::Transport("connection reset by peer".into()));
        assert!(dropped.message.contains("dropped"));
    }

    #[test]
    fn missing_file_needs_action() {
        let err = ChituiError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(humanize_error(&err).severity, Severity::ActionRequired);
    }

    #[test]
    fn status_labels() {
        assert_eq!(machine_status_text(MachineStatus::Busy), "Busy");
        assert_eq!(print_status_text(PrintStatus::from(10)), "File Checking");
        assert_eq!(print_error_text(PrintError::None), None);
        assert_eq!(print_error_text(PrintError::from(1)), Some("File MD5 Check Failed"));
    }
}
