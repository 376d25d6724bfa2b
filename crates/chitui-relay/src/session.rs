// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer session state.
//
// A `PrinterSession` is plain data plus synchronous transitions. It never
// performs I/O: applying a frame returns the events to publish and any
// follow-up requests (sub-directory listings, task details) for the caller
// to dispatch. The registry serialises all calls for one session behind a
// mutex, so frame order is preserved per printer.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use chitui_core::error::{ChituiError, Result};
use chitui_core::types::{
    AttributesSnapshot, ConnectionState, FileEntry, MachineStatus, PrinterIdentity,
    PrinterSummary, RemoteFile, StatusSnapshot, StorageEstimate, TaskDetail,
};
use chitui_sdcp::codec::{Frame, FrameBody, FrameKind, new_request_id};
use chitui_sdcp::command::Command;

use crate::estimator::PrintTracking;
use crate::events::BridgeEvent;

/// Listing requested after the mainboard leaves the busy state.
const LOCAL_STORAGE: &str = "/local";

/// Side effect produced by a session transition.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// Publish to subscribers.
    Event(BridgeEvent),
    /// Send this command to the printer.
    Request(Command),
}

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingCommand {
    pub command: Command,
    pub issued_at: Instant,
    pub deadline: Instant,
    respond_to: oneshot::Sender<Result<Frame>>,
}

impl PendingCommand {
    fn finish(self, result: Result<Frame>) {
        // The caller may have given up already.
        let _ = self.respond_to.send(result);
    }
}

/// What happened to a correlated frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The pending command was completed and removed.
    Resolved(Command),
    /// No pending command has this id (late or unsolicited response).
    Unmatched,
    /// Wrong frame kind for the pending command, which stays pending.
    Mismatch {
        expected: FrameKind,
        actual: FrameKind,
    },
}

impl Resolution {
    /// The protocol error behind a mismatched response, if any.
    pub fn mismatch_error(&self) -> Option<ChituiError> {
        match self {
            Self::Mismatch { expected, actual } => Some(ChituiError::ProtocolMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PrinterSession {
    identity: PrinterIdentity,
    state: ConnectionState,
    outbound: Option<mpsc::Sender<String>>,
    status: StatusSnapshot,
    attributes: AttributesSnapshot,
    /// Leaf entries keyed by the listing path they were reported under.
    files: BTreeMap<String, Vec<FileEntry>>,
    pending: HashMap<String, PendingCommand>,
    tracking: Option<PrintTracking>,
    is_printing: bool,
}

impl PrinterSession {
    pub fn new(identity: PrinterIdentity) -> Self {
        Self {
            identity,
            state: ConnectionState::Disconnected,
            outbound: None,
            status: StatusSnapshot::default(),
            attributes: AttributesSnapshot::default(),
            files: BTreeMap::new(),
            pending: HashMap::new(),
            tracking: None,
            is_printing: false,
        }
    }

    pub fn identity(&self) -> &PrinterIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> &StatusSnapshot {
        &self.status
    }

    pub fn attributes(&self) -> &AttributesSnapshot {
        &self.attributes
    }

    pub fn is_printing(&self) -> bool {
        self.is_printing
    }

    pub fn tracking(&self) -> Option<&PrintTracking> {
        self.tracking.as_ref()
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<FileEntry>> {
        &self.files
    }

    pub fn files_at(&self, location: &str) -> Option<&[FileEntry]> {
        self.files.get(location).map(Vec::as_slice)
    }

    /// Whether any cached listing holds a file named exactly `filename`.
    pub fn has_file(&self, filename: &str) -> bool {
        self.files
            .values()
            .flatten()
            .any(|entry| entry.file_name() == filename)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn outbound(&self) -> Option<&mpsc::Sender<String>> {
        self.outbound.as_ref()
    }

    pub fn summary(&self) -> PrinterSummary {
        PrinterSummary {
            identity: self.identity.clone(),
            connection: self.state,
            machine_status: self.status.machine_status(),
            is_printing: self.is_printing,
        }
    }

    // -- Connection ---------------------------------------------------------

    /// Move to `next`. Leaving `Connected` drops the outbound channel and
    /// fails every pending command with `SessionNotConnected`.
    pub fn set_state(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ChituiError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if self.state == ConnectionState::Connected && next != ConnectionState::Connected {
            self.outbound = None;
            let id = self.identity.id.clone();
            self.fail_all_pending(|| ChituiError::SessionNotConnected(id.clone()));
        }
        if self.state != next {
            debug!(device_id = %self.identity.id, from = ?self.state, to = ?next, "connection state");
        }
        self.state = next;
        Ok(())
    }

    /// Install the writer for a freshly opened socket and mark the session
    /// connected.
    pub fn attach_outbound(&mut self, outbound: mpsc::Sender<String>) -> Result<()> {
        self.set_state(ConnectionState::Connected)?;
        self.outbound = Some(outbound);
        Ok(())
    }

    // -- Pending commands ---------------------------------------------------

    /// Record a command about to be sent. Returns its correlation id, unique
    /// among this session's outstanding requests, and the receiver its
    /// result will be delivered on.
    pub fn register_pending(
        &mut self,
        command: Command,
        now: Instant,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<Result<Frame>>) {
        let mut correlation_id = new_request_id();
        while self.pending.contains_key(&correlation_id) {
            correlation_id = new_request_id();
        }
        let (respond_to, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingCommand {
                command,
                issued_at: now,
                deadline: now + timeout,
                respond_to,
            },
        );
        (correlation_id, rx)
    }

    /// Drop a pending entry without resolving it (the send itself failed).
    pub fn forget_pending(&mut self, correlation_id: &str) -> Option<Command> {
        self.pending.remove(correlation_id).map(|p| p.command)
    }

    /// Complete the pending command `correlation_id` with `frame`.
    ///
    /// An error frame fails the command with `PrinterRejected`. A frame of
    /// the wrong kind is logged and leaves the entry waiting for its own
    /// response or timeout.
    pub fn resolve_pending(&mut self, correlation_id: &str, frame: &Frame) -> Resolution {
        let Some(pending) = self.pending.get(correlation_id) else {
            debug!(device_id = %self.identity.id, correlation_id, "response without pending command");
            return Resolution::Unmatched;
        };

        let expected = pending.command.expected_response();
        let actual = frame.kind();
        let result = match &frame.body {
            FrameBody::Error { code } => Err(ChituiError::PrinterRejected {
                device_id: self.identity.id.clone(),
                code: *code,
            }),
            _ if actual == expected => Ok(frame.clone()),
            _ => return Resolution::Mismatch { expected, actual },
        };

        let Some(pending) = self.pending.remove(correlation_id) else {
            return Resolution::Unmatched;
        };
        let command = pending.command.clone();
        pending.finish(result);
        Resolution::Resolved(command)
    }

    /// Fail every pending command whose deadline is before `now`. Returns
    /// the correlation ids that were reaped.
    pub fn reap_timeouts(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline < now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                let timeout_ms = pending.deadline.duration_since(pending.issued_at).as_millis() as u64;
                warn!(device_id = %self.identity.id, correlation_id = %id, command = pending.command.name(), timeout_ms, "command timed out");
                let err = ChituiError::CommandTimeout {
                    device_id: self.identity.id.clone(),
                    command: pending.command.name().to_string(),
                    timeout_ms,
                };
                pending.finish(Err(err));
            }
        }
        expired
    }

    /// Fail every pending command with the error built by `make_err`.
    pub fn fail_all_pending(&mut self, make_err: impl Fn() -> ChituiError) {
        for (_, pending) in self.pending.drain() {
            pending.finish(Err(make_err()));
        }
    }

    // -- Inbound frames -----------------------------------------------------

    /// Apply one decoded frame, resolving its pending command first.
    pub fn apply_frame(&mut self, frame: Frame, now: Instant) -> Vec<SessionOutput> {
        // The listing path is only known from the request that asked for it.
        let requested_path = frame
            .correlation_id
            .as_deref()
            .and_then(|id| self.pending.get(id))
            .and_then(|p| match &p.command {
                Command::ListFiles { path } => Some(path.clone()),
                _ => None,
            });

        if let Some(id) = frame.correlation_id.as_deref() {
            if let Some(err) = self.resolve_pending(id, &frame).mismatch_error() {
                warn!(device_id = %self.identity.id, correlation_id = id, error = %err, "response left pending");
            }
        }

        let device_id = self.identity.id.clone();
        match frame.body {
            FrameBody::Status(patch) => self.apply_status(&patch, now),
            FrameBody::Attributes(patch) => self.apply_attributes(&patch),
            FrameBody::FileList(files) => {
                match requested_path.or_else(|| infer_location(&files)) {
                    Some(location) => self.apply_file_list(&location, files),
                    None => {
                        debug!(%device_id, "empty file list with no known location");
                        Vec::new()
                    }
                }
            }
            FrameBody::TaskDetails(details) => self.apply_task_details(details),
            FrameBody::Error { code } => {
                warn!(%device_id, code, "printer reported error");
                vec![SessionOutput::Event(BridgeEvent::Error {
                    device_id,
                    code,
                    message: None,
                })]
            }
            FrameBody::Notice { message } => {
                info!(%device_id, %message, "printer notice");
                vec![SessionOutput::Event(BridgeEvent::Notice { device_id, message })]
            }
            FrameBody::CommandAck { cmd, ack } => {
                debug!(%device_id, cmd, ack, "command acknowledged");
                Vec::new()
            }
            FrameBody::Unknown { .. } => {
                debug!(%device_id, "ignoring unrecognised frame");
                Vec::new()
            }
        }
    }

    /// Merge a status update and react to print and busy edges.
    pub fn apply_status(&mut self, patch: &StatusSnapshot, now: Instant) -> Vec<SessionOutput> {
        let previous_machine = self.status.machine_status();
        let was_printing = self.is_printing;

        self.status.merge(patch);
        self.is_printing = self.status.is_printing();

        let mut outputs = vec![SessionOutput::Event(BridgeEvent::Status {
            device_id: self.identity.id.clone(),
            snapshot: self.status.clone(),
            is_printing: self.is_printing,
        })];

        match (was_printing, self.is_printing) {
            (false, true) => {
                info!(device_id = %self.identity.id, file = ?self.status.print_info.as_ref().and_then(|p| p.filename.as_deref()), "print started");
                self.tracking = Some(PrintTracking::start(now, self.status.print_info.as_ref()));
            }
            (true, false) => {
                info!(device_id = %self.identity.id, "print ended");
                self.tracking = None;
            }
            _ => {}
        }

        if let (Some(tracking), Some(info)) = (self.tracking.as_mut(), self.status.print_info.as_ref()) {
            if !tracking.task_details_requested {
                if let Some(task_id) = info.task_id() {
                    tracking.task_details_requested = true;
                    outputs.push(SessionOutput::Request(Command::FetchTaskDetails {
                        task_ids: vec![task_id.to_string()],
                    }));
                }
            }
            outputs.push(SessionOutput::Event(BridgeEvent::PrintEstimate {
                device_id: self.identity.id.clone(),
                estimate: tracking.estimate(now, info),
            }));
        }

        if previous_machine == Some(MachineStatus::Busy)
            && self.status.machine_status() == Some(MachineStatus::Idle)
        {
            debug!(device_id = %self.identity.id, "left busy state, refreshing local files");
            outputs.push(SessionOutput::Request(Command::ListFiles {
                path: LOCAL_STORAGE.to_string(),
            }));
        }

        outputs
    }

    /// Merge an attributes update; free-space reports also yield a storage
    /// estimate.
    pub fn apply_attributes(&mut self, patch: &AttributesSnapshot) -> Vec<SessionOutput> {
        self.attributes.merge(patch);
        let mut outputs = vec![SessionOutput::Event(BridgeEvent::Attributes {
            device_id: self.identity.id.clone(),
            snapshot: self.attributes.clone(),
        })];
        if let Some(remaining) = patch.remaining_memory {
            outputs.push(SessionOutput::Event(BridgeEvent::Storage {
                device_id: self.identity.id.clone(),
                storage: StorageEstimate::from_remaining(remaining),
            }));
        }
        outputs
    }

    /// Drop the cached listings of `location` and everything below it.
    pub fn forget_files_under(&mut self, location: &str) {
        let location = normalize(location);
        self.files.retain(|key, _| !is_within(key, &location));
    }

    /// Replace the cached listing for `location`, including listings of its
    /// subdirectories, which are fetched again. Other locations are left
    /// alone; directories become listing requests instead of entries.
    pub fn apply_file_list(&mut self, location: &str, files: Vec<RemoteFile>) -> Vec<SessionOutput> {
        let location = normalize(location);
        self.forget_files_under(&location);
        let discovered_at = Utc::now();
        let mut entries = Vec::new();
        let mut requests = Vec::new();

        for file in files {
            let path = full_path(&location, &file.name);
            if file.is_directory() {
                if path == location || path.ends_with("/.") || path.ends_with("/..") {
                    continue;
                }
                requests.push(SessionOutput::Request(Command::ListFiles { path }));
            } else {
                entries.push(FileEntry {
                    path,
                    location: location.clone(),
                    discovered_at,
                });
            }
        }

        debug!(device_id = %self.identity.id, %location, files = entries.len(), dirs = requests.len(), "file list");
        self.files.insert(location.clone(), entries.clone());

        let mut outputs = vec![SessionOutput::Event(BridgeEvent::FileList {
            device_id: self.identity.id.clone(),
            location,
            entries,
        })];
        outputs.extend(requests);
        outputs
    }

    fn apply_task_details(&mut self, details: Vec<TaskDetail>) -> Vec<SessionOutput> {
        let current_task = self
            .status
            .print_info
            .as_ref()
            .and_then(|p| p.task_id())
            .map(str::to_string);

        details
            .into_iter()
            .map(|detail| {
                if let Some(tracking) = self.tracking.as_mut() {
                    if current_task.is_some() && detail.task_id == current_task {
                        tracking.task_detail = Some(detail.clone());
                    }
                }
                SessionOutput::Event(BridgeEvent::TaskDetails {
                    device_id: self.identity.id.clone(),
                    detail,
                })
            })
            .collect()
    }
}

pub(crate) fn normalize(path: &str) -> String {
    match path.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Whether `path` is `location` or lies below it.
fn is_within(path: &str, location: &str) -> bool {
    location == "/"
        || path == location
        || path.strip_prefix(location).is_some_and(|rest| rest.starts_with('/'))
}

fn full_path(location: &str, name: &str) -> String {
    if name.starts_with('/') {
        normalize(name)
    } else if location == "/" {
        format!("/{name}")
    } else {
        normalize(&format!("{location}/{name}"))
    }
}

/// Parent directory of the first absolute entry.
fn infer_location(files: &[RemoteFile]) -> Option<String> {
    files
        .iter()
        .map(|f| normalize(&f.name))
        .find(|name| name.starts_with('/'))
        .and_then(|name| name.rsplit_once('/').map(|(parent, _)| normalize(parent)))
}
