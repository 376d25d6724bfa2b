// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Two-phase upload coordination.
//
// Phase 1 copies the client's stream into the staging folder (the USB gadget
// folder, or a local staging directory for network delivery). Once phase 1
// passes the configured threshold a monitor subscribes to the phase-2
// progress channel, so the first relay-to-printer update is never missed.
// Phase 2 is either a chunked HTTP push or a gadget re-enumeration followed
// by best-effort detection of the new file in the printer's listings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use chitui_core::config::BridgeConfig;
use chitui_core::error::{ChituiError, Result};
use chitui_core::types::PrinterIdentity;
use chitui_sdcp::progress::{self, ProgressHub, TransferProgress};
use chitui_sdcp::retry::{RetryDecision, RetrySchedule};
use chitui_sdcp::upload::{CONFIGFS_GADGET_ROOT, DeliveryPath, NetworkUploader, refresh_usb_gadget, sanitize_filename};

use crate::events::{BridgeEvent, EventBus};

const COPY_BUFFER: usize = 64 * 1024;

/// A phase-2 monitor gives up after this long without an update.
const MONITOR_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub const NOT_DETECTED_NOTICE: &str =
    "File saved but not detected yet. It may take a moment to appear on the printer.";

/// Listing access used by post-transfer detection.
#[async_trait]
pub trait FileProbe: Send + Sync {
    /// Discard the cached listings and ask the printer to list its storage
    /// again. Only listings that arrive after this call count.
    async fn request_listing(&self, device_id: &str) -> Result<()>;

    /// Whether the latest listings contain `filename` (exact match on the
    /// final path component).
    async fn has_file(&self, device_id: &str, filename: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DetectionOutcome {
    /// Found on this (one-based) attempt.
    Detected { attempt: u32 },
    /// Never seen; the upload itself still succeeded.
    Exhausted { attempts: u32 },
}

/// Poll the printer's listings for `filename` on `schedule`.
///
/// Each attempt waits its scheduled delay, requests a fresh listing, waits
/// `listing_wait` for the response to land, then checks. Stops at the first
/// hit.
#[instrument(skip(probe, schedule, listing_wait))]
pub async fn detect_file(
    probe: &dyn FileProbe,
    device_id: &str,
    filename: &str,
    schedule: &RetrySchedule,
    listing_wait: Duration,
) -> DetectionOutcome {
    let mut attempt = 0;
    loop {
        let delay = match schedule.decide(attempt) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::Exhausted => {
                info!(attempts = attempt, "file not detected");
                return DetectionOutcome::Exhausted { attempts: attempt };
            }
        };
        tokio::time::sleep(delay).await;
        attempt += 1;

        if let Err(e) = probe.request_listing(device_id).await {
            warn!(attempt, error = %e, "listing request failed");
            if schedule.decide_after(&e, attempt) == RetryDecision::Exhausted {
                info!(attempts = attempt, "file not detected");
                return DetectionOutcome::Exhausted { attempts: attempt };
            }
            continue;
        }
        tokio::time::sleep(listing_wait).await;

        if probe.has_file(device_id, filename).await {
            info!(attempt, "file detected on printer");
            return DetectionOutcome::Detected { attempt };
        }
        debug!(attempt, "file not listed yet");
    }
}

/// Resolves once the upload is cancelled.
async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    let _ = cancelled.wait_for(|c| *c).await;
}

/// Where an upload currently stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TransferPhase {
    ReceivingFromClient { percent: u8 },
    SendingToPrinter { percent: u8 },
    Detecting,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub upload_id: String,
    pub device_id: String,
    pub filename: String,
    pub client_bytes: u64,
    pub client_total: Option<u64>,
    pub phase: TransferPhase,
}

/// Caller-provided description of an upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Client-generated id, also the key of the phase-2 progress channel.
    pub upload_id: String,
    pub filename: String,
    /// Size announced by the client, if known.
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub upload_id: String,
    pub device_id: String,
    pub filename: String,
    pub bytes: u64,
    pub via_usb_gadget: bool,
    /// Only run for gadget delivery.
    pub detection: Option<DetectionOutcome>,
}

#[derive(Debug)]
struct ActiveUpload {
    upload_id: String,
    device_id: String,
    cancel: watch::Sender<bool>,
}

/// Clears the single-upload slot when the upload ends, however it ends.
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<ActiveUpload>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct TransferCoordinator {
    delivery: DeliveryPath,
    configfs_root: PathBuf,
    uploader: NetworkUploader,
    config: BridgeConfig,
    detection: RetrySchedule,
    hub: ProgressHub,
    events: EventBus,
    active: Mutex<Option<ActiveUpload>>,
    jobs: Arc<Mutex<HashMap<String, TransferJob>>>,
}

impl TransferCoordinator {
    pub fn new(config: &BridgeConfig, delivery: DeliveryPath, hub: ProgressHub, events: EventBus) -> Self {
        Self {
            delivery,
            configfs_root: PathBuf::from(CONFIGFS_GADGET_ROOT),
            uploader: NetworkUploader::new(config.upload_chunk_size),
            config: config.clone(),
            detection: RetrySchedule::new(config.detection_delays.clone()),
            hub,
            events,
            active: Mutex::new(None),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Look for gadget controllers under `root` instead of configfs.
    pub fn with_configfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.configfs_root = root.into();
        self
    }

    pub fn delivery(&self) -> &DeliveryPath {
        &self.delivery
    }

    /// Re-attach the emulated drive so the printer rescans it. Returns
    /// whether a gadget controller was found.
    pub async fn refresh_gadget(&self) -> Result<bool> {
        if !self.delivery.is_usb_gadget() {
            return Err(ChituiError::GadgetUnavailable);
        }
        Ok(refresh_usb_gadget(&self.configfs_root).await)
    }

    /// Phase-2 progress for `upload_id`; valid before the upload starts.
    pub fn subscribe_progress(&self, upload_id: &str) -> watch::Receiver<TransferProgress> {
        self.hub.subscribe(upload_id)
    }

    pub fn job(&self, upload_id: &str) -> Option<TransferJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(upload_id)
            .cloned()
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Abort the active upload if it targets `device_id`.
    pub fn cancel_device(&self, device_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(upload) if upload.device_id == device_id => {
                info!(device_id, upload_id = %upload.upload_id, "cancelling upload");
                upload.cancel.send_replace(true);
                true
            }
            _ => false,
        }
    }

    fn update_job(&self, upload_id: &str, f: impl FnOnce(&mut TransferJob)) {
        if let Some(job) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(upload_id)
        {
            f(job);
        }
    }

    fn claim(&self, upload_id: &str, device_id: &str) -> Result<(ActiveGuard<'_>, watch::Receiver<bool>)> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = active.as_ref() {
            warn!(upload_id, busy_with = %current.upload_id, "upload rejected, another is running");
            return Err(ChituiError::UploadInProgress);
        }
        let (cancel, cancelled) = watch::channel(false);
        *active = Some(ActiveUpload {
            upload_id: upload_id.to_string(),
            device_id: device_id.to_string(),
            cancel,
        });
        Ok((ActiveGuard { slot: &self.active }, cancelled))
    }

    /// Run both phases of an upload of `source` to `printer`.
    ///
    /// `on_client_progress` receives `(bytes_received, total)` as phase 1
    /// advances. Only one upload runs at a time.
    #[instrument(skip_all, fields(upload_id = %request.upload_id, device_id = %printer.id))]
    pub async fn upload<R>(
        &self,
        request: UploadRequest,
        source: R,
        printer: &PrinterIdentity,
        probe: &dyn FileProbe,
        mut on_client_progress: impl FnMut(u64, Option<u64>) + Send,
    ) -> Result<UploadReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        let filename = sanitize_filename(&request.filename)?;
        if !self.config.is_allowed_file(&filename) {
            return Err(ChituiError::UnsupportedFile(filename));
        }
        let (_guard, cancelled) = self.claim(&request.upload_id, &printer.id)?;
        let upload_id = request.upload_id.clone();

        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(
            upload_id.clone(),
            TransferJob {
                upload_id: upload_id.clone(),
                device_id: printer.id.clone(),
                filename: filename.clone(),
                client_bytes: 0,
                client_total: request.total_bytes,
                phase: TransferPhase::ReceivingFromClient { percent: 0 },
            },
        );

        let result = self
            .run(&upload_id, &filename, request.total_bytes, source, printer, probe, cancelled, &mut on_client_progress)
            .await;

        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).remove(&upload_id);
        self.hub.forget(&upload_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run<R>(
        &self,
        upload_id: &str,
        filename: &str,
        total: Option<u64>,
        source: R,
        printer: &PrinterIdentity,
        probe: &dyn FileProbe,
        mut cancelled: watch::Receiver<bool>,
        on_client_progress: &mut (impl FnMut(u64, Option<u64>) + Send),
    ) -> Result<UploadReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        let folder = self.delivery.staging_folder().to_path_buf();
        tokio::fs::create_dir_all(&folder).await?;
        let staged = folder.join(filename);

        // -- Phase 1 --------------------------------------------------------
        let mut monitor = None;
        let copied = tokio::select! {
            copied = self.receive(upload_id, source, &staged, total, &mut monitor, on_client_progress) => copied,
            _ = wait_cancelled(&mut cancelled) => Err(ChituiError::Upload("cancelled".into())),
        };
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "client transfer failed");
                if let Some(handle) = monitor.take() {
                    handle.abort();
                }
                let _ = tokio::fs::remove_file(&staged).await;
                self.hub.publish(upload_id, TransferProgress::Failed { reason: e.to_string() });
                return Err(e);
            }
        };
        info!(bytes, path = %staged.display(), "file received");
        let monitor = match monitor {
            Some(handle) => handle,
            None => self.start_monitor(upload_id),
        };

        // -- Phase 2 --------------------------------------------------------
        let delivered = tokio::select! {
            delivered = self.deliver(upload_id, &staged, printer) => delivered,
            _ = wait_cancelled(&mut cancelled) => Err(ChituiError::Upload("cancelled".into())),
        };
        if let Err(e) = delivered {
            self.hub.publish(upload_id, TransferProgress::Failed { reason: e.to_string() });
            let _ = monitor.await;
            return Err(e);
        }
        match monitor.await {
            Ok(TransferProgress::Failed { reason }) => warn!(%reason, "printer transfer monitor reported failure"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "transfer monitor ended early"),
        }

        // -- Reconciliation -------------------------------------------------
        let detection = if self.delivery.is_usb_gadget() {
            self.update_job(upload_id, |job| job.phase = TransferPhase::Detecting);
            let outcome = tokio::select! {
                outcome = detect_file(probe, &printer.id, filename, &self.detection, self.config.detection_listing_wait) => outcome,
                _ = wait_cancelled(&mut cancelled) => return Err(ChituiError::Upload("cancelled".into())),
            };
            if let DetectionOutcome::Exhausted { .. } = outcome {
                self.events.publish(BridgeEvent::Notice {
                    device_id: printer.id.clone(),
                    message: NOT_DETECTED_NOTICE.to_string(),
                });
            }
            Some(outcome)
        } else {
            if let Err(e) = probe.request_listing(&printer.id).await {
                debug!(error = %e, "post-upload listing refresh failed");
            }
            None
        };

        Ok(UploadReport {
            upload_id: upload_id.to_string(),
            device_id: printer.id.clone(),
            filename: filename.to_string(),
            bytes,
            via_usb_gadget: self.delivery.is_usb_gadget(),
            detection,
        })
    }

    /// Phase 1: copy `source` into `dest`, starting the phase-2 monitor once
    /// the threshold is crossed.
    async fn receive<R>(
        &self,
        upload_id: &str,
        mut source: R,
        dest: &Path,
        total: Option<u64>,
        monitor: &mut Option<JoinHandle<TransferProgress>>,
        on_client_progress: &mut (impl FnMut(u64, Option<u64>) + Send),
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut received: u64 = 0;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            received += n as u64;
            on_client_progress(received, total);

            let percent = total
                .filter(|t| *t > 0)
                .map(|t| (received.min(t) * 100 / t) as u8);
            if let Some(percent) = percent {
                self.update_job(upload_id, |job| {
                    job.client_bytes = received;
                    job.phase = TransferPhase::ReceivingFromClient { percent };
                });
                if monitor.is_none() && percent >= self.config.phase_two_threshold.min(100) {
                    debug!(percent, "threshold reached, monitoring printer transfer");
                    *monitor = Some(self.start_monitor(upload_id));
                }
            } else {
                self.update_job(upload_id, |job| job.client_bytes = received);
            }
        }
        file.flush().await?;
        Ok(received)
    }

    /// Follow phase-2 progress for `upload_id`, mirroring it into the job.
    fn start_monitor(&self, upload_id: &str) -> JoinHandle<TransferProgress> {
        let rx = self.hub.subscribe(upload_id);
        let jobs = Arc::clone(&self.jobs);
        let key = upload_id.to_string();
        tokio::spawn(async move {
            progress::follow(rx, MONITOR_IDLE_TIMEOUT, |update| {
                if matches!(update, TransferProgress::Pending) {
                    return;
                }
                let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(job) = jobs.get_mut(&key) {
                    if job.phase != TransferPhase::Detecting {
                        job.phase = TransferPhase::SendingToPrinter {
                            percent: update.percent(),
                        };
                    }
                }
            })
            .await
        })
    }

    async fn deliver(&self, upload_id: &str, staged: &Path, printer: &PrinterIdentity) -> Result<()> {
        self.update_job(upload_id, |job| job.phase = TransferPhase::SendingToPrinter { percent: 0 });
        match &self.delivery {
            DeliveryPath::Network { .. } => {
                self.uploader
                    .upload(&printer.upload_url(), staged, upload_id, &self.hub)
                    .await?;
                if let Err(e) = tokio::fs::remove_file(staged).await {
                    debug!(error = %e, "could not remove staged file");
                }
                Ok(())
            }
            DeliveryPath::UsbGadget { .. } => {
                self.hub.publish(upload_id, TransferProgress::InProgress { percent: 50 });
                refresh_usb_gadget(&self.configfs_root).await;
                self.hub.publish(upload_id, TransferProgress::Done);
                Ok(())
            }
        }
    }
}
