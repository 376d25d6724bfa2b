// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// REST and SSE handlers.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use axum::Json;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chitui_core::config::Settings;
use chitui_core::error::ChituiError;
use chitui_core::human_errors::humanize_error;
use chitui_core::types::PrinterIdentity;
use chitui_relay::transfer::{DetectionOutcome, NOT_DETECTED_NOTICE, UploadReport, UploadRequest};
use chitui_sdcp::progress::{self, TransferProgress};

use super::{ApiError, status_for};
use crate::services::app_services::AppServices;

/// An SSE progress stream ends after this long without an update.
const PROGRESS_IDLE_TIMEOUT: Duration = Duration::from_secs(100);

// -- Status and settings ------------------------------------------------------

pub(super) async fn get_status(State(svc): State<AppServices>) -> Json<Value> {
    let config = svc.bridge.config();
    let delivery = svc.bridge.transfers().delivery();
    let gadget = delivery.is_usb_gadget();
    Json(json!({
        "usb_gadget": {
            "enabled": gadget,
            "path": gadget.then(|| config.usb_gadget_folder.display().to_string()),
        },
        "upload_folder": delivery.staging_folder().display().to_string(),
        "data_folder": config.data_folder.display().to_string(),
        "camera_support": false,
        "printers": svc.bridge.registry().len(),
    }))
}

pub(super) async fn get_settings(State(svc): State<AppServices>) -> Json<Settings> {
    Json(svc.settings())
}

pub(super) async fn post_settings(
    State(svc): State<AppServices>,
    Json(settings): Json<Settings>,
) -> Result<Json<Value>, ApiError> {
    svc.replace_settings(settings)?;
    Ok(Json(json!({"success": true, "message": "Settings saved successfully"})))
}

// -- Printers -----------------------------------------------------------------

pub(super) async fn discover(State(svc): State<AppServices>) -> Response {
    match svc.discover().await {
        Ok(found) if !found.is_empty() => {
            svc.connect_enabled();
            let count = found.len();
            let printers: BTreeMap<String, PrinterIdentity> =
                found.into_iter().map(|p| (p.id.clone(), p)).collect();
            Json(json!({"success": true, "printers": printers, "count": count})).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": "No printers discovered"})),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ManualPrinter {
    ip: Option<String>,
    name: Option<String>,
}

pub(super) async fn add_manual_printer(
    State(svc): State<AppServices>,
    Json(req): Json<ManualPrinter>,
) -> Response {
    let Some(ip) = req.ip.filter(|ip| !ip.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "IP address required"})),
        )
            .into_response();
    };
    match svc.add_manual(ip.trim(), req.name.as_deref()) {
        Ok(printer) => {
            info!(device_id = %printer.id, address = %printer.address, "manual printer added");
            Json(json!({"success": true, "printer_id": printer.id, "printer": printer})).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

pub(super) async fn remove_printer(
    State(svc): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    svc.forget(&id)?;
    Ok(Json(json!({"success": true, "message": "Printer removed"})))
}

#[derive(Debug, Deserialize)]
pub(super) struct ThumbnailQuery {
    url: Option<String>,
}

pub(super) async fn thumbnail(
    State(svc): State<AppServices>,
    Path(id): Path<String>,
    Query(query): Query<ThumbnailQuery>,
) -> Response {
    let Some(url) = query.url.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "No thumbnail URL provided").into_response();
    };
    match svc.bridge.fetch_thumbnail(&url).await {
        Ok(thumb) => ([(header::CONTENT_TYPE, thumb.content_type)], thumb.bytes).into_response(),
        Err(e) => {
            warn!(device_id = %id, error = %e, "thumbnail fetch failed");
            (StatusCode::BAD_GATEWAY, format!("Error: {e}")).into_response()
        }
    }
}

/// Where the printer's camera can be watched. The relay does not decode or
/// re-encode the RTSP stream itself.
pub(super) async fn camera(
    State(svc): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let printer = svc.bridge.registry().summary(&id)?.identity;
    Ok(Json(json!({"ok": true, "url": printer.camera_url(), "relayed": false})))
}

// -- Uploads ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(super) struct ProgressQuery {
    upload_id: Option<String>,
}

/// Printer-side progress as `data:<percent>` events, ending at 100 or with
/// an `error` event.
pub(super) async fn progress(
    State(svc): State<AppServices>,
    Query(query): Query<ProgressQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let upload_id = query.upload_id.unwrap_or_else(|| "default".into());
    let rx = svc.bridge.upload_progress(&upload_id);
    let (tx, mut updates) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let last = progress::follow(rx, PROGRESS_IDLE_TIMEOUT, |p| {
            let _ = tx.send(p.clone());
        })
        .await;
        // Idle and closed streams end without a final update of their own.
        let _ = tx.send(last);
    });

    let stream = async_stream::stream! {
        while let Some(update) = updates.recv().await {
            yield Ok(Event::default().data(update.percent().to_string()));
            if let TransferProgress::Failed { reason } = &update {
                yield Ok(Event::default().event("error").data(reason.clone()));
            }
            if update.is_terminal() {
                break;
            }
        }
        debug!(%upload_id, "progress stream finished");
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn upload_error(status: StatusCode, msg: impl Into<String>, upload_id: Option<&str>) -> Response {
    (
        status,
        Json(json!({"upload": "error", "msg": msg.into(), "upload_id": upload_id})),
    )
        .into_response()
}

/// Copy one multipart field into `dest`. Returns the byte count.
async fn spool_field(mut field: Field<'_>, dest: &FsPath) -> Result<u64, ChituiError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ChituiError::Upload(format!("client upload interrupted: {e}")))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

struct Spooled {
    filename: String,
    path: PathBuf,
    bytes: u64,
}

/// Receive a file for a printer.
///
/// Form fields: `printer` (device id), `file`, and optionally `upload_id`
/// (the key for `/progress`). The file is spooled first so field order does
/// not matter, then handed to the relay's two-phase transfer.
pub(super) async fn upload(State(svc): State<AppServices>, mut multipart: Multipart) -> Response {
    if svc.bridge.transfers().is_busy() {
        warn!("upload rejected, another is running");
        return upload_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Another upload is already in progress. Please wait.",
            None,
        );
    }

    let config = svc.bridge.config();
    let spool = config
        .staging_folder()
        .join(format!(".incoming-{}", uuid::Uuid::new_v4()));
    let mut printer = None;
    let mut upload_id = None;
    let mut file = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                let _ = tokio::fs::remove_file(&spool).await;
                return upload_error(StatusCode::BAD_REQUEST, format!("Malformed request - {e}"), None);
            }
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("printer") => printer = field.text().await.ok().filter(|v| !v.is_empty()),
            Some("upload_id") => upload_id = field.text().await.ok().filter(|v| !v.is_empty()),
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                if filename.is_empty() {
                    return upload_error(StatusCode::BAD_REQUEST, "No file selected.", None);
                }
                if !config.is_allowed_file(&filename) {
                    warn!(%filename, "invalid file type");
                    return upload_error(StatusCode::BAD_REQUEST, "Invalid filetype.", None);
                }
                match spool_field(field, &spool).await {
                    Ok(bytes) => {
                        file = Some(Spooled {
                            filename,
                            path: spool.clone(),
                            bytes,
                        })
                    }
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&spool).await;
                        return upload_error(status_for(&e), humanize_error(&e).message, None);
                    }
                }
            }
            _ => {}
        }
    }

    let Some(file) = file else {
        return upload_error(StatusCode::BAD_REQUEST, "Malformed request - no file.", None);
    };
    let Some(printer) = printer else {
        let _ = tokio::fs::remove_file(&file.path).await;
        return upload_error(StatusCode::BAD_REQUEST, "Malformed request - no printer.", None);
    };
    let upload_id = upload_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(%upload_id, device_id = %printer, filename = %file.filename, bytes = file.bytes, "upload received");

    let result = match tokio::fs::File::open(&file.path).await {
        Ok(source) => {
            let request = UploadRequest {
                upload_id: upload_id.clone(),
                filename: file.filename.clone(),
                total_bytes: Some(file.bytes),
            };
            svc.bridge.upload(&printer, request, source, |_, _| {}).await
        }
        Err(e) => Err(ChituiError::from(e)),
    };
    if let Err(e) = tokio::fs::remove_file(&file.path).await {
        debug!(error = %e, "could not remove spooled upload");
    }

    match result {
        Ok(report) => Json(json!({
            "upload": "success",
            "msg": upload_message(&report),
            "upload_id": upload_id,
            "usb_gadget": report.via_usb_gadget,
            "filename": report.filename,
            "detection": report.detection,
        }))
        .into_response(),
        Err(e) => {
            warn!(%upload_id, error = %e, "upload failed");
            upload_error(status_for(&e), humanize_error(&e).message, Some(&upload_id))
        }
    }
}

fn upload_message(report: &UploadReport) -> &'static str {
    match report.detection {
        Some(DetectionOutcome::Detected { .. }) => "File saved to USB gadget and detected by the printer.",
        Some(DetectionOutcome::Exhausted { .. }) => NOT_DETECTED_NOTICE,
        None => "File uploaded to printer",
    }
}

pub(super) async fn upload_job(
    State(svc): State<AppServices>,
    Path(upload_id): Path<String>,
) -> Response {
    match svc.bridge.transfers().job(&upload_id) {
        Some(job) => Json(job).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": "No such upload in progress"})),
        )
            .into_response(),
    }
}

pub(super) async fn refresh_usb_gadget(State(svc): State<AppServices>) -> Response {
    match svc.bridge.transfers().refresh_gadget().await {
        Ok(true) => Json(json!({
            "success": true,
            "message": "USB gadget reconnected successfully. Printer should detect new files."
        }))
        .into_response(),
        Ok(false) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "message": "Could not trigger automatic refresh. You may need to reconnect USB manually or run ChitUI as root."
            })),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
