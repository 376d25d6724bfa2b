// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Relay-to-printer file delivery.
//
// Two paths exist.  With a writable USB gadget folder the relay stores the
// file where the printer sees it as removable storage and nudges the gadget
// to re-enumerate.  Otherwise the staged file is pushed to the mainboard's
// HTTP endpoint in fixed-size multipart chunks, each carrying the whole
// file's MD5 and its own offset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use chitui_core::config::BridgeConfig;
use chitui_core::error::{ChituiError, Result};

use crate::progress::{ProgressHub, TransferProgress};

/// Per-chunk HTTP timeout.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between detaching and re-attaching the gadget.
const UDC_REBIND_PAUSE: Duration = Duration::from_millis(500);

/// Where configfs exposes USB gadgets.
pub const CONFIGFS_GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget";

/// How staged files reach the printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Files are written straight into the emulated drive.
    UsbGadget { folder: PathBuf },
    /// Files are staged locally, then pushed over HTTP.
    Network { staging: PathBuf },
}

impl DeliveryPath {
    /// Folder phase 1 writes into.
    pub fn staging_folder(&self) -> &Path {
        match self {
            Self::UsbGadget { folder } => folder,
            Self::Network { staging } => staging,
        }
    }

    pub fn is_usb_gadget(&self) -> bool {
        matches!(self, Self::UsbGadget { .. })
    }
}

/// Pick the delivery path: the gadget folder when it exists and is
/// writable, the network otherwise.
pub fn select_delivery_path(config: &BridgeConfig) -> DeliveryPath {
    match probe_writable(&config.usb_gadget_folder) {
        Ok(()) => {
            info!(folder = %config.usb_gadget_folder.display(), "USB gadget found and writable");
            DeliveryPath::UsbGadget {
                folder: config.usb_gadget_folder.clone(),
            }
        }
        Err(e) => {
            warn!(
                folder = %config.usb_gadget_folder.display(),
                error = %e,
                "USB gadget unavailable, uploading over the network"
            );
            DeliveryPath::Network {
                staging: config.staging_folder(),
            }
        }
    }
}

/// Fails unless `folder` exists and accepts a test write.
pub fn probe_writable(folder: &Path) -> Result<()> {
    if !folder.is_dir() {
        return Err(ChituiError::Upload(format!(
            "{} does not exist",
            folder.display()
        )));
    }
    let probe = folder.join(".write_test");
    std::fs::write(&probe, b"test")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

/// Reduce a client-supplied name to a safe single path component.
///
/// Directory parts are dropped, whitespace becomes `_`, and anything other
/// than ASCII letters, digits, `.`, `_` and `-` is removed.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();
    if cleaned.is_empty() {
        return Err(ChituiError::UnsupportedFile(name.to_string()));
    }
    Ok(cleaned)
}

/// MD5 of a file as lowercase hex.
pub async fn file_md5(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Chunked HTTP uploader for the mainboard's `/uploadFile/upload`.
#[derive(Debug, Clone)]
pub struct NetworkUploader {
    client: reqwest::Client,
    chunk_size: usize,
}

impl NetworkUploader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Push `path` to `url`, publishing progress under `upload_id`.
    ///
    /// Publishes `Done` on success and `Failed` on any error; the error is
    /// also returned.
    #[instrument(skip(self, path, hub), fields(path = %path.display()))]
    pub async fn upload(&self, url: &str, path: &Path, upload_id: &str, hub: &ProgressHub) -> Result<()> {
        hub.publish(upload_id, TransferProgress::InProgress { percent: 0 });
        match self.send_chunks(url, path, upload_id, hub).await {
            Ok(()) => {
                info!("upload complete");
                hub.publish(upload_id, TransferProgress::Done);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "upload to printer failed");
                hub.publish(
                    upload_id,
                    TransferProgress::Failed {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn send_chunks(&self, url: &str, path: &Path, upload_id: &str, hub: &ProgressHub) -> Result<()> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ChituiError::Upload(format!("no file name in {}", path.display())))?
            .to_string();
        let md5 = file_md5(path).await?;
        let total = tokio::fs::metadata(path).await?.len();
        let transfer_uuid = Uuid::new_v4().to_string();
        let mut file = tokio::fs::File::open(path).await?;
        let mut offset: u64 = 0;

        loop {
            let mut chunk = Vec::with_capacity(self.chunk_size);
            (&mut file)
                .take(self.chunk_size as u64)
                .read_to_end(&mut chunk)
                .await?;
            let len = chunk.len() as u64;

            // An empty file still needs one (empty) part.
            if len == 0 && offset > 0 {
                break;
            }

            let form = Form::new()
                .text("S-File-MD5", md5.clone())
                .text("Check", "1")
                .text("Offset", offset.to_string())
                .text("Uuid", transfer_uuid.clone())
                .text("TotalSize", total.to_string())
                .part("File", Part::bytes(chunk).file_name(filename.clone()));
            self.post_chunk(url, form, offset).await?;

            offset += len;
            let percent = if total == 0 { 100 } else { (offset * 100 / total).min(100) as u8 };
            hub.publish(upload_id, TransferProgress::InProgress { percent });
            debug!(offset, total, "chunk uploaded");

            if len < self.chunk_size as u64 {
                break;
            }
        }
        Ok(())
    }

    async fn post_chunk(&self, url: &str, form: Form, offset: u64) -> Result<()> {
        let response = self
            .client
            .post(url)
            .multipart(form)
            .timeout(CHUNK_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChituiError::Upload(format!("chunk at {offset}: {e}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ChituiError::Upload(format!("chunk at {offset}: bad reply: {e}")))?;
        if body.get("success").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(ChituiError::Upload(format!("printer rejected chunk at {offset}: {body}")))
        }
    }
}

/// Re-enumerate the USB gadget so the printer rescans the drive.
///
/// Every `<root>/<gadget>/UDC` holding a controller name is detached
/// (written empty), then re-attached. Returns whether a rebind happened.
#[instrument]
pub async fn refresh_usb_gadget(configfs_root: &Path) -> bool {
    let mut gadgets = match tokio::fs::read_dir(configfs_root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "no configfs gadgets");
            return false;
        }
    };

    loop {
        let entry = match gadgets.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stopped scanning gadgets");
                break;
            }
        };
        let udc = entry.path().join("UDC");
        match rebind(&udc).await {
            Ok(true) => {
                info!(udc = %udc.display(), "USB gadget reconnected");
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(udc = %udc.display(), error = %e, "could not rebind USB gadget"),
        }
    }

    info!("could not trigger USB gadget reconnect; the printer will pick the file up on its next scan");
    false
}

async fn rebind(udc: &Path) -> Result<bool> {
    let controller = match tokio::fs::read_to_string(udc).await {
        Ok(value) => value.trim().to_string(),
        Err(_) => return Ok(false),
    };
    if controller.is_empty() || controller == "none" {
        return Ok(false);
    }
    tokio::fs::write(udc, b"").await?;
    tokio::time::sleep(UDC_REBIND_PAUSE).await;
    tokio::fs::write(udc, controller.as_bytes()).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\models\\my part.ctb").unwrap(), "my_part.ctb");
        assert_eq!(sanitize_filename("bénchy$.goo").unwrap(), "bnchy.goo");
        assert_eq!(sanitize_filename(".hidden.prz").unwrap(), "hidden.prz");
        assert!(sanitize_filename("../").is_err());
    }

    #[test]
    fn gadget_selection_falls_back_to_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig {
            data_folder: dir.path().join("data"),
            usb_gadget_folder: dir.path().join("missing"),
            ..BridgeConfig::default()
        };
        assert_eq!(
            select_delivery_path(&config),
            DeliveryPath::Network {
                staging: dir.path().join("data").join("uploads")
            }
        );

        config.usb_gadget_folder = dir.path().to_path_buf();
        let path = select_delivery_path(&config);
        assert!(path.is_usb_gadget());
        assert_eq!(path.staging_folder(), dir.path());
        assert!(!dir.path().join(".write_test").exists());
    }

    #[tokio::test]
    async fn md5_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ctb");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(file_md5(&path).await.unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn rebinds_configfs_udc() {
        let root = tempfile::tempdir().unwrap();
        let gadget = root.path().join("g1");
        std::fs::create_dir(&gadget).unwrap();
        std::fs::write(gadget.join("UDC"), "fe980000.usb\n").unwrap();
        let idle = root.path().join("g0");
        std::fs::create_dir(&idle).unwrap();
        std::fs::write(idle.join("UDC"), "\n").unwrap();

        assert!(refresh_usb_gadget(root.path()).await);
        assert_eq!(std::fs::read_to_string(gadget.join("UDC")).unwrap(), "fe980000.usb");
        assert!(!refresh_usb_gadget(&root.path().join("absent")).await);
    }

    /// Minimal HTTP/1.1 endpoint answering every request with `reply` and
    /// recording request bodies.
    async fn fake_printer(reply: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/uploadFile/upload", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let seen = bodies.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut content_length = 0usize;
                        let mut line = String::new();
                        loop {
                            line.clear();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            let header = line.trim_end();
                            if header.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = header.split_once(':') {
                                if name.eq_ignore_ascii_case("content-length") {
                                    content_length = value.trim().parse().unwrap();
                                }
                            }
                        }
                        let mut body = vec![0u8; content_length];
                        reader.read_exact(&mut body).await.unwrap();
                        seen.lock().unwrap().push(String::from_utf8_lossy(&body).into_owned());
                        let response = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                            reply.len(),
                            reply
                        );
                        reader.get_mut().write_all(response.as_bytes()).await.unwrap();
                    }
                });
            }
        });
        (url, bodies)
    }

    #[tokio::test]
    async fn uploads_in_chunks_with_offsets() {
        let (url, bodies) = fake_printer(r#"{"success":true}"#).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchy.ctb");
        std::fs::write(&path, b"0123456789").unwrap();

        let hub = ProgressHub::new();
        NetworkUploader::new(4)
            .upload(&url, &path, "up-1", &hub)
            .await
            .unwrap();

        assert_eq!(*hub.subscribe("up-1").borrow(), TransferProgress::Done);
        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 3);
        let md5 = "781e5e245d69b566979b86e28d23f2c7";
        for (body, offset) in bodies.iter().zip(["0", "4", "8"]) {
            assert!(body.contains(md5));
            assert!(body.contains(&format!("name=\"Offset\"\r\n\r\n{offset}\r\n")));
            assert!(body.contains("filename=\"benchy.ctb\""));
        }
    }

    #[tokio::test]
    async fn rejected_chunk_fails_the_upload() {
        let (url, _) = fake_printer(r#"{"success":false}"#).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchy.ctb");
        std::fs::write(&path, b"data").unwrap();

        let hub = ProgressHub::new();
        let err = NetworkUploader::new(1024)
            .upload(&url, &path, "up-2", &hub)
            .await
            .unwrap_err();
        assert!(matches!(err, ChituiError::Upload(_)));
        assert!(matches!(*hub.subscribe("up-2").borrow(), TransferProgress::Failed { .. }));
    }
}
