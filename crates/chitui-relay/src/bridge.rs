// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bridge facade: wires transport, registry, dispatcher, and transfers.
//
// Every field is cheaply cloneable so the bridge can be moved into tasks.
// Each printer gets a WebSocket connection task and a pump task; the pump
// turns transport signals into state changes and decoded frames into
// registry routes, and dispatches whatever follow-up requests the session
// asks for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use chitui_core::config::BridgeConfig;
use chitui_core::error::{ChituiError, Result};
use chitui_core::types::{ConnectionState, FileEntry, PrinterIdentity, PrinterSummary, TaskDetail};
use chitui_sdcp::codec::{Frame, FrameBody, decode};
use chitui_sdcp::command::Command;
use chitui_sdcp::progress::{ProgressHub, TransferProgress};
use chitui_sdcp::retry::RECONNECT_DELAY;
use chitui_sdcp::transport::{PrinterConnection, TransportEvent};
use chitui_sdcp::upload::{DeliveryPath, select_delivery_path};

use crate::dispatcher::CommandDispatcher;
use crate::events::{EventBus, Subscription};
use crate::registry::SessionRegistry;
use crate::session::normalize;
use crate::transfer::{FileProbe, TransferCoordinator, UploadReport, UploadRequest};

const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Served when the printer omits a content type.
const DEFAULT_THUMBNAIL_TYPE: &str = "image/bmp";

/// Storage locations refreshed after uploads.
const LISTED_LOCATIONS: [&str; 2] = ["/usb", "/local"];

/// Bytes of a proxied thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thumbnail {
    pub content_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

struct Connection {
    socket: PrinterConnection,
    pump: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.socket.close();
        self.pump.abort();
    }
}

#[derive(Clone)]
pub struct Bridge {
    config: Arc<BridgeConfig>,
    registry: Arc<SessionRegistry>,
    dispatcher: CommandDispatcher,
    transfers: Arc<TransferCoordinator>,
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    http: reqwest::Client,
}

impl Bridge {
    /// Build a bridge, probing the USB gadget folder to pick the delivery
    /// path.
    pub fn new(config: BridgeConfig) -> Self {
        let delivery = select_delivery_path(&config);
        Self::with_delivery(config, delivery)
    }

    pub fn with_delivery(config: BridgeConfig, delivery: DeliveryPath) -> Self {
        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(SessionRegistry::new(events.clone()));
        let transfers = TransferCoordinator::new(&config, delivery, ProgressHub::new(), events);
        Self {
            dispatcher: CommandDispatcher::new(Arc::clone(&registry)),
            registry,
            transfers: Arc::new(transfers),
            connections: Arc::new(Mutex::new(HashMap::new())),
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    pub fn subscribe(&self) -> Subscription {
        self.registry.events().subscribe()
    }

    pub fn printers(&self) -> Vec<PrinterSummary> {
        self.registry.snapshot_all()
    }

    // -- Printers -----------------------------------------------------------

    /// Register `identity` and connect to its WebSocket endpoint.
    pub fn add_printer(&self, identity: PrinterIdentity) -> Result<()> {
        let url = identity.websocket_url();
        self.add_printer_at(identity, url)
    }

    /// Like [`add_printer`](Self::add_printer) with an explicit endpoint.
    pub fn add_printer_at(&self, identity: PrinterIdentity, url: String) -> Result<()> {
        let device_id = identity.id.clone();
        self.registry.register(identity)?;
        info!(%device_id, %url, "connecting to printer");

        let (socket, events) = PrinterConnection::spawn(url, RECONNECT_DELAY);
        let pump = tokio::spawn(self.clone().pump(device_id.clone(), events));
        let previous = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id, Connection { socket, pump });
        if let Some(stale) = previous {
            stale.close();
        }
        Ok(())
    }

    /// Disconnect and deregister a printer. Its pending commands fail with
    /// `SessionRemoved` and an upload to it is cancelled.
    pub fn remove_printer(&self, device_id: &str) -> Result<PrinterIdentity> {
        self.transfers.cancel_device(device_id);
        let connection = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
        if let Some(connection) = connection {
            connection.close();
        }
        self.registry.remove(device_id)
    }

    /// Remove every printer.
    pub fn shutdown(&self) {
        for device_id in self.registry.ids() {
            if let Err(e) = self.remove_printer(&device_id) {
                debug!(%device_id, error = %e, "printer already gone");
            }
        }
        info!("bridge shut down");
    }

    /// Fail timed-out commands every `reap_interval`.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.reap_timeouts(tokio::time::Instant::now().into_std());
            }
        })
    }

    async fn pump(self, device_id: String, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connecting => self.transition(&device_id, ConnectionState::Connecting),
                TransportEvent::Connected(outbound) => {
                    if let Err(e) = self.registry.attach(&device_id, outbound) {
                        warn!(%device_id, error = %e, "could not attach connection");
                        continue;
                    }
                    info!(%device_id, "printer connected");
                    for command in [
                        Command::QueryStatus,
                        Command::QueryAttributes,
                        Command::ListFiles { path: "/local".into() },
                    ] {
                        self.dispatch_background(&device_id, command);
                    }
                }
                TransportEvent::Message(text) => self.handle_message(&device_id, &text),
                TransportEvent::Disconnected => self.transition(&device_id, ConnectionState::Disconnected),
                TransportEvent::Failed(reason) => {
                    debug!(%device_id, %reason, "transport failure");
                    self.transition(&device_id, ConnectionState::Error);
                }
            }
        }
        debug!(%device_id, "transport events closed");
    }

    fn transition(&self, device_id: &str, state: ConnectionState) {
        if let Err(e) = self.registry.set_connection_state(device_id, state) {
            debug!(device_id, error = %e, "ignoring transport signal");
        }
    }

    fn handle_message(&self, device_id: &str, text: &str) {
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device_id, error = %e, "dropping frame");
                return;
            }
        };
        if frame.device_id != device_id {
            debug!(device_id, frame_device = %frame.device_id, "frame carries a different mainboard id");
        }
        // Frames belong to the session whose socket they arrived on.
        let now = tokio::time::Instant::now().into_std();
        match self.registry.route(device_id, frame, now) {
            Ok(follow_ups) => {
                for command in follow_ups {
                    self.dispatch_background(device_id, command);
                }
            }
            Err(e) => debug!(device_id, error = %e, "frame not routed"),
        }
    }

    /// Send without waiting; queries get one resend and failures are logged.
    fn dispatch_background(&self, device_id: &str, command: Command) {
        let dispatcher = self.dispatcher.clone();
        let device_id = device_id.to_string();
        let timeout = self.config.command_timeout;
        tokio::spawn(async move {
            let name = command.name();
            if let Err(e) = dispatcher.send_query(&device_id, command, timeout).await {
                debug!(%device_id, command = name, error = %e, "background command failed");
            }
        });
    }

    // -- Commands -----------------------------------------------------------

    /// Send any command with the configured timeout.
    pub async fn send(&self, device_id: &str, command: Command) -> Result<Frame> {
        self.dispatcher.send(device_id, command, self.config.command_timeout).await
    }

    async fn send_acked(&self, device_id: &str, command: Command) -> Result<()> {
        self.dispatcher
            .send_acked(device_id, command, self.config.command_timeout)
            .await
            .map(|_| ())
    }

    pub async fn query_status(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::QueryStatus).await
    }

    pub async fn query_attributes(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::QueryAttributes).await
    }

    /// List `path` and return the cached leaf entries for it.
    pub async fn list_files(&self, device_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        self.send(device_id, Command::ListFiles { path: path.to_string() }).await?;
        self.registry.with_session(device_id, |session| {
            session
                .files_at(&normalize(path))
                .map(<[FileEntry]>::to_vec)
                .unwrap_or_default()
        })
    }

    pub async fn delete_files(&self, device_id: &str, paths: Vec<String>) -> Result<()> {
        self.send_acked(device_id, Command::DeleteFiles { paths }).await
    }

    pub async fn start_print(&self, device_id: &str, filename: &str) -> Result<()> {
        self.send_acked(
            device_id,
            Command::StartPrint {
                filename: filename.to_string(),
                start_layer: 0,
            },
        )
        .await
    }

    pub async fn pause(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::Pause).await
    }

    pub async fn resume(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::Resume).await
    }

    pub async fn stop(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::Stop).await
    }

    pub async fn clear_history(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::ClearHistory).await
    }

    pub async fn wipe_storage(&self, device_id: &str) -> Result<()> {
        self.send_acked(device_id, Command::WipeStorage).await
    }

    pub async fn fetch_task_details(&self, device_id: &str, task_ids: Vec<String>) -> Result<Vec<TaskDetail>> {
        let frame = self.send(device_id, Command::FetchTaskDetails { task_ids }).await?;
        match frame.body {
            FrameBody::TaskDetails(details) => Ok(details),
            _ => Ok(Vec::new()),
        }
    }

    // -- Transfers ----------------------------------------------------------

    /// Upload `source` to `device_id`. See [`TransferCoordinator::upload`].
    #[instrument(skip(self, request, source, on_client_progress), fields(upload_id = %request.upload_id))]
    pub async fn upload<R>(
        &self,
        device_id: &str,
        request: UploadRequest,
        source: R,
        on_client_progress: impl FnMut(u64, Option<u64>) + Send,
    ) -> Result<UploadReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        let printer = self.registry.summary(device_id)?.identity;
        let probe = BridgeProbe { bridge: self.clone() };
        self.transfers
            .upload(request, source, &printer, &probe, on_client_progress)
            .await
    }

    /// Phase-2 progress stream for `upload_id`.
    pub fn upload_progress(&self, upload_id: &str) -> watch::Receiver<TransferProgress> {
        self.transfers.subscribe_progress(upload_id)
    }

    /// Fetch a task thumbnail as-is.
    #[instrument(skip(self))]
    pub async fn fetch_thumbnail(&self, url: &str) -> Result<Thumbnail> {
        let response = self
            .http
            .get(url)
            .timeout(THUMBNAIL_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChituiError::Transport(format!("thumbnail {url}: {e}")))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_THUMBNAIL_TYPE)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChituiError::Transport(format!("thumbnail {url}: {e}")))?;
        Ok(Thumbnail {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

/// Detection probe backed by the live sessions.
struct BridgeProbe {
    bridge: Bridge,
}

#[async_trait]
impl FileProbe for BridgeProbe {
    async fn request_listing(&self, device_id: &str) -> Result<()> {
        for location in LISTED_LOCATIONS {
            self.bridge.registry.forget_files(device_id, location)?;
        }
        let summary = self.bridge.registry.summary(device_id)?;
        if summary.connection != ConnectionState::Connected {
            return Err(ChituiError::SessionNotConnected(device_id.to_string()));
        }
        for location in LISTED_LOCATIONS {
            self.bridge.dispatch_background(
                device_id,
                Command::ListFiles {
                    path: location.to_string(),
                },
            );
        }
        Ok(())
    }

    async fn has_file(&self, device_id: &str, filename: &str) -> bool {
        self.bridge.registry.has_file(device_id, filename).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::events::BridgeEvent;
    use crate::transfer::{DetectionOutcome, detect_file};
    use chitui_core::types::RemoteFile;
    use chitui_sdcp::retry::RetrySchedule;

    const DEVICE: &str = "000000000001d354";

    fn identity() -> PrinterIdentity {
        PrinterIdentity {
            id: DEVICE.into(),
            connection_id: "conn".into(),
            name: "Saturn".into(),
            brand: "ELEGOO".into(),
            model: "Saturn 4 Ultra".into(),
            address: "127.0.0.1".into(),
            protocol_version: Some("V3.0.0".into()),
            firmware_version: None,
            manual: false,
        }
    }

    fn bridge(staging: &std::path::Path) -> Bridge {
        Bridge::with_delivery(
            BridgeConfig::default(),
            DeliveryPath::Network {
                staging: staging.to_path_buf(),
            },
        )
    }

    /// Minimal SDCP printer: answers every request on one socket.
    async fn fake_printer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/websocket", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                let cmd = request["Data"]["Cmd"].as_u64().unwrap();
                let request_id = request["Data"]["RequestID"].clone();
                let data = match cmd {
                    258 => json!({"Ack": 0, "FileList": [
                        {"name": "/local/benchy.ctb", "type": 1, "usedSize": 1024},
                        {"name": "/local/cube.goo", "type": 1, "usedSize": 2048}
                    ]}),
                    321 => json!({"Ack": 0, "HistoryDetailList": [{"TaskId": "t1", "TaskName": "benchy.ctb"}]}),
                    130 => json!({"Ack": 1}),
                    _ => json!({"Ack": 0}),
                };
                let response = json!({
                    "Id": "conn",
                    "Data": {"Cmd": cmd, "Data": data, "RequestID": request_id, "MainboardID": DEVICE, "TimeStamp": 1},
                    "Topic": format!("sdcp/response/{DEVICE}"),
                });
                ws.send(Message::Text(response.to_string().into())).await.unwrap();
                if cmd == 0 {
                    let status = json!({
                        "Status": {"CurrentStatus": [0]},
                        "MainboardID": DEVICE,
                        "Topic": format!("sdcp/status/{DEVICE}"),
                    });
                    ws.send(Message::Text(status.to_string().into())).await.unwrap();
                }
            }
        });
        url
    }

    async fn wait_connected(sub: &mut Subscription) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(BridgeEvent::Printers { printers }) = sub.recv().await {
                    if printers.first().is_some_and(|p| p.connection == ConnectionState::Connected) {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn commands_round_trip_through_a_printer() {
        let staging = tempfile::tempdir().unwrap();
        let bridge = bridge(staging.path());
        let mut sub = bridge.subscribe();
        let url = fake_printer().await;
        bridge.add_printer_at(identity(), url).unwrap();
        wait_connected(&mut sub).await;

        let files = bridge.list_files(DEVICE, "/local").await.unwrap();
        let names: Vec<&str> = files.iter().map(FileEntry::file_name).collect();
        assert_eq!(names, ["benchy.ctb", "cube.goo"]);

        bridge.pause(DEVICE).await.unwrap();
        assert!(matches!(
            bridge.stop(DEVICE).await,
            Err(ChituiError::PrinterRejected { code: 1, .. })
        ));
        let details = bridge.fetch_task_details(DEVICE, vec!["t1".into()]).await.unwrap();
        assert_eq!(details[0].task_name.as_deref(), Some("benchy.ctb"));

        bridge.remove_printer(DEVICE).unwrap();
        assert!(bridge.printers().is_empty());
        assert!(matches!(bridge.pause(DEVICE).await, Err(ChituiError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn commands_to_unconnected_printer_fail_fast() {
        let staging = tempfile::tempdir().unwrap();
        let bridge = bridge(staging.path());
        // Nothing listens here, so the session never connects.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        bridge.add_printer_at(identity(), format!("ws://{addr}/websocket")).unwrap();

        assert!(matches!(
            bridge.start_print(DEVICE, "/local/benchy.ctb").await,
            Err(ChituiError::SessionNotConnected(_))
        ));
        assert!(matches!(
            bridge.add_printer(identity()),
            Err(ChituiError::DuplicateIdentity(_))
        ));
        bridge.shutdown();
        assert!(bridge.printers().is_empty());
    }

    #[tokio::test]
    async fn detection_ignores_listings_cached_before_the_upload() {
        let staging = tempfile::tempdir().unwrap();
        let bridge = bridge(staging.path());
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        bridge.add_printer_at(identity(), format!("ws://{addr}/websocket")).unwrap();
        bridge
            .registry()
            .with_session(DEVICE, |s| {
                s.apply_file_list(
                    "/usb",
                    vec![RemoteFile {
                        name: "/usb/benchy.ctb".into(),
                        kind: 1,
                        used_size: None,
                        total_size: None,
                        storage_type: None,
                    }],
                )
            })
            .unwrap();
        assert!(bridge.registry().has_file(DEVICE, "benchy.ctb").unwrap());

        let probe = BridgeProbe { bridge: bridge.clone() };
        let outcome = detect_file(
            &probe,
            DEVICE,
            "benchy.ctb",
            &RetrySchedule::new(vec![Duration::from_millis(1); 2]),
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(outcome, DetectionOutcome::Exhausted { attempts: 2 });
        assert!(bridge.registry().with_session(DEVICE, |s| s.files().is_empty()).unwrap());
        bridge.shutdown();
    }

    #[tokio::test]
    async fn thumbnail_defaults_to_bmp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/thumb", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nBM!")
                .await
                .unwrap();
        });

        let staging = tempfile::tempdir().unwrap();
        let thumbnail = bridge(staging.path()).fetch_thumbnail(&url).await.unwrap();
        assert_eq!(thumbnail.content_type, "image/bmp");
        assert_eq!(thumbnail.bytes, b"BM!");
    }
}
