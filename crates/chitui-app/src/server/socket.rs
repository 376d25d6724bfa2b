// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dashboard WebSocket: relay events out, printer actions in.
//
// Each socket gets the printer list first, then every relay event as JSON.
// Text frames from the client are actions of the form
// `{"action": "action_pause", "id": "<device id>"}`; each is answered with
// an `actionResult` frame. Actions run concurrently, so a slow printer does
// not hold up the others.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chitui_core::error::Result;
use chitui_core::human_errors::humanize_error;
use chitui_relay::BridgeEvent;

use crate::services::app_services::AppServices;

pub(super) async fn ws_handler(ws: WebSocketUpgrade, State(svc): State<AppServices>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, svc))
}

async fn handle_socket(socket: WebSocket, svc: AppServices) {
    info!("dashboard connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Subscribe before the snapshot so no event falls in between.
    let mut events = svc.bridge.subscribe();
    let snapshot = BridgeEvent::Printers {
        printers: svc.bridge.printers(),
    };
    send_event(&tx, &snapshot);

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let forward_task = {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !send_event(&tx, &event) {
                    break;
                }
            }
        })
    };

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let svc = svc.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = handle_action(&svc, text.as_str()).await;
                    let _ = tx.send(reply.to_string());
                });
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("dashboard disconnected");
    forward_task.abort();
    send_task.abort();
}

/// Queue `event` for the socket. Returns false once the socket is gone.
fn send_event(tx: &mpsc::UnboundedSender<String>, event: &BridgeEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => tx.send(json).is_ok(),
        Err(e) => {
            warn!(event = event.name(), error = %e, "event not serialisable");
            true
        }
    }
}

// -- Actions ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Printers,
    PrinterInfo { id: String },
    PrinterFiles { id: String, url: String },
    ActionDelete { id: String, data: String },
    ActionPrint { id: String, data: String },
    ActionPause { id: String },
    ActionResume { id: String },
    ActionStop { id: String },
    ActionClearHistory { id: String },
    ActionWipeStorage { id: String },
    GetAttributes { id: String },
    GetTaskDetails {
        id: String,
        #[serde(rename = "taskId")]
        task_id: String,
    },
}

impl ClientAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Printers => "printers",
            Self::PrinterInfo { .. } => "printer_info",
            Self::PrinterFiles { .. } => "printer_files",
            Self::ActionDelete { .. } => "action_delete",
            Self::ActionPrint { .. } => "action_print",
            Self::ActionPause { .. } => "action_pause",
            Self::ActionResume { .. } => "action_resume",
            Self::ActionStop { .. } => "action_stop",
            Self::ActionClearHistory { .. } => "action_clear_history",
            Self::ActionWipeStorage { .. } => "action_wipe_storage",
            Self::GetAttributes { .. } => "get_attributes",
            Self::GetTaskDetails { .. } => "get_task_details",
        }
    }

    fn device_id(&self) -> Option<&str> {
        match self {
            Self::Printers => None,
            Self::PrinterInfo { id }
            | Self::PrinterFiles { id, .. }
            | Self::ActionDelete { id, .. }
            | Self::ActionPrint { id, .. }
            | Self::ActionPause { id }
            | Self::ActionResume { id }
            | Self::ActionStop { id }
            | Self::ActionClearHistory { id }
            | Self::ActionWipeStorage { id }
            | Self::GetAttributes { id }
            | Self::GetTaskDetails { id, .. } => Some(id),
        }
    }

    /// Carry out the action. Results with a payload return it.
    async fn run(&self, svc: &AppServices) -> Result<Value> {
        let bridge = &svc.bridge;
        match self {
            Self::Printers => {
                svc.connect_enabled();
                bridge.registry().publish_printers();
            }
            Self::PrinterInfo { id } => {
                bridge.query_status(id).await?;
                bridge.query_attributes(id).await?;
            }
            Self::PrinterFiles { id, url } => {
                return Ok(serde_json::to_value(bridge.list_files(id, url).await?)?);
            }
            Self::ActionDelete { id, data } => bridge.delete_files(id, vec![data.clone()]).await?,
            Self::ActionPrint { id, data } => bridge.start_print(id, data).await?,
            Self::ActionPause { id } => bridge.pause(id).await?,
            Self::ActionResume { id } => bridge.resume(id).await?,
            Self::ActionStop { id } => bridge.stop(id).await?,
            Self::ActionClearHistory { id } => bridge.clear_history(id).await?,
            Self::ActionWipeStorage { id } => {
                warn!(device_id = %id, "formatting printer local storage");
                bridge.wipe_storage(id).await?
            }
            Self::GetAttributes { id } => bridge.query_attributes(id).await?,
            Self::GetTaskDetails { id, task_id } => {
                let details = bridge.fetch_task_details(id, vec![task_id.clone()]).await?;
                return Ok(serde_json::to_value(details)?);
            }
        }
        Ok(Value::Null)
    }
}

/// Parse and run one client frame, producing its `actionResult` reply.
async fn handle_action(svc: &AppServices, raw: &str) -> Value {
    let action: ClientAction = match serde_json::from_str(raw) {
        Ok(action) => action,
        Err(e) => {
            debug!(error = %e, "unreadable client action");
            return json!({
                "event": "actionResult",
                "action": null,
                "ok": false,
                "error": format!("unknown or malformed action: {e}"),
            });
        }
    };
    debug!(action = action.name(), device_id = action.device_id(), "client action");

    match action.run(svc).await {
        Ok(data) => json!({
            "event": "actionResult",
            "action": action.name(),
            "id": action.device_id(),
            "ok": true,
            "data": data,
        }),
        Err(e) => {
            let human = humanize_error(&e);
            warn!(action = action.name(), error = %e, "client action failed");
            json!({
                "event": "actionResult",
                "action": action.name(),
                "id": action.device_id(),
                "ok": false,
                "error": human.message,
                "suggestion": human.suggestion,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::server::serve;
    use crate::services::app_services::tests::test_services;

    #[test]
    fn actions_parse_from_dashboard_frames() {
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"get_task_details","id":"abc","taskId":"t-1"}"#).unwrap();
        assert_eq!(action.name(), "get_task_details");
        assert_eq!(action.device_id(), Some("abc"));

        let action: ClientAction =
            serde_json::from_str(r#"{"action":"action_print","id":"abc","data":"/local/benchy.ctb"}"#).unwrap();
        assert!(matches!(action, ClientAction::ActionPrint { ref data, .. } if data == "/local/benchy.ctb"));
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"action_pause"}"#).is_err());
    }

    #[tokio::test]
    async fn actions_report_failures() {
        let root = tempfile::tempdir().unwrap();
        let svc = test_services(root.path());
        let printer = svc.add_manual("127.0.0.1", None).unwrap();

        let reply = handle_action(&svc, &json!({"action": "action_pause", "id": "missing"}).to_string()).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "That printer isn't connected to the relay.");

        let reply = handle_action(
            &svc,
            &json!({"action": "action_print", "id": printer.id, "data": "/local/a.ctb"}).to_string(),
        )
        .await;
        assert_eq!(reply["action"], "action_print");
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "The printer is offline.");

        let reply = handle_action(&svc, r#"{"action":"launch_rocket"}"#).await;
        assert_eq!(reply["ok"], false);
        assert!(reply["action"].is_null());
        svc.bridge.shutdown();
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("socket open")
                .expect("valid frame");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn socket_pushes_printers_then_answers_actions() {
        let root = tempfile::tempdir().unwrap();
        let svc = test_services(root.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(svc.clone(), listener, async {
            let _ = stop_rx.await;
        }));

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let first = next_json(&mut ws).await;
        assert_eq!(first["event"], "printers");
        assert_eq!(first["printers"], json!([]));

        ws.send(WsMessage::Text(json!({"action": "action_stop", "id": "missing"}).to_string().into()))
            .await
            .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["event"], "actionResult");
        assert_eq!(reply["action"], "action_stop");
        assert_eq!(reply["ok"], false);

        // Adding a printer elsewhere shows up as a pushed event.
        let printer = svc.add_manual("127.0.0.1", Some("Bench")).unwrap();
        let mut seen_printer = false;
        for _ in 0..10 {
            let frame = next_json(&mut ws).await;
            if frame["event"] == "printers"
                && frame["printers"]
                    .as_array()
                    .is_some_and(|list| list.iter().any(|p| p["identity"]["id"] == printer.id.as_str()))
            {
                seen_printer = true;
                break;
            }
        }
        assert!(seen_printer);

        ws.close(None).await.unwrap();
        svc.bridge.shutdown();
        let _ = stop_tx.send(());
        server.await.unwrap().unwrap();
    }
}
