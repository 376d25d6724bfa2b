// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One WebSocket client task per printer.
//
// The task connects to `ws://<ip>:3030/websocket`, forwards text frames as
// `TransportEvent::Message`, and writes outbound frames taken from an mpsc
// channel handed out in `TransportEvent::Connected`.  When the socket drops
// it waits and reconnects until the handle is closed or dropped.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

/// Capacity of the per-connection outbound queue.
const OUTBOUND_CAPACITY: usize = 64;

/// Capacity of the transport event queue.
const EVENT_CAPACITY: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection signals surfaced to the session layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting,
    /// Socket is open; frames written to the sender go to the printer.
    Connected(mpsc::Sender<String>),
    /// A text frame from the printer.
    Message(String),
    /// The printer closed the socket.
    Disconnected,
    /// Connect or I/O failure.
    Failed(String),
}

/// Handle to a running connection task. Dropping it stops the task.
#[derive(Debug)]
pub struct PrinterConnection {
    url: String,
    task: JoinHandle<()>,
}

impl PrinterConnection {
    /// Start connecting to `url`. Events arrive on the returned receiver.
    pub fn spawn(url: String, reconnect_delay: Duration) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let task = tokio::spawn(run(url.clone(), reconnect_delay, events_tx));
        (Self { url, task }, events_rx)
    }

    /// Stop the task and drop the socket.
    pub fn close(&self) {
        debug!(url = %self.url, "closing printer connection");
        self.task.abort();
    }
}

impl Drop for PrinterConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Why one socket session ended.
enum SessionEnd {
    Closed,
    Failed(String),
    /// Nobody listens to events any more.
    Abandoned,
}

#[instrument(skip(reconnect_delay, events))]
async fn run(url: String, reconnect_delay: Duration, events: mpsc::Sender<TransportEvent>) {
    loop {
        if events.send(TransportEvent::Connecting).await.is_err() {
            return;
        }

        let end = match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                info!("connected");
                serve(socket, &events).await
            }
            Err(e) => SessionEnd::Failed(e.to_string()),
        };

        let signal = match end {
            SessionEnd::Abandoned => return,
            SessionEnd::Closed => {
                info!("connection closed by printer");
                TransportEvent::Disconnected
            }
            SessionEnd::Failed(reason) => {
                warn!(%reason, "connection failed");
                TransportEvent::Failed(reason)
            }
        };
        if events.send(signal).await.is_err() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn serve(socket: Socket, events: &mpsc::Sender<TransportEvent>) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    if events.send(TransportEvent::Connected(out_tx)).await.is_err() {
        return SessionEnd::Abandoned;
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Message(text.to_string())).await.is_err() {
                        return SessionEnd::Abandoned;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
            },
            Some(text) = out_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return SessionEnd::Failed(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn relays_frames_both_ways_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/websocket", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let request = ws.next().await.unwrap().unwrap();
            assert_eq!(request.into_text().unwrap().as_str(), "ping");
            ws.send(Message::Text("pong".into())).await.unwrap();
            ws.close(None).await.unwrap();
            // Hold the reconnected socket until the client goes away.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (conn, mut rx) = PrinterConnection::spawn(url, Duration::from_millis(10));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connecting));
        let TransportEvent::Connected(out) = next_event(&mut rx).await else {
            panic!("expected Connected");
        };
        out.send("ping".into()).await.unwrap();

        let TransportEvent::Message(text) = next_event(&mut rx).await else {
            panic!("expected Message");
        };
        assert_eq!(text, "pong");
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Disconnected));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connecting));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected(_)));

        conn.close();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_reports_failure() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let (_conn, mut rx) =
            PrinterConnection::spawn(format!("ws://{addr}/websocket"), Duration::from_secs(60));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connecting));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Failed(_)));
    }
}
