// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session registry: the set of printer sessions, keyed by mainboard id.
//
// The map itself sits behind a reader-writer lock; each session has its own
// mutex so frames for different printers are applied concurrently while
// frames for one printer are applied strictly in order. Session locks are
// never held while the map lock is being acquired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chitui_core::error::{ChituiError, Result};
use chitui_core::types::{ConnectionState, PrinterIdentity, PrinterSummary};
use chitui_sdcp::codec::Frame;
use chitui_sdcp::command::Command;

use crate::events::{BridgeEvent, EventBus};
use crate::session::{PrinterSession, SessionOutput};

type SharedSession = Arc<Mutex<PrinterSession>>;

#[derive(Default)]
struct Sessions {
    /// Registration order, for a stable printer list.
    order: Vec<String>,
    by_id: HashMap<String, SharedSession>,
}

pub struct SessionRegistry {
    sessions: RwLock<Sessions>,
    events: EventBus,
}

fn lock(session: &SharedSession) -> MutexGuard<'_, PrinterSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(Sessions::default()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn get(&self, device_id: &str) -> Option<SharedSession> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.by_id.get(device_id).cloned()
    }

    fn require(&self, device_id: &str) -> Result<SharedSession> {
        self.get(device_id)
            .ok_or_else(|| ChituiError::UnknownDevice(device_id.to_string()))
    }

    /// Add a session for `identity`. Fails with `DuplicateIdentity` if the
    /// id is already registered.
    pub fn register(&self, identity: PrinterIdentity) -> Result<()> {
        {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions.by_id.contains_key(&identity.id) {
                return Err(ChituiError::DuplicateIdentity(identity.id));
            }
            info!(device_id = %identity.id, address = %identity.address, name = %identity.name, "registering printer");
            sessions.order.push(identity.id.clone());
            sessions
                .by_id
                .insert(identity.id.clone(), Arc::new(Mutex::new(PrinterSession::new(identity))));
        }
        self.publish_printers();
        Ok(())
    }

    /// Register `identity` unless it already exists. Returns whether a new
    /// session was created.
    pub fn get_or_create(&self, identity: PrinterIdentity) -> bool {
        self.register(identity).is_ok()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).order.clone()
    }

    /// Tear down a session. Its pending commands fail with `SessionRemoved`.
    pub fn remove(&self, device_id: &str) -> Result<PrinterIdentity> {
        let session = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let session = sessions
                .by_id
                .remove(device_id)
                .ok_or_else(|| ChituiError::UnknownDevice(device_id.to_string()))?;
            sessions.order.retain(|id| id != device_id);
            session
        };

        let identity = {
            let mut session = lock(&session);
            let id = device_id.to_string();
            session.fail_all_pending(|| ChituiError::SessionRemoved(id.clone()));
            // Every state may move to Disconnected.
            let _ = session.set_state(ConnectionState::Disconnected);
            session.identity().clone()
        };
        info!(device_id, "printer removed");
        self.publish_printers();
        Ok(identity)
    }

    /// Apply `frame` to its session and publish the resulting events. Returns
    /// follow-up commands the caller should send.
    pub fn route(&self, device_id: &str, frame: Frame, now: Instant) -> Result<Vec<Command>> {
        let Some(session) = self.get(device_id) else {
            warn!(device_id, kind = %frame.kind(), "frame for unknown device dropped");
            return Err(ChituiError::UnknownDevice(device_id.to_string()));
        };

        let mut session = lock(&session);
        session.reap_timeouts(now);
        let mut requests = Vec::new();
        for output in session.apply_frame(frame, now) {
            match output {
                SessionOutput::Event(event) => self.events.publish(event),
                SessionOutput::Request(command) => requests.push(command),
            }
        }
        Ok(requests)
    }

    /// Record a transport state change for `device_id`.
    pub fn set_connection_state(&self, device_id: &str, state: ConnectionState) -> Result<()> {
        let changed = self.with_session(device_id, |session| {
            let before = session.state();
            session.set_state(state).map(|()| before != state)
        })??;
        if changed {
            self.publish_printers();
        }
        Ok(())
    }

    /// Install a freshly opened socket's writer and mark the session
    /// connected.
    pub fn attach(&self, device_id: &str, outbound: mpsc::Sender<String>) -> Result<()> {
        self.with_session(device_id, |session| session.attach_outbound(outbound))??;
        self.publish_printers();
        Ok(())
    }

    /// Summaries of every session in registration order.
    pub fn snapshot_all(&self) -> Vec<PrinterSummary> {
        let sessions: Vec<SharedSession> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions
                .order
                .iter()
                .filter_map(|id| sessions.by_id.get(id).cloned())
                .collect()
        };
        sessions.iter().map(|s| lock(s).summary()).collect()
    }

    pub fn summary(&self, device_id: &str) -> Result<PrinterSummary> {
        self.with_session(device_id, |session| session.summary())
    }

    /// Fail expired pending commands across all sessions. Returns how many
    /// were reaped.
    pub fn reap_timeouts(&self, now: Instant) -> usize {
        let sessions: Vec<SharedSession> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions.by_id.values().cloned().collect()
        };
        let reaped: usize = sessions.iter().map(|s| lock(s).reap_timeouts(now).len()).sum();
        if reaped > 0 {
            debug!(reaped, "reaped timed-out commands");
        }
        reaped
    }

    /// Whether the printer's cached listings contain `filename`.
    pub fn has_file(&self, device_id: &str, filename: &str) -> Result<bool> {
        self.with_session(device_id, |session| session.has_file(filename))
    }

    /// Drop the printer's cached listings at and below `location`.
    pub fn forget_files(&self, device_id: &str, location: &str) -> Result<()> {
        self.with_session(device_id, |session| session.forget_files_under(location))
    }

    /// Run `f` with exclusive access to one session.
    pub(crate) fn with_session<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut PrinterSession) -> R,
    ) -> Result<R> {
        let session = self.require(device_id)?;
        let mut guard = lock(&session);
        Ok(f(&mut guard))
    }

    /// Publish the aggregate printer list.
    pub fn publish_printers(&self) {
        self.events.publish(BridgeEvent::Printers {
            printers: self.snapshot_all(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use chitui_sdcp::codec::{FrameBody, decode};

    fn identity(id: &str) -> PrinterIdentity {
        PrinterIdentity {
            id: id.into(),
            connection_id: format!("conn-{id}"),
            name: format!("Printer {id}"),
            brand: "ELEGOO".into(),
            model: "Mars 5".into(),
            address: "10.0.0.2".into(),
            protocol_version: None,
            firmware_version: None,
            manual: false,
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(EventBus::new(64))
    }

    fn connect(registry: &SessionRegistry, id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        registry.set_connection_state(id, ConnectionState::Connecting).unwrap();
        registry.attach(id, tx).unwrap();
        rx
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = registry();
        registry.register(identity("a")).unwrap();
        assert!(matches!(
            registry.register(identity("a")),
            Err(ChituiError::DuplicateIdentity(id)) if id == "a"
        ));
        assert!(!registry.get_or_create(identity("a")));
        assert!(registry.get_or_create(identity("b")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn snapshot_keeps_insertion_order() {
        let registry = registry();
        for id in ["zeta", "alpha", "mid"] {
            registry.register(identity(id)).unwrap();
        }
        registry.remove("alpha").unwrap();
        registry.register(identity("alpha")).unwrap();
        let ids: Vec<String> = registry.snapshot_all().into_iter().map(|s| s.identity.id).collect();
        assert_eq!(ids, ["zeta", "mid", "alpha"]);
    }

    #[test]
    fn routing_to_unknown_device_is_an_error_not_a_panic() {
        let registry = registry();
        let frame = decode(r#"{"Status":{"CurrentStatus":[0]},"Topic":"sdcp/status/ghost"}"#).unwrap();
        assert!(matches!(
            registry.route("ghost", frame, Instant::now()),
            Err(ChituiError::UnknownDevice(_))
        ));
    }

    #[test]
    fn route_publishes_in_arrival_order() {
        let registry = registry();
        registry.register(identity("a")).unwrap();
        let mut sub = registry.events().subscribe();

        for layer in [1, 2, 3] {
            let raw = format!(
                r#"{{"Status":{{"CurrentStatus":[0],"PrintInfo":{{"CurrentLayer":{layer}}}}},"Topic":"sdcp/status/a"}}"#
            );
            registry.route("a", decode(&raw).unwrap(), Instant::now()).unwrap();
        }

        for layer in [1, 2, 3] {
            let Some(BridgeEvent::Status { snapshot, .. }) = sub.try_recv() else {
                panic!("expected status event");
            };
            assert_eq!(snapshot.print_info.and_then(|p| p.current_layer), Some(layer));
        }
    }

    #[test]
    fn route_returns_follow_up_requests() {
        let registry = registry();
        registry.register(identity("a")).unwrap();
        let frame = Frame {
            device_id: "a".into(),
            correlation_id: None,
            timestamp: None,
            body: FrameBody::FileList(vec![serde_json::from_str(r#"{"name":"/local/dir","type":0}"#).unwrap()]),
        };
        let cmds = registry.route("a", frame, Instant::now()).unwrap();
        assert_eq!(cmds, vec![Command::ListFiles { path: "/local/dir".into() }]);
    }

    #[tokio::test]
    async fn remove_fails_pending_with_session_removed() {
        let registry = registry();
        registry.register(identity("a")).unwrap();
        let _rx = connect(&registry, "a");
        let (_, result) = registry
            .with_session("a", |s| s.register_pending(Command::Stop, Instant::now(), Duration::from_secs(5)))
            .unwrap();

        let mut sub = registry.events().subscribe();
        registry.remove("a").unwrap();
        assert!(matches!(result.await.unwrap(), Err(ChituiError::SessionRemoved(_))));
        assert!(matches!(sub.try_recv(), Some(BridgeEvent::Printers { printers }) if printers.is_empty()));
        assert!(matches!(registry.remove("a"), Err(ChituiError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn reap_spans_all_sessions() {
        let registry = registry();
        let t0 = Instant::now();
        let mut receivers = Vec::new();
        for id in ["a", "b"] {
            registry.register(identity(id)).unwrap();
            receivers.push(connect(&registry, id));
            registry
                .with_session(id, |s| s.register_pending(Command::Pause, t0, Duration::from_millis(10)))
                .unwrap();
        }
        assert_eq!(registry.reap_timeouts(t0 + Duration::from_millis(5)), 0);
        assert_eq!(registry.reap_timeouts(t0 + Duration::from_millis(20)), 2);
    }

    #[test]
    fn connection_changes_republish_printer_list() {
        let registry = registry();
        registry.register(identity("a")).unwrap();
        let mut sub = registry.events().subscribe();
        registry.set_connection_state("a", ConnectionState::Connecting).unwrap();
        let Some(BridgeEvent::Printers { printers }) = sub.try_recv() else {
            panic!("expected printers event");
        };
        assert_eq!(printers[0].connection, ConnectionState::Connecting);

        // Repeating the same state is not a change.
        registry.set_connection_state("a", ConnectionState::Connecting).unwrap();
        assert!(sub.try_recv().is_none());

        assert!(matches!(
            registry.set_connection_state("a", ConnectionState::Disconnected),
            Ok(())
        ));
        assert!(matches!(
            registry.set_connection_state("missing", ConnectionState::Connecting),
            Err(ChituiError::UnknownDevice(_))
        ));
    }
}
