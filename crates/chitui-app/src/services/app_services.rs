// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application services: the relay plus the persisted printer settings.
//
// Cheaply cloneable so it can be handed to background tasks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chitui_core::config::{BridgeConfig, Settings};
use chitui_core::error::{ChituiError, Result};
use chitui_core::types::PrinterIdentity;
use chitui_relay::{Bridge, BridgeEvent};
use chitui_sdcp::discovery;

use super::data_dir;

#[derive(Clone)]
pub struct AppServices {
    pub bridge: Bridge,
    settings: Arc<Mutex<Settings>>,
    settings_path: PathBuf,
}

impl AppServices {
    /// Prepare the data folder, load settings, and build the relay.
    pub fn init(config: BridgeConfig) -> Result<Self> {
        let staging = data_dir::prepare(&config)?;
        let settings_path = config.settings_path();
        let settings = Settings::load(&settings_path);
        info!(
            data = %config.data_folder.display(),
            staging = %staging.display(),
            saved_printers = settings.printers.len(),
            "services initialised"
        );
        Ok(Self {
            bridge: Bridge::new(config),
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply `f` to the settings and persist the result.
    fn update_settings<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> Result<R> {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut settings);
        settings.save(&self.settings_path)?;
        Ok(out)
    }

    // -- Startup ------------------------------------------------------------

    /// Discover (when enabled or nothing is saved yet), then connect every
    /// enabled saved printer. Returns how many printers were connected.
    pub async fn start(&self) -> usize {
        let settings = self.settings();
        if settings.auto_discover || settings.printers.is_empty() {
            if let Err(e) = self.discover().await {
                warn!(error = %e, "startup discovery failed");
            }
        }
        self.connect_enabled()
    }

    /// Register every enabled saved printer that is not already connected.
    pub fn connect_enabled(&self) -> usize {
        let mut connected = 0;
        for identity in self.settings().enabled_identities() {
            if self.bridge.registry().contains(&identity.id) {
                continue;
            }
            match self.bridge.add_printer(identity) {
                Ok(()) => connected += 1,
                Err(e) => warn!(error = %e, "could not add saved printer"),
            }
        }
        connected
    }

    // -- Discovery ----------------------------------------------------------

    /// Broadcast for printers and remember whatever answers.
    pub async fn discover(&self) -> Result<Vec<PrinterIdentity>> {
        let found = discovery::discover(self.bridge.config().discovery_timeout).await?;
        info!(count = found.len(), "discovery finished");
        self.remember(&found)?;
        Ok(found)
    }

    /// Persist identities, keeping each printer's enabled flag.
    pub fn remember(&self, identities: &[PrinterIdentity]) -> Result<()> {
        if identities.is_empty() {
            return Ok(());
        }
        self.update_settings(|settings| {
            for identity in identities {
                settings.remember(identity);
            }
        })
    }

    /// Add a printer by IP address, persist it, and connect.
    pub fn add_manual(&self, ip: &str, name: Option<&str>) -> Result<PrinterIdentity> {
        let identity = discovery::manual_identity(ip, name);
        if self.settings().printers.contains_key(&identity.id) {
            return Err(ChituiError::DuplicateIdentity(identity.id));
        }
        self.remember(std::slice::from_ref(&identity))?;
        self.bridge.add_printer(identity.clone())?;
        Ok(identity)
    }

    /// Enable or disable a saved printer, connecting or disconnecting it.
    pub fn set_enabled(&self, device_id: &str, enabled: bool) -> Result<()> {
        let identity = self.update_settings(|settings| {
            settings.printers.get_mut(device_id).map(|saved| {
                saved.enabled = enabled;
                saved.to_identity(device_id)
            })
        })?;
        let identity = identity.ok_or_else(|| ChituiError::UnknownDevice(device_id.to_string()))?;

        let connected = self.bridge.registry().contains(device_id);
        match (enabled, connected) {
            (true, false) => self.bridge.add_printer(identity)?,
            (false, true) => {
                self.bridge.remove_printer(device_id)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Replace the saved settings wholesale, then connect newly enabled
    /// printers and drop the ones no longer enabled.
    pub fn replace_settings(&self, settings: Settings) -> Result<()> {
        let keep: Vec<String> = settings.enabled_identities().into_iter().map(|p| p.id).collect();
        self.update_settings(|current| *current = settings)?;
        for printer in self.bridge.printers() {
            let id = printer.identity.id;
            if !keep.contains(&id) {
                if let Err(e) = self.bridge.remove_printer(&id) {
                    warn!(device_id = %id, error = %e, "could not drop printer");
                }
            }
        }
        let connected = self.connect_enabled();
        debug!(connected, "settings replaced");
        Ok(())
    }

    /// Forget a saved printer entirely.
    pub fn forget(&self, device_id: &str) -> Result<()> {
        let removed = self.update_settings(|settings| settings.printers.remove(device_id))?;
        if self.bridge.registry().contains(device_id) {
            self.bridge.remove_printer(device_id)?;
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(ChituiError::UnknownDevice(device_id.to_string())),
        }
    }

    // -- Event log ----------------------------------------------------------

    /// Log every fan-out event until the relay goes away.
    pub fn spawn_event_log(&self) -> JoinHandle<()> {
        let mut events = self.bridge.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        })
    }
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Printers { printers } => {
            let connected = printers
                .iter()
                .filter(|p| p.connection == chitui_core::types::ConnectionState::Connected)
                .count();
            info!(total = printers.len(), connected, "printers");
        }
        BridgeEvent::Error { device_id, code, message } => {
            warn!(%device_id, code, message = message.as_deref().unwrap_or(""), "printer error");
        }
        BridgeEvent::Notice { device_id, message } => info!(%device_id, %message, "notice"),
        other => match serde_json::to_string(other) {
            Ok(json) => debug!(event = other.name(), %json, "event"),
            Err(e) => debug!(event = other.name(), error = %e, "event not serialisable"),
        },
    }
}
