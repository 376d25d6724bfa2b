// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Relay configuration and persisted printer settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ChituiError, Result};
use crate::types::PrinterIdentity;

/// Name of the settings file inside the data folder.
pub const SETTINGS_FILE_NAME: &str = "chitui_settings.json";

/// Runtime configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Port the dashboard-facing surface listens on.
    pub port: u16,
    /// Verbose logging.
    pub debug: bool,
    /// Folder holding settings and staged uploads.
    pub data_folder: PathBuf,
    /// Mount point of the emulated USB mass-storage device.
    pub usb_gadget_folder: PathBuf,
    /// How long to collect discovery replies.
    pub discovery_timeout: Duration,
    /// Timeout applied to commands issued without an explicit one.
    pub command_timeout: Duration,
    /// Interval of the pending-command reaper.
    pub reap_interval: Duration,
    /// Client-side upload percentage at which phase-2 monitoring starts.
    pub phase_two_threshold: u8,
    /// Chunk size for network uploads to the printer.
    pub upload_chunk_size: usize,
    /// Accepted file extensions (lower case, without the dot).
    pub allowed_extensions: Vec<String>,
    /// Delays between file-list detection attempts after a transfer.
    pub detection_delays: Vec<Duration>,
    /// How long each detection attempt waits for listings to come back.
    pub detection_listing_wait: Duration,
    /// Capacity of the event fan-out channel.
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"));
        Self {
            port: 8080,
            debug: false,
            data_folder: home.join(".chitui"),
            usb_gadget_folder: PathBuf::from("/mnt/usb_share"),
            discovery_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_secs(1),
            phase_two_threshold: 50,
            upload_chunk_size: 1024 * 1024,
            allowed_extensions: vec!["ctb".into(), "goo".into(), "prz".into()],
            detection_delays: [2, 3, 5, 7, 10].into_iter().map(Duration::from_secs).collect(),
            detection_listing_wait: Duration::from_millis(1500),
            event_capacity: 256,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `PORT`, `DEBUG`, `USB_GADGET_PATH`, and
    /// `CHITUI_DATA`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(p) => config.port = p,
                Err(e) => warn!(value = %port, error = %e, "ignoring invalid PORT"),
            }
        }
        if lookup("DEBUG").is_some_and(|v| !v.is_empty()) {
            config.debug = true;
        }
        if let Some(path) = lookup("USB_GADGET_PATH") {
            config.usb_gadget_folder = PathBuf::from(path);
        }
        if let Some(path) = lookup("CHITUI_DATA") {
            config.data_folder = PathBuf::from(path);
        }
        config
    }

    /// Location of the persisted settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.data_folder.join(SETTINGS_FILE_NAME)
    }

    /// Folder uploads are staged in when the USB gadget is unavailable.
    pub fn staging_folder(&self) -> PathBuf {
        self.data_folder.join("uploads")
    }

    /// Whether `filename` carries one of the accepted extensions.
    pub fn is_allowed_file(&self, filename: &str) -> bool {
        filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .is_some_and(|ext| self.allowed_extensions.iter().any(|a| *a == ext))
    }
}

/// A printer remembered across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPrinter {
    pub ip: String,
    pub name: String,
    #[serde(default = "SavedPrinter::unknown")]
    pub model: String,
    #[serde(default = "SavedPrinter::unknown")]
    pub brand: String,
    #[serde(default = "SavedPrinter::enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub manual: bool,
}

impl SavedPrinter {
    fn unknown() -> String {
        "Unknown".into()
    }

    fn enabled_default() -> bool {
        true
    }

    /// Rebuild an identity for a saved printer.
    ///
    /// Saved printers do not keep the SDCP connection id, so the mainboard
    /// id stands in for it.
    pub fn to_identity(&self, id: &str) -> PrinterIdentity {
        PrinterIdentity {
            id: id.to_string(),
            connection_id: id.to_string(),
            name: self.name.clone(),
            brand: self.brand.clone(),
            model: self.model.clone(),
            address: self.ip.clone(),
            protocol_version: None,
            firmware_version: None,
            manual: self.manual,
        }
    }
}

/// Settings persisted as JSON in the data folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub printers: BTreeMap<String, SavedPrinter>,
    #[serde(default)]
    pub auto_discover: bool,
}

impl Settings {
    /// Load settings, falling back to defaults when the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(settings)) => {
                info!(printers = settings.printers.len(), "loaded settings");
                settings
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Write settings atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| ChituiError::Settings(format!("no parent folder for {}", path.display())))?;
        std::fs::create_dir_all(parent)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Record a discovered printer, keeping the user's enabled flag.
    pub fn remember(&mut self, identity: &PrinterIdentity) {
        let enabled = self
            .printers
            .get(&identity.id)
            .map(|p| p.enabled)
            .unwrap_or(true);
        self.printers.insert(
            identity.id.clone(),
            SavedPrinter {
                ip: identity.address.clone(),
                name: identity.name.clone(),
                model: identity.model.clone(),
                brand: identity.brand.clone(),
                enabled,
                manual: identity.manual,
            },
        );
    }

    /// Saved printers that should be connected on start, in id order.
    pub fn enabled_identities(&self) -> Vec<PrinterIdentity> {
        self.printers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, p)| p.to_identity(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> PrinterIdentity {
        PrinterIdentity {
            id: id.into(),
            connection_id: format!("conn-{id}"),
            name: "Saturn".into(),
            brand: "ELEGOO".into(),
            model: "Saturn 4 Ultra".into(),
            address: "192.168.1.50".into(),
            protocol_version: Some("V3.0.0".into()),
            firmware_version: None,
            manual: false,
        }
    }

    #[test]
    fn env_overrides_defaults() {
        let config = BridgeConfig::from_lookup(|key| match key {
            "PORT" => Some("9090".into()),
            "DEBUG" => Some("1".into()),
            "USB_GADGET_PATH" => Some("/srv/gadget".into()),
            _ => None,
        });
        assert_eq!(config.port, 9090);
        assert!(config.debug);
        assert_eq!(config.usb_gadget_folder, PathBuf::from("/srv/gadget"));
    }

    #[test]
    fn invalid_port_keeps_default() {
        let config = BridgeConfig::from_lookup(|key| (key == "PORT").then(|| "nope".into()));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn extension_whitelist_is_case_insensitive() {
        let config = BridgeConfig::default();
        assert!(config.is_allowed_file("benchy.CTB"));
        assert!(config.is_allowed_file("a.b.goo"));
        assert!(!config.is_allowed_file("model.stl"));
        assert!(!config.is_allowed_file("ctb"));
    }

    #[test]
    fn default_detection_schedule() {
        let config = BridgeConfig::default();
        let secs: Vec<u64> = config.detection_delays.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![2, 3, 5, 7, 10]);
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let mut settings = Settings::default();
        settings.remember(&identity("abc"));
        settings.auto_discover = true;
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn remember_preserves_disabled_flag() {
        let mut settings = Settings::default();
        settings.remember(&identity("abc"));
        settings.printers.get_mut("abc").unwrap().enabled = false;
        settings.remember(&identity("abc"));

        assert!(!settings.printers["abc"].enabled);
        assert!(settings.enabled_identities().is_empty());
    }

    #[test]
    fn saved_printer_defaults_missing_fields() {
        let settings: Settings =
            serde_json::from_str(r#"{"printers":{"x":{"ip":"10.0.0.2","name":"P"}}}"#).unwrap();
        let saved = &settings.printers["x"];
        assert_eq!(saved.model, "Unknown");
        assert!(saved.enabled);
        assert!(!settings.auto_discover);
        assert_eq!(settings.enabled_identities()[0].address, "10.0.0.2");
    }
}
