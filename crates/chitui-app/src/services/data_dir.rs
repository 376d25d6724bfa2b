// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data folder preparation.

use std::path::PathBuf;

use chitui_core::config::BridgeConfig;
use chitui_core::error::Result;

/// Create the data folder and the upload staging folder inside it.
///
/// Returns the staging folder.
pub fn prepare(config: &BridgeConfig) -> Result<PathBuf> {
    std::fs::create_dir_all(&config.data_folder)?;
    let staging = config.staging_folder();
    std::fs::create_dir_all(&staging)?;
    Ok(staging)
}
