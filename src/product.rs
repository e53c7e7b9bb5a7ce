//! Target product description
//!
//! Everything the engine knows about the one application it removes:
//! display names, process name, install directory name, and the set of
//! product identifiers observed in the wild. Installers regenerate the
//! identifier across versions, so the built-in list is an optimization,
//! never a correctness assumption; the identity resolver falls back to a
//! registry scan when none of these match.

use std::io::{BufRead, BufReader, Read};
use uuid::Uuid;

/// Registry value compared against the display name during the fallback
/// identity scan.
pub const SHORTCUT_NAME_VALUE: &str = "ShortcutName";

/// Registry value holding a custom install directory.
pub const INSTALL_LOCATION_VALUE: &str = "InstallLocation";

/// Product identifiers previously observed in shipped installers, newest
/// first.
const BUILTIN_KNOWN_IDS: [&str; 3] = [
    "{7C9A2B44-0F61-4E0D-9D3B-5A1E8C7F2A90}",
    "{3E5D11A8-6B27-49C0-8F4E-D2A90B7C6E13}",
    "{B0F4C822-91D5-4A7E-B36C-40E7F1D5A268}",
];

/// Static description of the application being removed.
#[derive(Debug, Clone)]
pub struct TargetApp {
    /// Name shown in shortcuts and the programs list.
    pub display_name: String,
    /// Image name of the running application, for process matching.
    pub process_name: String,
    /// Directory name under the conventional install roots.
    pub install_dir_name: String,
    /// Publisher name, used in vendor registry paths.
    pub vendor: String,
    known_ids: Vec<Uuid>,
}

impl TargetApp {
    /// The product this tool is scoped to.
    pub fn nimbus_sync() -> Self {
        TargetApp {
            display_name: "Nimbus Sync".to_string(),
            process_name: "NimbusSync.exe".to_string(),
            install_dir_name: "Nimbus Sync".to_string(),
            vendor: "Nimbus Labs".to_string(),
            known_ids: BUILTIN_KNOWN_IDS
                .iter()
                .map(|s| Uuid::parse_str(s).expect("built-in id is well-formed"))
                .collect(),
        }
    }

    /// The ordered known-identifier set.
    pub fn known_ids(&self) -> &[Uuid] {
        &self.known_ids
    }

    /// Merge identifiers from a newline-separated external list.
    ///
    /// Performed once at initialization. Malformed entries are rejected
    /// per entry with a warning; the load itself never fails on bad data.
    /// Returns the number of identifiers added.
    pub fn extend_known_ids<R: Read>(&mut self, reader: R) -> std::io::Result<usize> {
        let mut added = 0;
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match Uuid::parse_str(trimmed) {
                Ok(id) => {
                    if !self.known_ids.contains(&id) {
                        self.known_ids.push(id);
                        added += 1;
                    }
                }
                Err(e) => {
                    log::warn!("ignoring malformed identifier {:?}: {}", trimmed, e);
                }
            }
        }
        Ok(added)
    }
}

/// Render an identifier in its registry key form: braced, uppercase,
/// hyphenated.
pub fn registry_key_name(id: &Uuid) -> String {
    format!("{{{}}}", id.hyphenated().to_string().to_uppercase())
}
